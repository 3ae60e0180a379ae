/*!
 * Storage Engine
 *
 * Defines the contracts the server and cluster layers depend on
 * (`Database`, `Connection`) and the standalone engine: a fixed set of
 * logical databases, each with its own dictionary, sharing one command table
 * and one AOF.
 */

use crate::aof::{self, Aof};
use crate::command::CommandTable;
use crate::config::ServerProperties;
use crate::error::{panic_message, Error, Result};
use crate::protocol::{CmdLine, Reply};
use crate::storage::Dict;
use bytes::Bytes;
use log::{info, warn};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Number of logical databases when the config does not say otherwise
pub const DEFAULT_DATABASES: usize = 16;

/// Per-client state seen by the engine
pub trait Connection {
    /// Currently selected logical database
    fn db_index(&self) -> usize;
    fn select_db(&mut self, index: usize);
    /// Send raw reply bytes to the client
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Contract every storage engine (standalone or clustered) fulfils
pub trait Database: Send + Sync {
    /// Execute one command line on behalf of `conn`. Always yields a reply.
    fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply;
    /// Release any per-client resources once `conn` disconnects
    fn after_client_close(&self, conn: &dyn Connection);
    /// Flush and release engine resources
    fn close(&self);
}

/// One logical database
pub struct Db {
    index: usize,
    data: Dict,
    aof: Option<Arc<Aof>>,
    /// Single-key writes hold it shared, multi-key writes exclusively, so
    /// every mutation reaches the AOF in the order it hit the dictionary
    write_order: RwLock<()>,
}

impl Db {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            data: Dict::default(),
            aof: None,
            write_order: RwLock::new(()),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn data(&self) -> &Dict {
        &self.data
    }

    /// Queue a mutating command for persistence, tagged with this db's index
    pub fn add_aof(&self, line: CmdLine) {
        if let Some(aof) = &self.aof {
            aof.add(self.index, line);
        }
    }

    /// Guard for a write confined to one key. The key's own ordering comes
    /// from the dictionary shard lock held while the entry is logged.
    pub fn single_key_write(&self) -> RwLockReadGuard<'_, ()> {
        self.write_order.read()
    }

    /// Guard for a write spanning several keys or the whole dictionary
    pub fn multi_key_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.write_order.write()
    }

    /// Look the command up, validate its arity and run it
    pub fn exec(&self, table: &CommandTable, cmd_line: &[Bytes]) -> Reply {
        let Some(name) = cmd_line.first() else {
            return Reply::error("ERR empty command");
        };
        let Some(cmd) = table.lookup(name) else {
            let name = String::from_utf8_lossy(name).to_lowercase();
            return Error::Command(format!("ERR unknown command '{}'", name)).to_reply();
        };
        if !cmd.accepts(cmd_line.len()) {
            let name = String::from_utf8_lossy(name).to_lowercase();
            return Error::Command(format!(
                "ERR wrong number of arguments for '{}' command",
                name
            ))
            .to_reply();
        }
        (cmd.exec)(self, &cmd_line[1..])
    }
}

/// Single-node engine holding every logical database
pub struct StandaloneDatabase {
    dbs: Vec<Db>,
    table: CommandTable,
    aof: Option<Arc<Aof>>,
}

impl StandaloneDatabase {
    /// Build the engine described by `props`
    ///
    /// With append-only enabled, the existing log is replayed before the
    /// writer is attached, so replayed commands are not logged a second time.
    pub fn new(props: &ServerProperties) -> Result<Self> {
        let mut database = Self::with_table(props.databases, CommandTable::builtin());
        if props.append_only {
            let stats = aof::load(&props.append_filename, &database);
            info!(
                "aof replay of {} finished: {} applied, {} skipped",
                props.append_filename.display(),
                stats.applied,
                stats.skipped
            );
            let aof = Arc::new(Aof::open(&props.append_filename, props.append_fsync)?);
            database.attach_aof(aof);
        }
        Ok(database)
    }

    /// Memory-only engine with the built-in commands
    pub fn in_memory(databases: usize) -> Self {
        Self::with_table(databases, CommandTable::builtin())
    }

    /// Memory-only engine using a caller-supplied command table
    pub fn with_table(databases: usize, table: CommandTable) -> Self {
        let n = if databases == 0 {
            DEFAULT_DATABASES
        } else {
            databases
        };
        Self {
            dbs: (0..n).map(Db::new).collect(),
            table,
            aof: None,
        }
    }

    /// Route every database's mutations into `aof`
    pub fn attach_aof(&mut self, aof: Arc<Aof>) {
        for db in &mut self.dbs {
            db.aof = Some(aof.clone());
        }
        self.aof = Some(aof);
    }

    pub fn aof(&self) -> Option<&Arc<Aof>> {
        self.aof.as_ref()
    }

    pub fn db(&self, index: usize) -> Option<&Db> {
        self.dbs.get(index)
    }

    fn exec_select(&self, conn: &mut dyn Connection, arg: &[u8]) -> Reply {
        let index = match std::str::from_utf8(arg).ok().and_then(|s| s.parse::<usize>().ok()) {
            Some(i) => i,
            None => return Reply::error("ERR invalid DB index"),
        };
        if index >= self.dbs.len() {
            return Reply::error("ERR DB index is out of range");
        }
        conn.select_db(index);
        Reply::Ok
    }

    fn exec_unguarded(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
        let Some(name) = cmd_line.first() else {
            return Reply::error("ERR empty command");
        };
        if name.eq_ignore_ascii_case(b"select") {
            if cmd_line.len() != 2 {
                return Reply::arg_num_error("select");
            }
            return self.exec_select(conn, &cmd_line[1]);
        }
        match self.dbs.get(conn.db_index()) {
            Some(db) => db.exec(&self.table, cmd_line),
            None => Reply::error("ERR DB index is out of range"),
        }
    }
}

impl Database for StandaloneDatabase {
    fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
        match panic::catch_unwind(AssertUnwindSafe(|| self.exec_unguarded(conn, cmd_line))) {
            Ok(reply) => reply,
            Err(cause) => {
                warn!("command panicked: {}", panic_message(cause.as_ref()));
                Error::Internal.to_reply()
            }
        }
    }

    fn after_client_close(&self, _conn: &dyn Connection) {}

    fn close(&self) {
        if let Some(aof) = &self.aof {
            aof.close();
        }
    }
}

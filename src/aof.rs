/*!
 * Append-Only File (AOF) Persistence
 *
 * Every mutating command is queued to a single background writer that
 * appends it to the log in RESP multi-bulk form. The writer emits a synthetic
 * `SELECT <db>` whenever the target database changes, so the file replays
 * without any side metadata. At startup the log is decoded with the regular
 * protocol parser and fed back through the storage engine.
 */

use crate::database::{Connection, Database};
use crate::error::{Error, Result};
use crate::parser::Parser;
use crate::protocol::{cmd_line, encode_cmd_line, CmdLine, Reply};
use bytes::BytesMut;
use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of the producer queue. Once full, `Aof::add` blocks until the
/// writer catches up; entries are never silently discarded for lack of room.
pub const AOF_QUEUE_SIZE: usize = 1 << 16;

/// When the writer forces data to stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendFsync {
    /// `sync_data` after every entry
    Always,
    /// `sync_data` at most once per second
    #[default]
    EverySec,
    /// Leave it to the operating system
    No,
}

impl FromStr for AppendFsync {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(AppendFsync::Always),
            "everysec" => Ok(AppendFsync::EverySec),
            "no" => Ok(AppendFsync::No),
            other => Err(Error::Config(format!("invalid appendfsync '{}'", other))),
        }
    }
}

/// One queued mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AofEntry {
    pub cmd_line: CmdLine,
    pub db_index: usize,
}

/// Exclusive hold on the write path; no entry is appended while it lives
pub type AofPause<'a> = RwLockWriteGuard<'a, ()>;

/// Handle to the append-only log
///
/// Producers call [`Aof::add`] from any thread. A single `aof-writer`
/// thread owns the file and appends entries strictly in enqueue order.
pub struct Aof {
    /// `None` once the producer side has been closed
    tx: RwLock<Option<Sender<AofEntry>>>,
    /// Shared by the writer for each entry, exclusive for maintenance
    pausing: Arc<RwLock<()>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Aof {
    /// Open (or create) the log at `path` and start the writer thread
    pub fn open(path: impl AsRef<Path>, fsync: AppendFsync) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        // an existing log may end in any db, so the first entry must select
        let start_db = if file.metadata()?.len() == 0 { Some(0) } else { None };

        let (tx, rx) = bounded::<AofEntry>(AOF_QUEUE_SIZE);
        let pausing = Arc::new(RwLock::new(()));
        let writer_pausing = pausing.clone();

        let writer = std::thread::Builder::new()
            .name("aof-writer".into())
            .spawn(move || run_writer(file, start_db, rx, writer_pausing, fsync))?;

        info!("aof enabled at {} (fsync {:?})", path.display(), fsync);
        Ok(Self {
            tx: RwLock::new(Some(tx)),
            pausing,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Queue a command executed against `db_index`
    ///
    /// Blocks while the queue is full. After [`Aof::close`] the entry is
    /// dropped with a warning.
    pub fn add(&self, db_index: usize, cmd_line: CmdLine) {
        let tx = self.tx.read();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(AofEntry { cmd_line, db_index }).is_err() {
                    warn!("aof writer has stopped, dropping entry");
                }
            }
            None => warn!("aof is closed, dropping entry"),
        }
    }

    /// Stop appends until the returned guard is dropped
    ///
    /// Used by maintenance such as a log rewrite: while the guard is held the
    /// writer cannot complete an append. Producers keep queueing meanwhile.
    pub fn pause(&self) -> AofPause<'_> {
        self.pausing.write()
    }

    /// Close the producer side, wait for every queued entry to reach the
    /// file, then release it. Safe to call more than once.
    pub fn close(&self) {
        if self.tx.write().take().is_none() {
            return;
        }
        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                error!("aof writer thread panicked");
            }
        }
        info!("aof closed");
    }
}

impl Drop for Aof {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writer loop: drain the queue in order until every producer is gone
fn run_writer(
    mut file: File,
    mut current_db: Option<usize>,
    rx: Receiver<AofEntry>,
    pausing: Arc<RwLock<()>>,
    fsync: AppendFsync,
) {
    let mut last_sync = Instant::now();
    let mut buf = BytesMut::with_capacity(4096);

    for entry in rx.iter() {
        let _shared = pausing.read();

        buf.clear();
        let switching = current_db != Some(entry.db_index);
        if switching {
            let index = entry.db_index.to_string();
            encode_cmd_line(&cmd_line(&["SELECT", &index]), &mut buf);
        }
        encode_cmd_line(&entry.cmd_line, &mut buf);

        // SELECT and command go out in one write; on failure both are dropped
        // and the writer still believes the previous db is selected
        if let Err(e) = file.write_all(&buf).and_then(|_| file.flush()) {
            warn!("aof write failed, entry dropped: {}", e);
            continue;
        }
        if switching {
            current_db = Some(entry.db_index);
        }

        let sync_now = match fsync {
            AppendFsync::Always => true,
            AppendFsync::EverySec => last_sync.elapsed() >= Duration::from_secs(1),
            AppendFsync::No => false,
        };
        if sync_now {
            if let Err(e) = file.sync_data() {
                warn!("aof fsync failed: {}", e);
            }
            last_sync = Instant::now();
        }
    }

    if let Err(e) = file.sync_data() {
        warn!("aof final fsync failed: {}", e);
    }
    debug!("aof writer drained");
}

//
// Replay
//

/// Connection stand-in used while replaying; only tracks the selected db
#[derive(Debug, Default)]
pub struct ReplayConn {
    db: usize,
}

impl Connection for ReplayConn {
    fn db_index(&self) -> usize {
        self.db
    }

    fn select_db(&mut self, index: usize) {
        self.db = index;
    }

    fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Outcome of a replay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Commands executed successfully (including SELECTs)
    pub applied: usize,
    /// Frames that failed to decode or whose execution returned an error
    pub skipped: usize,
}

/// Replay the whole log at `path` into `db`. A missing file is an empty log.
pub fn load(path: impl AsRef<Path>, db: &dyn Database) -> ReplayStats {
    load_limited(path, 0, db)
}

/// Replay at most the first `max_bytes` of the log (`0` means all of it)
pub fn load_limited(path: impl AsRef<Path>, max_bytes: u64, db: &dyn Database) -> ReplayStats {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ReplayStats::default(),
        Err(e) => {
            warn!("cannot open aof {}: {}", path.display(), e);
            return ReplayStats::default();
        }
    };
    if max_bytes > 0 {
        replay(file.take(max_bytes), db)
    } else {
        replay(file, db)
    }
}

/// Decode `reader` and execute every command it holds
///
/// Decode failures and error replies are logged and skipped. A truncated
/// trailing entry ends replay without being applied.
pub fn replay(reader: impl Read, db: &dyn Database) -> ReplayStats {
    let mut conn = ReplayConn::default();
    let mut stats = ReplayStats::default();

    for payload in Parser::new(reader) {
        match payload {
            Ok(Reply::MultiBulk(args)) => {
                let Some(line) = args.into_iter().collect::<Option<CmdLine>>() else {
                    error!("aof entry holds a null argument, skipped");
                    stats.skipped += 1;
                    continue;
                };
                match db.exec(&mut conn, &line) {
                    Reply::Error(msg) => {
                        error!("aof exec error: {}", msg);
                        stats.skipped += 1;
                    }
                    _ => stats.applied += 1,
                }
            }
            Ok(other) => {
                error!("aof requires multi bulk entries, got {:?}", other);
                stats.skipped += 1;
            }
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("aof ends with a truncated entry, discarded");
            }
            Err(e) => {
                error!("aof parse error: {}", e);
                stats.skipped += 1;
            }
        }
    }
    stats
}

/*!
 * Cluster Coordination
 *
 * Presents several independent nodes as one key space. Each node owns the
 * keys the consistent-hash ring assigns to it; a command arriving at any
 * node is executed locally, relayed to the owning peer, or broadcast to
 * every node, according to an immutable routing table. Clients never see
 * the difference.
 */

use crate::config::ServerProperties;
use crate::database::{Connection, Database};
use crate::error::{panic_message, Error, Result};
use crate::pool::PeerPool;
use crate::protocol::{cmd_line, Reply};
use crate::ring::NodeMap;
use bytes::Bytes;
use hashbrown::HashMap;
use log::{info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Prefix a node puts in front of a broadcast command relayed to a peer.
/// The peer strips it and runs the rest on its local engine only.
pub const LOCAL_EXEC: &str = "_local";

/// Handler for one command in cluster mode. `cmd_line` includes the name.
pub type CmdFunc = fn(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply;

/// Lower-cased command name -> cluster handler
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, CmdFunc>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routing for every built-in command
    pub fn builtin() -> Self {
        let mut router = Self::new();
        // admin, never routed
        router.register("ping", exec_local);
        router.register("select", exec_local);
        router.register(LOCAL_EXEC, exec_relayed);

        // single key, executed by the key's owner
        for name in ["get", "set", "setnx", "getset", "strlen", "exists", "type"] {
            router.register(name, exec_by_key);
        }
        router.register("rename", exec_rename);
        router.register("renamenx", exec_rename);

        // cluster-wide
        router.register("del", exec_del);
        router.register("flushdb", exec_flushdb);
        router.register("keys", exec_keys);
        router
    }

    pub fn register(&mut self, name: &str, func: CmdFunc) {
        self.routes.insert(name.to_ascii_lowercase(), func);
    }

    pub fn lookup(&self, name: &str) -> Option<CmdFunc> {
        self.routes.get(name).copied()
    }
}

/// One node of the cluster, wrapping the local engine
pub struct ClusterDatabase {
    self_addr: String,
    /// Every node including self, in configuration order
    nodes: Vec<String>,
    ring: NodeMap,
    peers: HashMap<String, PeerPool>,
    db: Arc<dyn Database>,
    router: Router,
}

impl ClusterDatabase {
    /// Build the node described by `props` around the local engine `db`
    pub fn new(props: &ServerProperties, db: Arc<dyn Database>) -> Result<Self> {
        let self_addr = props
            .self_addr
            .clone()
            .ok_or_else(|| Error::Config("cluster mode requires 'self'".into()))?;

        let mut nodes: Vec<String> = props
            .peers
            .iter()
            .filter(|p| **p != self_addr)
            .cloned()
            .collect();
        let peers = nodes
            .iter()
            .map(|p| (p.clone(), PeerPool::new(p.clone(), props.peer_pool_size)))
            .collect();
        nodes.push(self_addr.clone());

        let mut ring = NodeMap::new(props.replicas);
        ring.add_nodes(&nodes);
        info!("cluster node {} started with {} nodes", self_addr, nodes.len());

        Ok(Self {
            self_addr,
            nodes,
            ring,
            peers,
            db,
            router: Router::builtin(),
        })
    }

    /// Replace the routing table
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn ring(&self) -> &NodeMap {
        &self.ring
    }

    pub fn local(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Owner of `key` on the ring
    pub fn owner(&self, key: &[u8]) -> Option<&str> {
        self.ring.pick_node(key)
    }

    /// Execute `cmd_line` on `peer`
    ///
    /// Self goes straight to the local engine. A remote peer first receives a
    /// `SELECT` for the caller's current database, then the command itself.
    /// The pooled connection is released on every path.
    pub fn relay(&self, peer: &str, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
        if peer == self.self_addr {
            return self.db.exec(conn, cmd_line);
        }
        match self.relay_remote(peer, conn.db_index(), cmd_line) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("relay to {} failed: {}", peer, e);
                e.to_reply()
            }
        }
    }

    fn relay_remote(&self, peer: &str, db_index: usize, cmd_line: &[Bytes]) -> Result<Reply> {
        let pool = self
            .peers
            .get(peer)
            .ok_or_else(|| Error::Relay(format!("no connection pool for {}", peer)))?;
        let mut client = pool.borrow()?;
        let to_relay_error = |e: Error| Error::Relay(format!("{}: {}", peer, e));

        let select = cmd_line_for_select(db_index);
        let selected = client.send(&select).map_err(to_relay_error)?;
        if selected.is_error() {
            return Ok(selected);
        }
        client.send(cmd_line).map_err(to_relay_error)
    }

    /// Run `cmd_line` on every node, self included
    ///
    /// Peers receive it wrapped in [`LOCAL_EXEC`] so they execute it on their
    /// own engine instead of broadcasting it again.
    pub fn broadcast(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> HashMap<String, Reply> {
        let mut wrapped = Vec::with_capacity(cmd_line.len() + 1);
        wrapped.push(Bytes::from_static(LOCAL_EXEC.as_bytes()));
        wrapped.extend_from_slice(cmd_line);

        let mut result = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let reply = if *node == self.self_addr {
                self.db.exec(conn, cmd_line)
            } else {
                self.relay(node, conn, &wrapped)
            };
            result.insert(node.clone(), reply);
        }
        result
    }

    /// Replies of a broadcast in node order, so reductions are deterministic
    fn ordered<'a>(&'a self, replies: &'a HashMap<String, Reply>) -> impl Iterator<Item = &'a Reply> {
        self.nodes.iter().filter_map(move |n| replies.get(n))
    }

    fn route(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
        let Some(name) = cmd_line.first() else {
            return Reply::error("ERR empty command");
        };
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        match self.router.lookup(&name) {
            Some(func) => func(self, conn, cmd_line),
            None => Error::Command(format!(
                "ERR unknown command '{}', or not supported in cluster mode",
                name
            ))
            .to_reply(),
        }
    }
}

impl Database for ClusterDatabase {
    fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
        match panic::catch_unwind(AssertUnwindSafe(|| self.route(conn, cmd_line))) {
            Ok(reply) => reply,
            Err(cause) => {
                warn!("error occurs: {}", panic_message(cause.as_ref()));
                Error::Internal.to_reply()
            }
        }
    }

    fn after_client_close(&self, conn: &dyn Connection) {
        self.db.after_client_close(conn);
    }

    fn close(&self) {
        self.db.close();
    }
}

fn cmd_line_for_select(db_index: usize) -> Vec<Bytes> {
    cmd_line(&["SELECT", &db_index.to_string()])
}

fn name_of(cmd_line: &[Bytes]) -> String {
    String::from_utf8_lossy(&cmd_line[0]).to_ascii_lowercase()
}

//
// Routes
//

fn exec_local(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
    cluster.db.exec(conn, cmd_line)
}

// _local CMD args...: one leg of another node's broadcast
fn exec_relayed(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
    if cmd_line.len() < 2 {
        return Error::Command(format!(
            "ERR wrong number of arguments for '{}' command",
            LOCAL_EXEC
        ))
        .to_reply();
    }
    cluster.db.exec(conn, &cmd_line[1..])
}

// GET k, SET k v, ... : the node owning args[1] executes it
fn exec_by_key(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
    if cmd_line.len() < 2 {
        return Reply::arg_num_error(&name_of(cmd_line));
    }
    match cluster.owner(&cmd_line[1]) {
        Some(peer) => cluster.relay(peer, conn, cmd_line),
        None => Reply::error("ERR cluster has no nodes"),
    }
}

// RENAME src dest: both keys must live on the same node
fn exec_rename(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
    if cmd_line.len() != 3 {
        return Reply::arg_num_error(&name_of(cmd_line));
    }
    let src_peer = cluster.owner(&cmd_line[1]);
    let dest_peer = cluster.owner(&cmd_line[2]);
    match (src_peer, dest_peer) {
        (Some(src), Some(dest)) if src == dest => cluster.relay(src, conn, cmd_line),
        (Some(_), Some(_)) => Reply::error("ERR rename must within one peer"),
        _ => Reply::error("ERR cluster has no nodes"),
    }
}

// DEL k1 k2 ...: every node deletes what it has; counts are summed
fn exec_del(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
    let replies = cluster.broadcast(conn, cmd_line);
    let mut deleted = 0;
    for reply in cluster.ordered(&replies) {
        match reply {
            Reply::Error(_) => return reply.clone(),
            Reply::Integer(n) => deleted += n,
            _ => {}
        }
    }
    Reply::Integer(deleted)
}

// FLUSHDB: OK only if every node flushed
fn exec_flushdb(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
    let replies = cluster.broadcast(conn, cmd_line);
    let failed = cluster.ordered(&replies).find(|r| r.is_error()).cloned();
    failed.unwrap_or(Reply::Ok)
}

// KEYS pattern: union of every node's matches
fn exec_keys(cluster: &ClusterDatabase, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> Reply {
    if cmd_line.len() != 2 {
        return Reply::arg_num_error("keys");
    }
    let replies = cluster.broadcast(conn, cmd_line);
    let mut keys = Vec::new();
    for reply in cluster.ordered(&replies) {
        match reply {
            Reply::Error(_) => return reply.clone(),
            Reply::MultiBulk(items) => keys.extend(items.iter().cloned()),
            _ => {}
        }
    }
    if keys.is_empty() {
        Reply::EmptyArray
    } else {
        Reply::MultiBulk(keys)
    }
}

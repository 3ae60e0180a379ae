/*!
 * Consistent Hash Ring
 *
 * Maps keys to the node that owns them. Every physical node is placed on a
 * 64-bit ring many times ("virtual replicas") to even out ownership; a key
 * belongs to the first node position at or after its own hash, wrapping
 * around. Adding a node only moves the keys that land on its new positions.
 */

use hashbrown::HashMap;
use smol_str::SmolStr;
use xxhash_rust::xxh3::xxh3_64;

/// Key-to-node mapping built once at cluster startup
#[derive(Debug, Clone)]
pub struct NodeMap {
    replicas: usize,
    /// Sorted ring positions
    keys: Vec<u64>,
    owners: HashMap<u64, SmolStr>,
}

impl NodeMap {
    /// Empty ring placing each node `replicas` times (at least once)
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            keys: Vec::new(),
            owners: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Place nodes on the ring. Adding a node twice has no effect.
    pub fn add_nodes<S: AsRef<str>>(&mut self, nodes: &[S]) {
        for node in nodes {
            let node = node.as_ref();
            if node.is_empty() {
                continue;
            }
            for i in 0..self.replicas {
                let pos = xxh3_64(format!("{}{}", i, node).as_bytes());
                // on a position collision the first node placed keeps it
                if !self.owners.contains_key(&pos) {
                    self.owners.insert(pos, SmolStr::new(node));
                    self.keys.push(pos);
                }
            }
        }
        self.keys.sort_unstable();
    }

    /// Owner of `key`, or `None` on an empty ring
    pub fn pick_node(&self, key: &[u8]) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let hash = xxh3_64(partition_key(key));
        let idx = match self.keys.partition_point(|&pos| pos < hash) {
            i if i == self.keys.len() => 0,
            i => i,
        };
        self.owners.get(&self.keys[idx]).map(SmolStr::as_str)
    }

    /// Distinct physical nodes on the ring, sorted
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self.owners.values().map(SmolStr::as_str).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

/// Part of the key that is hashed. A non-empty `{tag}` pins related keys to
/// the same node; otherwise the whole key is used.
pub fn partition_key(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

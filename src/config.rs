//! Server properties loaded from a redis.conf-style file.
//!
//! One `key value` pair per line, `#` starts a comment. Unknown keys are
//! logged and ignored so a stock redis.conf can be reused.

use crate::aof::AppendFsync;
use crate::database::DEFAULT_DATABASES;
use crate::error::{Error, Result};
use log::warn;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Virtual ring positions per physical node
pub const DEFAULT_REPLICAS: usize = 128;

/// Pooled connections kept per peer
pub const DEFAULT_PEER_POOL_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProperties {
    pub bind: String,
    pub port: u16,
    pub append_only: bool,
    pub append_filename: PathBuf,
    pub append_fsync: AppendFsync,
    pub databases: usize,
    /// `0` means unlimited
    pub max_clients: usize,
    /// Address other nodes use to reach this one; enables cluster mode
    pub self_addr: Option<String>,
    pub peers: Vec<String>,
    pub replicas: usize,
    pub peer_pool_size: usize,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7379,
            append_only: false,
            append_filename: PathBuf::from("appendonly.aof"),
            append_fsync: AppendFsync::default(),
            databases: DEFAULT_DATABASES,
            max_clients: 0,
            self_addr: None,
            peers: Vec::new(),
            replicas: DEFAULT_REPLICAS,
            peer_pool_size: DEFAULT_PEER_POOL_SIZE,
        }
    }
}

impl ServerProperties {
    /// Read properties from a file on disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::parse(std::io::BufReader::new(file))
    }

    pub fn parse(reader: impl BufRead) -> Result<Self> {
        let mut props = Self::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            props
                .apply(&key.to_ascii_lowercase(), value)
                .map_err(|e| Error::Config(format!("line {}: {}", lineno + 1, e)))?;
        }
        Ok(props)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "bind" => self.bind = value.to_string(),
            "port" => self.port = parse_value(key, value)?,
            "appendonly" => self.append_only = parse_bool(key, value)?,
            "appendfilename" => self.append_filename = PathBuf::from(value.trim_matches('"')),
            "appendfsync" => self.append_fsync = value.parse()?,
            "databases" => self.databases = parse_value(key, value)?,
            "maxclients" => self.max_clients = parse_value(key, value)?,
            "self" => self.self_addr = Some(value.to_string()).filter(|s| !s.is_empty()),
            "peers" => {
                self.peers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            }
            "replicas" => self.replicas = parse_value(key, value)?,
            "peerpoolsize" => self.peer_pool_size = parse_value(key, value)?,
            other => warn!("ignoring unknown config key '{}'", other),
        }
        Ok(())
    }

    /// Listen address, `bind:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Cluster mode needs both a self address and at least one peer
    pub fn is_cluster(&self) -> bool {
        self.self_addr.is_some() && !self.peers.is_empty()
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{}' for '{}'", value, key)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(Error::Config(format!("invalid value '{}' for '{}'", value, key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cluster_properties() {
        let conf = "\
# node a
bind 127.0.0.1
port 6399
appendonly yes
appendfilename \"node-a.aof\"
appendfsync always
databases 4
self 127.0.0.1:6399
peers 127.0.0.1:6400, 127.0.0.1:6401
save 900 1
";
        let props = ServerProperties::parse(conf.as_bytes()).unwrap();
        assert_eq!(props.addr(), "127.0.0.1:6399");
        assert!(props.append_only);
        assert_eq!(props.append_filename, PathBuf::from("node-a.aof"));
        assert_eq!(props.append_fsync, AppendFsync::Always);
        assert_eq!(props.databases, 4);
        assert_eq!(props.self_addr.as_deref(), Some("127.0.0.1:6399"));
        assert_eq!(props.peers, vec!["127.0.0.1:6400", "127.0.0.1:6401"]);
        assert!(props.is_cluster());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ServerProperties::parse("port many".as_bytes()).is_err());
        assert!(ServerProperties::parse("appendonly maybe".as_bytes()).is_err());
        assert!(ServerProperties::parse("appendfsync sometimes".as_bytes()).is_err());
    }

    #[test]
    fn defaults_are_standalone() {
        let props = ServerProperties::default();
        assert!(!props.is_cluster());
        assert_eq!(props.databases, DEFAULT_DATABASES);
    }
}

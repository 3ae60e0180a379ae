// Core modules for the cinder key-value store
pub mod protocol; // Reply type + RESP encoders
pub mod parser; // streaming RESP decoder
pub mod error; // error taxonomy
pub mod aof; // AOF writer, pause lock, replay
pub mod command; // command table + arity rules
pub mod commands; // built-in key and string commands
pub mod storage; // Dict backing store
pub mod database; // Database/Connection contracts + standalone engine
pub mod ring; // consistent hash ring
pub mod client; // peer client
pub mod pool; // peer connection pool
pub mod cluster; // routing, relay, broadcast
pub mod config; // ServerProperties
pub mod net; // listener + per-connection threads

// Re-export the main types for easier access
pub use aof::{Aof, AppendFsync};
pub use cluster::ClusterDatabase;
pub use config::ServerProperties;
pub use database::{Connection, Database, StandaloneDatabase};
pub use error::{Error, Result};
pub use net::{Handler, Server, ShutdownHandle};
pub use parser::{Parser, Payload};
pub use protocol::{CmdLine, Reply};
pub use ring::NodeMap;

// Default server address
pub const DEFAULT_ADDR: &str = "0.0.0.0:7379";

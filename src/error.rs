//! Error taxonomy shared by the decoder, persistence and cluster layers.

use crate::protocol::Reply;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame. Decoding resets and continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying stream closed or failed. Ends that connection's decoding.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown command, wrong arity or a semantic failure of the command.
    #[error("{0}")]
    Command(String),

    /// A peer could not be reached or its pool is exhausted. Never retried.
    #[error("relay error: {0}")]
    Relay(String),

    /// A command panicked. The node keeps serving.
    #[error("internal error")]
    Internal,

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Only transport failures end a decode sequence
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Render the error as the single reply frame a client receives
    pub fn to_reply(&self) -> Reply {
        match self {
            Error::Protocol(msg) => Reply::Error(format!("ERR Protocol error: {}", msg)),
            Error::Io(e) => Reply::Error(format!("ERR {}", e)),
            Error::Command(msg) => Reply::Error(msg.clone()),
            Error::Relay(msg) => Reply::Error(format!("ERR {}", msg)),
            Error::Internal => Reply::unknown_error(),
            Error::Config(msg) => Reply::Error(format!("ERR {}", msg)),
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

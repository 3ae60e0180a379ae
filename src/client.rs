//! Blocking client used to relay commands to peer nodes.

use crate::error::{Error, Result};
use crate::parser::Parser;
use crate::protocol::{encode_cmd_line, Reply};
use bytes::{Bytes, BytesMut};
use std::io::{self, Write};
use std::net::TcpStream;

/// One protocol-level connection to a peer
///
/// Requests and replies are strictly paired: `send` writes one command and
/// reads exactly one reply. Any transport or framing failure marks the client
/// broken, since the stream position is no longer known.
pub struct PeerClient {
    addr: String,
    writer: TcpStream,
    replies: Parser<TcpStream>,
    buf: BytesMut,
    broken: bool,
}

impl PeerClient {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Ok(Self {
            addr: addr.to_string(),
            writer: stream,
            replies: Parser::new(reader),
            buf: BytesMut::with_capacity(256),
            broken: false,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send one command line and wait for its reply
    pub fn send(&mut self, cmd_line: &[Bytes]) -> Result<Reply> {
        self.buf.clear();
        encode_cmd_line(cmd_line, &mut self.buf);
        if let Err(e) = self.writer.write_all(&self.buf) {
            self.broken = true;
            return Err(e.into());
        }
        match self.replies.next() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => {
                self.broken = true;
                Err(e)
            }
            None => {
                self.broken = true;
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )))
            }
        }
    }
}

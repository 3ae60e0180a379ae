/*!
 * Redis RESP Protocol Types and Encoders
 *
 * This module defines the reply values exchanged with clients and peers and
 * their byte-exact wire encoding. The append-only file reuses the same
 * encoder, so anything written here ends up in persisted history.
 */

use bytes::{BufMut, Bytes, BytesMut};

/// A decoded command: element 0 is the command name, the rest are arguments.
pub type CmdLine = Vec<Bytes>;

/// Line terminator of the wire protocol
pub const CRLF: &[u8] = b"\r\n";

/// Every value that can travel over the wire
///
/// Exactly one variant is active. `Pong` and `Ok` are fixed status replies
/// kept as their own variants so hot paths never allocate for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<text>\r\n`
    Status(String),
    /// `-<text>\r\n`
    Error(String),
    /// `:<n>\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`, or `$-1\r\n` when `None`
    Bulk(Option<Bytes>),
    /// `*<len>\r\n` followed by every element as a bulk string
    MultiBulk(Vec<Option<Bytes>>),
    /// `+PONG\r\n`
    Pong,
    /// `+OK\r\n`
    Ok,
    /// `*0\r\n`
    EmptyArray,
}

impl Reply {
    /// Build an error reply
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    /// Build a bulk reply from anything convertible into `Bytes`
    pub fn bulk(b: impl Into<Bytes>) -> Self {
        Reply::Bulk(Some(b.into()))
    }

    /// The null bulk reply (`$-1\r\n`)
    pub fn null() -> Self {
        Reply::Bulk(None)
    }

    /// Build a multi-bulk reply where every element is present
    pub fn multi_bulk(args: impl IntoIterator<Item = Bytes>) -> Self {
        Reply::MultiBulk(args.into_iter().map(Some).collect())
    }

    /// Generic reply for failures that have no better description
    pub fn unknown_error() -> Self {
        Reply::Error("ERR unknown".into())
    }

    /// Reply sent when a command gets the wrong number of arguments
    pub fn arg_num_error(cmd: &str) -> Self {
        Reply::Error(format!(
            "ERR wrong number of arguments for '{}' command",
            cmd
        ))
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Append the wire encoding of this reply to `out`
    pub fn write_to(&self, out: &mut BytesMut) {
        match self {
            Reply::Status(s) => write_simple(s, out),
            Reply::Error(s) => write_error(s, out),
            Reply::Integer(n) => write_integer(*n, out),
            Reply::Bulk(Some(b)) => write_bulk(b, out),
            Reply::Bulk(None) => write_null(out),
            Reply::MultiBulk(items) => {
                write_array_len(items.len(), out);
                for item in items {
                    match item {
                        Some(b) => write_bulk(b, out),
                        None => write_null(out),
                    }
                }
            }
            Reply::Pong => out.extend_from_slice(b"+PONG\r\n"),
            Reply::Ok => out.extend_from_slice(b"+OK\r\n"),
            Reply::EmptyArray => out.extend_from_slice(b"*0\r\n"),
        }
    }

    /// Encode this reply into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len_hint());
        self.write_to(&mut out);
        out.freeze()
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Reply::Bulk(Some(b)) => b.len() + 16,
            Reply::MultiBulk(items) => {
                16 + items
                    .iter()
                    .map(|i| i.as_ref().map_or(5, |b| b.len() + 16))
                    .sum::<usize>()
            }
            _ => 32,
        }
    }
}

/// Build a command line from string parts, e.g. `cmd_line(&["SELECT", "1"])`
pub fn cmd_line(parts: &[&str]) -> CmdLine {
    parts
        .iter()
        .map(|p| Bytes::copy_from_slice(p.as_bytes()))
        .collect()
}

/// Build a command line from a name followed by raw arguments
pub fn cmd_line_with(name: &str, args: &[Bytes]) -> CmdLine {
    let mut line = Vec::with_capacity(args.len() + 1);
    line.push(Bytes::copy_from_slice(name.as_bytes()));
    line.extend(args.iter().cloned());
    line
}

/// Encode a command line as a multi-bulk frame, the format used for both
/// relaying to peers and writing the AOF
pub fn encode_cmd_line(line: &[Bytes], out: &mut BytesMut) {
    write_array_len(line.len(), out);
    for arg in line {
        write_bulk(arg, out);
    }
}

//
// Low-level RESP writers
//
// These append directly into an output buffer so callers can batch several
// frames without intermediate allocations.
//

/// Write a simple string (`+OK\r\n`)
#[inline]
pub fn write_simple(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'+');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(CRLF);
}

/// Write an error string (`-ERR ...\r\n`)
#[inline]
pub fn write_error(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'-');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(CRLF);
}

/// Write an integer (`:<n>\r\n`)
#[inline]
pub fn write_integer(i: i64, out: &mut BytesMut) {
    out.put_u8(b':');
    out.extend_from_slice(i.to_string().as_bytes());
    out.extend_from_slice(CRLF);
}

/// Write a bulk string (`$<len>\r\n<data>\r\n`)
#[inline]
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    let len_str = b.len().to_string();
    out.reserve(1 + len_str.len() + 2 + b.len() + 2);
    out.put_u8(b'$');
    out.extend_from_slice(len_str.as_bytes());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(b);
    out.extend_from_slice(CRLF);
}

/// Write the null bulk string (`$-1\r\n`)
#[inline]
pub fn write_null(out: &mut BytesMut) {
    out.extend_from_slice(b"$-1\r\n");
}

/// Write an array header (`*<count>\r\n`)
#[inline]
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    out.put_u8(b'*');
    out.extend_from_slice(n.to_string().as_bytes());
    out.extend_from_slice(CRLF);
}

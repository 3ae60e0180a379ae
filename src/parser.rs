/*!
 * Streaming RESP Decoder
 *
 * Turns an unbounded byte stream into a lazy sequence of decoded frames.
 * Bulk bodies are read by length, never scanned for delimiters, so payloads
 * may contain raw CR/LF bytes. Malformed frames produce a protocol error and
 * decoding resumes at the next line; transport failures end the sequence.
 */

use crate::error::{Error, Result};
use crate::protocol::Reply;
use bytes::Bytes;
use std::io::{BufRead, BufReader, ErrorKind, Read};

/// One decoded frame, or the reason decoding it failed
pub type Payload = Result<Reply>;

/// Largest bulk body accepted, same limit as Redis' proto-max-bulk-len
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Longest header or inline command line, same as Redis' inline limit
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Cap on the up-front allocation for a multi-bulk header
const PREALLOC_ARGS: usize = 1024;

#[derive(Debug)]
enum State {
    /// Waiting for the first line of a new frame
    Idle,
    /// A top-level `$<len>` header was read; `len` body bytes plus CRLF are owed
    AccumulatingBulk { len: usize },
    /// Collecting the elements of a `*<count>` frame
    AccumulatingMulti {
        expected: usize,
        args: Vec<Option<Bytes>>,
    },
}

/// Decoder over any blocking reader
///
/// `Parser` is an `Iterator<Item = Payload>`. It yields `Err(Error::Protocol)`
/// for a malformed frame and keeps going; it yields `Err(Error::Io)` once for a
/// transport failure (including end-of-stream in the middle of a frame) and
/// then ends. End-of-stream between frames ends it silently.
pub struct Parser<R> {
    reader: BufReader<R>,
    state: State,
    done: bool,
}

impl<R: Read> Parser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            state: State::Idle,
            done: false,
        }
    }

    /// Advance the state machine by one line (or one bulk body)
    ///
    /// Returns `Ok(Some(_))` when a frame completed and `Ok(None)` when more
    /// input is needed. The state is reset to `Idle` before any error leaves.
    fn step(&mut self) -> Result<Option<Reply>> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => match self.read_line(true)? {
                Some(line) => self.parse_header(line),
                None => {
                    self.done = true;
                    Ok(None)
                }
            },
            State::AccumulatingBulk { len } => {
                let body = self.read_body(len)?;
                Ok(Some(Reply::Bulk(Some(body))))
            }
            State::AccumulatingMulti { expected, mut args } => {
                let line = match self.read_line(false)? {
                    Some(line) => line,
                    None => return Err(unexpected_eof()),
                };
                if line.first() != Some(&b'$') {
                    return Err(protocol_error("expected '$'", &line));
                }
                let len = parse_bulk_len(&line)?;
                if len < 0 {
                    args.push(None);
                } else {
                    args.push(Some(self.read_body(len as usize)?));
                }
                if args.len() == expected {
                    Ok(Some(Reply::MultiBulk(args)))
                } else {
                    self.state = State::AccumulatingMulti { expected, args };
                    Ok(None)
                }
            }
        }
    }

    /// Interpret the first line of a frame
    fn parse_header(&mut self, line: Vec<u8>) -> Result<Option<Reply>> {
        let Some(&lead) = line.first() else {
            // blank inline line
            return Ok(None);
        };
        match lead {
            b'*' => {
                let count = std::str::from_utf8(&line[1..])
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or_else(|| protocol_error("invalid multibulk length", &line))?;
                if count == 0 {
                    return Ok(Some(Reply::EmptyArray));
                }
                let expected = count as usize;
                self.state = State::AccumulatingMulti {
                    expected,
                    args: Vec::with_capacity(expected.min(PREALLOC_ARGS)),
                };
                Ok(None)
            }
            b'$' => {
                let len = parse_bulk_len(&line)?;
                if len < 0 {
                    return Ok(Some(Reply::Bulk(None)));
                }
                self.state = State::AccumulatingBulk { len: len as usize };
                Ok(None)
            }
            b'+' => Ok(Some(Reply::Status(
                String::from_utf8_lossy(&line[1..]).into_owned(),
            ))),
            b'-' => Ok(Some(Reply::Error(
                String::from_utf8_lossy(&line[1..]).into_owned(),
            ))),
            b':' => std::str::from_utf8(&line[1..])
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .map(|n| Some(Reply::Integer(n)))
                .ok_or_else(|| protocol_error("invalid integer", &line)),
            _ => {
                // inline command, e.g. `PING\r\n` typed into telnet
                let args: Vec<Option<Bytes>> = line
                    .split(|b| *b == b' ')
                    .filter(|part| !part.is_empty())
                    .map(|part| Some(Bytes::copy_from_slice(part)))
                    .collect();
                if args.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Reply::MultiBulk(args)))
            }
        }
    }

    /// Read one CRLF-terminated line and strip the terminator
    ///
    /// `Ok(None)` means the stream ended cleanly before the line started,
    /// which is only acceptable at a frame boundary.
    fn read_line(&mut self, at_boundary: bool) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut line)?;
        if n == 0 {
            return if at_boundary {
                Ok(None)
            } else {
                Err(unexpected_eof())
            };
        }
        if line.last() != Some(&b'\n') {
            if line.len() > MAX_LINE_LEN {
                self.skip_line()?;
                return Err(Error::Protocol("too big inline request".into()));
            }
            // stream ended mid-line
            return Err(unexpected_eof());
        }
        if line.len() < 2 || line[line.len() - 2] != b'\r' {
            return Err(protocol_error("expected CRLF", &line));
        }
        line.truncate(line.len() - 2);
        Ok(Some(line))
    }

    /// Drop input up to and including the next `\n` without buffering it
    fn skip_line(&mut self) -> Result<()> {
        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                return Err(unexpected_eof());
            }
            match buf.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    self.reader.consume(i + 1);
                    return Ok(());
                }
                None => {
                    let n = buf.len();
                    self.reader.consume(n);
                }
            }
        }
    }

    /// Read exactly `len` payload bytes plus the trailing CRLF
    fn read_body(&mut self, len: usize) -> Result<Bytes> {
        let mut body = vec![0u8; len + 2];
        self.reader.read_exact(&mut body)?;
        if &body[len..] != b"\r\n" {
            return Err(Error::Protocol("bulk body not terminated by CRLF".into()));
        }
        body.truncate(len);
        Ok(Bytes::from(body))
    }
}

impl<R: Read> Iterator for Parser<R> {
    type Item = Payload;

    fn next(&mut self) -> Option<Payload> {
        while !self.done {
            match self.step() {
                Ok(Some(reply)) => return Some(Ok(reply)),
                Ok(None) => continue,
                Err(e) => {
                    if e.is_fatal() {
                        self.done = true;
                    }
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Decode everything in `data`, mostly useful for tests and tooling
pub fn parse_all(data: &[u8]) -> Vec<Payload> {
    Parser::new(data).collect()
}

/// Parse the length out of a `$<len>` line. `-1` means null; anything else
/// negative, non-numeric or above `MAX_BULK_LEN` is a protocol error.
fn parse_bulk_len(line: &[u8]) -> Result<i64> {
    let len = std::str::from_utf8(&line[1..])
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol_error("invalid bulk length", line))?;
    if len < -1 || len > MAX_BULK_LEN {
        return Err(protocol_error("invalid bulk length", line));
    }
    Ok(len)
}

fn protocol_error(what: &str, line: &[u8]) -> Error {
    Error::Protocol(format!("{} '{}'", what, String::from_utf8_lossy(line).trim_end()))
}

fn unexpected_eof() -> Error {
    Error::Io(std::io::Error::new(
        ErrorKind::UnexpectedEof,
        "stream ended inside a frame",
    ))
}

mod common;

use bytes::{Bytes, BytesMut};
use cinder::parser::Parser;
use cinder::protocol::{cmd_line, encode_cmd_line};
use cinder::*;
use common::{read_log, temp_path};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Running {
    addr: SocketAddr,
    stop: ShutdownHandle,
    thread: JoinHandle<()>,
}

impl Running {
    fn stop(self) {
        self.stop.shutdown();
        self.thread.join().unwrap();
    }
}

fn start_server() -> Running {
    start_server_with(0)
}

fn start_server_with(max_clients: usize) -> Running {
    let db: Arc<dyn Database> = Arc::new(StandaloneDatabase::in_memory(16));
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), db, max_clients).unwrap();
    let addr = server.local_addr().unwrap();
    let stop = server.shutdown_handle().unwrap();
    let thread = thread::spawn(move || server.run().unwrap());
    Running { addr, stop, thread }
}

fn get_client(addr: SocketAddr) -> (TcpStream, Parser<TcpStream>) {
    let stream = TcpStream::connect(addr).expect("Failed to connect");
    stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(30))).unwrap();
    let replies = Parser::new(stream.try_clone().unwrap());
    (stream, replies)
}

fn encode(lines: &[Vec<Bytes>]) -> BytesMut {
    let mut buf = BytesMut::new();
    for line in lines {
        encode_cmd_line(line, &mut buf);
    }
    buf
}

fn next_reply(replies: &mut Parser<TcpStream>) -> Reply {
    replies.next().expect("connection closed").expect("bad reply")
}

#[test]
fn pipelined_commands_get_replies_in_order() {
    let server = start_server();
    let (mut stream, mut replies) = get_client(server.addr);

    let batch = encode(&[
        cmd_line(&["SET", "a", "1"]),
        cmd_line(&["GET", "a"]),
        cmd_line(&["DEL", "a"]),
        cmd_line(&["GET", "a"]),
        cmd_line(&["PING"]),
    ]);
    stream.write_all(&batch).unwrap();

    assert_eq!(next_reply(&mut replies), Reply::Status("OK".into()));
    assert_eq!(next_reply(&mut replies), Reply::bulk("1"));
    assert_eq!(next_reply(&mut replies), Reply::Integer(1));
    assert_eq!(next_reply(&mut replies), Reply::null());
    assert_eq!(next_reply(&mut replies), Reply::Status("PONG".into()));

    drop(stream);
    server.stop();
}

#[test]
fn protocol_errors_keep_the_connection_open() {
    let server = start_server();
    let (mut stream, mut replies) = get_client(server.addr);

    stream.write_all(b"*2\r\n$3\r\nGET\r\n+oops\r\n").unwrap();
    match next_reply(&mut replies) {
        Reply::Error(msg) => assert!(msg.starts_with("ERR Protocol error"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }

    stream.write_all(b":42\r\n").unwrap();
    assert!(next_reply(&mut replies).is_error());

    stream.write_all(b"PING\r\n").unwrap();
    assert_eq!(next_reply(&mut replies), Reply::Status("PONG".into()));

    drop(stream);
    server.stop();
}

#[test]
fn overlong_inline_request_is_refused() {
    let server = start_server();
    let (mut stream, mut replies) = get_client(server.addr);

    let mut junk = vec![b'x'; 200 * 1024];
    junk.extend_from_slice(b"\r\nPING\r\n");
    stream.write_all(&junk).unwrap();
    assert_eq!(
        next_reply(&mut replies),
        Reply::error("ERR Protocol error: too big inline request")
    );
    assert_eq!(next_reply(&mut replies), Reply::Status("PONG".into()));

    drop(stream);
    server.stop();
}

#[test]
fn select_is_per_connection() {
    let server = start_server();
    let (mut one, mut one_replies) = get_client(server.addr);
    let (mut two, mut two_replies) = get_client(server.addr);

    one.write_all(&encode(&[cmd_line(&["SELECT", "2"]), cmd_line(&["SET", "k", "v"])]))
        .unwrap();
    assert_eq!(next_reply(&mut one_replies), Reply::Status("OK".into()));
    assert_eq!(next_reply(&mut one_replies), Reply::Status("OK".into()));

    two.write_all(&encode(&[cmd_line(&["GET", "k"])])).unwrap();
    assert_eq!(next_reply(&mut two_replies), Reply::null());

    drop(one);
    drop(two);
    server.stop();
}

#[test]
fn large_binary_payload_1mb() {
    let server = start_server();
    let (mut stream, mut replies) = get_client(server.addr);

    let size = 1024 * 1024;
    let payload: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    let set = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"blob"), payload.clone()];
    stream.write_all(&encode(&[set, cmd_line(&["GET", "blob"]), cmd_line(&["STRLEN", "blob"])]))
        .unwrap();

    assert_eq!(next_reply(&mut replies), Reply::Status("OK".into()));
    assert_eq!(next_reply(&mut replies), Reply::Bulk(Some(payload)));
    assert_eq!(next_reply(&mut replies), Reply::Integer(size as i64));

    drop(stream);
    server.stop();
}

#[test]
fn shutdown_closes_live_connections() {
    let server = start_server();
    let (mut stream, mut replies) = get_client(server.addr);
    stream.write_all(b"PING\r\n").unwrap();
    assert_eq!(next_reply(&mut replies), Reply::Status("PONG".into()));

    // the client stays connected; shutdown must still return
    server.stop();
    assert!(replies.next().map_or(true, |r| r.is_err()));
}

#[test]
fn max_clients_refuses_extra_connections() {
    let server = start_server_with(1);
    let (mut first, mut first_replies) = get_client(server.addr);
    first.write_all(b"PING\r\n").unwrap();
    assert_eq!(next_reply(&mut first_replies), Reply::Status("PONG".into()));

    let (_second, mut second_replies) = get_client(server.addr);
    assert_eq!(
        next_reply(&mut second_replies),
        Reply::error("ERR max number of clients reached")
    );

    drop(first);
    server.stop();
}

#[test]
fn shutdown_flushes_the_append_log() {
    let path = temp_path("shutdown");
    let props = ServerProperties {
        append_only: true,
        append_filename: path.clone(),
        append_fsync: AppendFsync::No,
        ..Default::default()
    };
    let db: Arc<dyn Database> = Arc::new(StandaloneDatabase::new(&props).unwrap());
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), db, 0).unwrap();
    let addr = server.local_addr().unwrap();
    let stop = server.shutdown_handle().unwrap();
    let thread = thread::spawn(move || server.run().unwrap());
    let server = Running { addr, stop, thread };

    let (mut stream, mut replies) = get_client(server.addr);
    let writes: Vec<_> = (0..100).map(|i| cmd_line(&["SET", "k", &i.to_string()])).collect();
    stream.write_all(&encode(&writes)).unwrap();
    for _ in 0..100 {
        assert_eq!(next_reply(&mut replies), Reply::Status("OK".into()));
    }

    // the same path a SIGTERM takes
    server.stop();
    let entries = read_log(&path);
    assert_eq!(entries.len(), 100);
    assert_eq!(entries[99], vec!["SET", "k", "99"]);
    let _ = std::fs::remove_file(&path);
}

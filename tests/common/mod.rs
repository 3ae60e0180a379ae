#![allow(dead_code)]

use cinder::parser::{parse_all, Parser};
use cinder::{Connection, Reply};
use crossbeam::channel::{unbounded, Receiver};
use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// In-process connection context
#[derive(Default)]
pub struct TestConn {
    pub db: usize,
    pub written: Vec<u8>,
}

impl Connection for TestConn {
    fn db_index(&self) -> usize {
        self.db
    }

    fn select_db(&mut self, index: usize) {
        self.db = index;
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.written.extend_from_slice(data);
        Ok(())
    }
}

/// Unique file path under the system temp dir
pub fn temp_path(name: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "cinder-{}-{}-{}.aof",
        name,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_file(&path);
    path
}

/// Decode a log file into command lines
pub fn read_log(path: &PathBuf) -> Vec<Vec<String>> {
    let data = std::fs::read(path).unwrap();
    parse_all(&data)
        .into_iter()
        .map(|p| match p.unwrap() {
            Reply::MultiBulk(args) => args
                .into_iter()
                .map(|a| String::from_utf8(a.unwrap().to_vec()).unwrap())
                .collect(),
            other => panic!("unexpected frame {:?}", other),
        })
        .collect()
}

/// A peer that records every command it receives and answers with `respond`
pub struct FakePeer {
    pub addr: String,
    pub received: Receiver<Vec<String>>,
}

pub fn fake_peer(respond: fn(&[String]) -> Reply) -> FakePeer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let tx = tx.clone();
            thread::spawn(move || {
                let mut writer = stream.try_clone().unwrap();
                for payload in Parser::new(stream) {
                    let Ok(Reply::MultiBulk(args)) = payload else { break };
                    let line: Vec<String> = args
                        .iter()
                        .map(|a| String::from_utf8_lossy(a.as_ref().unwrap()).into_owned())
                        .collect();
                    let reply = respond(&line);
                    let _ = tx.send(line);
                    if writer.write_all(&reply.to_bytes()).is_err() {
                        break;
                    }
                }
            });
        }
    });
    FakePeer { addr, received: rx }
}

/// A peer that accepts connections and immediately hangs up
pub fn hang_up_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            drop(stream);
        }
    });
    addr
}

/// An address nothing listens on
pub fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

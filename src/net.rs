/*!
 * Network Layer
 *
 * Accepts TCP clients and runs one thread per connection. Each thread
 * decodes frames from its socket, executes them against the shared engine
 * and writes exactly one reply per request. The `Handler` keeps track of
 * every live connection so shutdown can close them all and join their
 * threads before the engine (and its AOF) is closed.
 */

use crate::database::{Connection, Database};
use crate::parser::Parser;
use crate::protocol::{CmdLine, Reply};
use anyhow::*;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::result::Result::Ok;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Bind a blocking TCP listener with SO_REUSEADDR set
pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Connection state of one TCP client
pub struct ClientConn {
    id: u64,
    stream: TcpStream,
    db: usize,
}

impl ClientConn {
    pub fn new(id: u64, stream: TcpStream) -> Self {
        Self { id, stream, db: 0 }
    }
}

impl Connection for ClientConn {
    fn db_index(&self) -> usize {
        self.db
    }

    fn select_db(&mut self, index: usize) {
        self.db = index;
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }
}

/// Supervisor of all client connections
pub struct Handler {
    db: Arc<dyn Database>,
    /// Live connections by id, kept to shut their sockets down on close
    active: DashMap<u64, TcpStream>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
    next_id: AtomicU64,
    max_clients: usize,
}

impl Handler {
    pub fn new(db: Arc<dyn Database>, max_clients: usize) -> Self {
        Self {
            db,
            active: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            max_clients,
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    /// Register `stream` and serve it on its own thread
    pub fn spawn(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }
        if self.max_clients > 0 && self.active_connections() >= self.max_clients {
            let _ = stream.write_all(b"-ERR max number of clients reached\r\n");
            return Ok(());
        }
        stream.set_nodelay(true).ok();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(id, stream.try_clone()?);

        let handler = Arc::clone(self);
        let worker = std::thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || handler.serve(ClientConn::new(id, stream)));
        match worker {
            Ok(worker) => {
                let mut workers = self.workers.lock();
                workers.retain(|w| !w.is_finished());
                workers.push(worker);
                Ok(())
            }
            Err(e) => {
                self.active.remove(&id);
                Err(e.into())
            }
        }
    }

    /// Read-execute-reply loop of one client
    fn serve(&self, mut conn: ClientConn) {
        let reader = match conn.stream.try_clone() {
            Ok(r) => r,
            Err(e) => {
                error!("conn {}: cannot clone stream: {}", conn.id, e);
                self.release(&conn);
                return;
            }
        };

        for payload in Parser::new(reader) {
            let reply = match payload {
                Ok(Reply::MultiBulk(args)) => match args.into_iter().collect::<Option<CmdLine>>() {
                    Some(line) => self.db.exec(&mut conn, &line),
                    None => Reply::error("ERR Protocol error: null argument in command"),
                },
                Ok(other) => {
                    debug!("conn {}: expected a command, got {:?}", conn.id, other);
                    Reply::error("ERR Protocol error: expected a command array")
                }
                Err(e) if e.is_fatal() => {
                    debug!("conn {}: {}", conn.id, e);
                    break;
                }
                Err(e) => e.to_reply(),
            };
            if let Err(e) = conn.write(&reply.to_bytes()) {
                debug!("conn {}: write failed: {}", conn.id, e);
                break;
            }
        }

        self.release(&conn);
    }

    fn release(&self, conn: &ClientConn) {
        let _ = conn.stream.shutdown(Shutdown::Both);
        self.active.remove(&conn.id);
        self.db.after_client_close(conn);
        info!("connection {} closed", conn.id);
    }

    /// Refuse new clients, close every live one, wait for their threads,
    /// then close the engine
    pub fn close(&self) {
        info!("handler shutting down...");
        self.closing.store(true, Ordering::Release);
        for entry in self.active.iter() {
            let _ = entry.value().shutdown(Shutdown::Both);
        }
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("connection thread panicked");
            }
        }
        self.db.close();
    }
}

/// Stops a running [`Server`] from another thread
#[derive(Clone)]
pub struct ShutdownHandle {
    stopping: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        // unblock the accept call
        let _ = TcpStream::connect(self.wake_addr);
    }
}

/// Accept loop bound to one address
pub struct Server {
    listener: TcpListener,
    handler: Arc<Handler>,
    stopping: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(addr: SocketAddr, db: Arc<dyn Database>, max_clients: usize) -> Result<Self> {
        let listener = bind(addr).with_context(|| format!("bind {}", addr))?;
        Ok(Self {
            listener,
            handler: Arc::new(Handler::new(db, max_clients)),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        let mut wake_addr = self.local_addr()?;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(match wake_addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        Ok(ShutdownHandle {
            stopping: self.stopping.clone(),
            wake_addr,
        })
    }

    /// Serve until a [`ShutdownHandle`] fires, then drain every connection
    pub fn run(self) -> Result<()> {
        info!("accepting connections on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            match stream {
                Ok(stream) => {
                    debug!("accepted {:?}", stream.peer_addr().ok());
                    if let Err(e) = self.handler.spawn(stream) {
                        error!("cannot start connection thread: {}", e);
                    }
                }
                Err(e) => warn!("accept error: {}", e),
            }
        }
        info!("shutting down");
        self.handler.close();
        Ok(())
    }
}

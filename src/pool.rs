/*!
 * Peer Connection Pool
 *
 * One pool per peer address. Connections are borrowed for a single relay
 * and handed back by the guard's `Drop`, so every exit path of the borrower
 * releases them. Broken connections are discarded instead of returned.
 * There is no health checking and no retry: a failed borrow is reported to
 * the caller straight away.
 */

use crate::client::PeerClient;
use crate::error::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct PeerPool {
    addr: String,
    max_active: usize,
    idle: Mutex<Vec<PeerClient>>,
    /// Live connections, idle or borrowed
    active: AtomicUsize,
}

impl PeerPool {
    /// Pool for `addr` holding at most `max_active` connections (`0` = no cap)
    pub fn new(addr: impl Into<String>, max_active: usize) -> Self {
        Self {
            addr: addr.into(),
            max_active: if max_active == 0 { usize::MAX } else { max_active },
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Take an idle connection or dial a new one
    pub fn borrow(&self) -> Result<PooledClient<'_>> {
        if let Some(client) = self.idle.lock().pop() {
            return Ok(PooledClient {
                pool: self,
                client: Some(client),
            });
        }

        let max = self.max_active;
        if self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(Error::Relay(format!(
                "connection pool for {} exhausted",
                self.addr
            )));
        }

        match PeerClient::connect(&self.addr) {
            Ok(client) => {
                debug!("opened peer connection to {}", self.addr);
                Ok(PooledClient {
                    pool: self,
                    client: Some(client),
                })
            }
            Err(e) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                Err(Error::Relay(format!("cannot connect to {}: {}", self.addr, e)))
            }
        }
    }

    fn give_back(&self, client: PeerClient) {
        if client.is_broken() {
            self.active.fetch_sub(1, Ordering::AcqRel);
            debug!("discarding broken connection to {}", self.addr);
        } else {
            self.idle.lock().push(client);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A borrowed connection; returns itself to the pool when dropped
pub struct PooledClient<'a> {
    pool: &'a PeerPool,
    client: Option<PeerClient>,
}

impl Deref for PooledClient<'_> {
    type Target = PeerClient;

    fn deref(&self) -> &PeerClient {
        self.client.as_ref().expect("client present until drop")
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut PeerClient {
        self.client.as_mut().expect("client present until drop")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.give_back(client);
        }
    }
}

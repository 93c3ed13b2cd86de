//! Idle connection pool (spec.md §3.6, §4.3).
//!
//! Keyed by `(host, port, ssl)`, capacity-bounded per key, with idle-time
//! eviction and a close-hint probe on checkout. Grounded on
//! `original_source/src/tcpconnect.cc`'s persistent-connection reuse and
//! `src/dlcon.cc`'s decision to discard a pooled socket the far side has
//! already half-closed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::debug;

use crate::connector::AsyncStream;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, ssl: bool) -> Self {
        Self { host: host.into(), port, ssl }
    }
}

struct IdleEntry {
    stream: Box<dyn AsyncStream>,
    inserted_at: Instant,
}

/// How long a checkout's "is the peer still there" probe read waits before
/// concluding the stream has no pending close notification.
const PROBE_WINDOW: Duration = Duration::from_millis(1);

pub struct ConnectionPool {
    capacity_per_key: usize,
    idle_timeout: Duration,
    slots: Mutex<HashMap<PoolKey, VecDeque<IdleEntry>>>,
}

impl ConnectionPool {
    pub fn new(capacity_per_key: usize, idle_timeout: Duration) -> Self {
        Self { capacity_per_key, idle_timeout, slots: Mutex::new(HashMap::new()) }
    }

    /// Returns a stream to the pool, evicting the oldest entry for this key
    /// if already at capacity (spec.md §4.3 "Capacity bounded").
    pub fn put(&self, key: PoolKey, stream: Box<dyn AsyncStream>) {
        let mut g = self.slots.lock();
        let dq = g.entry(key).or_default();
        if dq.len() >= self.capacity_per_key {
            dq.pop_front();
        }
        dq.push_back(IdleEntry { stream, inserted_at: Instant::now() });
    }

    /// Pops idle streams for `key` until one passes the close-hint probe (or
    /// none remain). Expired and half-closed streams are silently dropped
    /// along the way.
    pub async fn checkout(&self, key: &PoolKey) -> Option<Box<dyn AsyncStream>> {
        loop {
            let candidate = {
                let mut g = self.slots.lock();
                g.get_mut(key).and_then(|dq| dq.pop_front())
            };
            let mut entry = candidate?;

            if entry.inserted_at.elapsed() > self.idle_timeout {
                debug!(host = %key.host, port = key.port, "discarding expired idle stream");
                continue;
            }

            let mut probe = [0u8; 1];
            match tokio::time::timeout(PROBE_WINDOW, entry.stream.read(&mut probe)).await {
                // Nothing pending within the probe window: healthy, reuse it.
                Err(_) => return Some(entry.stream),
                // Peer sent something (EOF or stray bytes) while idle: discard.
                Ok(_) => {
                    debug!(host = %key.host, port = key.port, "discarding stream closed/dirty while idle");
                    continue;
                }
            }
        }
    }

    /// Periodic idle reaper (spec.md §3.6). Returns the number of streams
    /// dropped.
    pub fn reap_expired(&self) -> usize {
        let mut g = self.slots.lock();
        let mut removed = 0;
        for dq in g.values_mut() {
            let before = dq.len();
            dq.retain(|e| e.inserted_at.elapsed() <= self.idle_timeout);
            removed += before - dq.len();
        }
        g.retain(|_, dq| !dq.is_empty());
        removed
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.slots.lock().get(key).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (server, client.await.unwrap())
    }

    #[tokio::test]
    async fn checkout_returns_a_healthy_idle_stream() {
        let (server, client) = connected_pair().await;
        let pool = ConnectionPool::new(4, Duration::from_secs(60));
        let key = PoolKey::new("mirror.example", 80, false);
        pool.put(key.clone(), Box::new(client));

        let got = pool.checkout(&key).await;
        assert!(got.is_some());
        drop(server);
    }

    #[tokio::test]
    async fn checkout_discards_a_stream_closed_by_peer() {
        let (server, client) = connected_pair().await;
        drop(server); // peer closes immediately

        let pool = ConnectionPool::new(4, Duration::from_secs(60));
        let key = PoolKey::new("mirror.example", 80, false);
        pool.put(key.clone(), Box::new(client));

        // Give the close a moment to propagate.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let got = pool.checkout(&key).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_entry() {
        let pool = ConnectionPool::new(1, Duration::from_secs(60));
        let key = PoolKey::new("mirror.example", 80, false);

        let (s1, c1) = connected_pair().await;
        let (s2, c2) = connected_pair().await;
        pool.put(key.clone(), Box::new(c1));
        pool.put(key.clone(), Box::new(c2));
        assert_eq!(pool.idle_count(&key), 1);
        drop((s1, s2));
    }

    #[tokio::test]
    async fn reap_expired_drops_stale_entries() {
        let (server, client) = connected_pair().await;
        let pool = ConnectionPool::new(4, Duration::from_millis(5));
        let key = PoolKey::new("mirror.example", 80, false);
        pool.put(key.clone(), Box::new(client));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.reap_expired(), 1);
        assert_eq!(pool.idle_count(&key), 0);
        drop(server);
    }
}

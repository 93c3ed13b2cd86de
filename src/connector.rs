//! Connector trait and its TCP/happy-eyeballs implementation (spec.md §1
//! Out-of-scope "TLS/DNS libraries", §4.3 pool description).
//!
//! The core only ever consumes a trait object: TLS termination for
//! `https://` upstreams is an external collaborator's job (spec.md §1) — an
//! operator wires in a `Connector` that wraps the plain stream in a TLS
//! session before returning it. `TcpConnector` here is the default,
//! plain-TCP implementation used for `http://` backends and for tests.
//!
//! Grounded on `original_source/src/aconnect.h`/`caddrinfo.h`: multi-address
//! DNS resolution plus a staggered "happy-eyeballs" race between candidates.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::{AcngError, Result};

/// Whatever a `Connector` hands back: readable, writable, and unpin so it
/// can be stored behind a `Box` and driven from a single-threaded loop.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        ssl: bool,
        timeout: Duration,
    ) -> Result<Box<dyn AsyncStream>>;
}

/// Plain-TCP connector with a happy-eyeballs race across resolved
/// addresses (spec.md §4.3: "the first `connect()` is given `fasttimeout`
/// seconds; if not ready, the next candidate is started in parallel; [...]
/// that socket wins and all others are abandoned").
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    pub fasttimeout: Duration,
}

impl TcpConnector {
    pub fn new(fasttimeout: Duration) -> Self {
        Self { fasttimeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        ssl: bool,
        timeout: Duration,
    ) -> Result<Box<dyn AsyncStream>> {
        if ssl {
            debug!(host, port, "ssl requested but TcpConnector only does plain TCP; \
                    an outer TLS-wrapping Connector is expected to be substituted");
        }

        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| AcngError::Io(format!("DNS lookup for {host}:{port} failed: {e}")))?
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(AcngError::Io(format!("no addresses resolved for {host}:{port}")));
        }

        // Every candidate is spawned up front, staggered by `fasttimeout` per
        // rank, so a slow first address doesn't block a faster second one
        // (spec.md §4.3's "happy-eyeballs" race). The first to connect wins;
        // aborting the `JoinSet` on return cancels the rest.
        let mut set = tokio::task::JoinSet::new();
        for (rank, addr) in addrs.into_iter().enumerate() {
            let stagger = self.fasttimeout * rank as u32;
            set.spawn(async move {
                if rank > 0 {
                    tokio::time::sleep(stagger).await;
                }
                (addr, TcpStream::connect(addr).await)
            });
        }

        let race = async {
            let mut last_err: Option<String> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((addr, Ok(stream))) => return Ok(stream),
                    Ok((addr, Err(e))) => last_err = Some(format!("{addr}: {e}")),
                    Err(e) => last_err = Some(e.to_string()),
                }
            }
            Err(last_err.unwrap_or_else(|| "no candidates resolved".into()))
        };

        match tokio::time::timeout(timeout, race).await {
            Ok(Ok(stream)) => {
                set.abort_all();
                debug!(host, port, "connected");
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(AcngError::Io(format!("connect to {host}:{port} failed: {e}"))),
            Err(_) => {
                set.abort_all();
                Err(AcngError::Io(format!("connect to {host}:{port} timed out after {timeout:?}")))
            }
        }
    }
}

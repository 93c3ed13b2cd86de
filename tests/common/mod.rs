//! Shared test scaffolding for the integration suite: a minimal config
//! builder (mirroring `AcngConfig::for_tests`, which is `#[cfg(test)]`-only
//! and so isn't visible from outside the crate) and a scripted `Connector`
//! that hands out pre-established loopback streams, the way
//! `agent/engine.rs`'s own unit tests do.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acng_core::config::{AcngConfig, RangeOpsMode};
use acng_core::connector::{AsyncStream, Connector};
use acng_core::errors::{AcngError, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

pub fn test_config(cachedir: PathBuf) -> AcngConfig {
    AcngConfig {
        cachedir,
        nettimeout: Duration::from_secs(5),
        fasttimeout: Duration::from_millis(200),
        maxtempdelay: Duration::from_secs(27),
        stucksecs: Duration::from_secs(200),
        pipelinelen: 10,
        persistoutgoing: true,
        redirmax: 20,
        dlretriesmax: 15,
        maxdlspeed: 0,
        allocspace: 8 * 1024 * 1024,
        dlbufsize: 32 * 1024,
        vrangeops: RangeOpsMode::Enabled,
        exporigin: true,
        offlinemode: false,
        dirperms: 0o755,
        fileperms: 0o644,
        stupidfs: false,
        trackfileuse: false,
        resolver_table: Vec::new(),
        repos: std::collections::HashMap::new(),
        global_proxy: None,
        extra_upstream_headers: Vec::new(),
        forward_client_xff: false,
        prolonged_item_lifetime: Duration::from_secs(20),
        escape_dos_unfriendly: false,
    }
}

/// Hands out a fixed, pre-connected queue of streams in order; once
/// exhausted every further `connect()` fails, exercising the same
/// mirror-exhaustion path as a real unreachable backend.
pub struct ScriptedConnector {
    pub scripted: parking_lot::Mutex<VecDeque<TcpStream>>,
}

impl ScriptedConnector {
    pub fn new(streams: Vec<TcpStream>) -> Arc<dyn Connector> {
        Arc::new(Self { scripted: parking_lot::Mutex::new(VecDeque::from(streams)) })
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _host: &str, _port: u16, _ssl: bool, _timeout: Duration) -> Result<Box<dyn AsyncStream>> {
        let s = self.scripted.lock().pop_front().ok_or_else(|| AcngError::Io("no more scripted streams".into()))?;
        Ok(Box::new(s))
    }
}

/// Binds an ephemeral loopback listener and a connected client stream to
/// it, returning the server-side stream to drive a fake origin from.
pub async fn server_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (server, _) = listener.accept().await.unwrap();
    (server, client.await.unwrap())
}

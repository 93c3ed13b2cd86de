//! Download Agent (spec.md §3.3, §4.3-§4.5): the engine that turns a
//! [`DownloadJob`] into bytes fed to its file-item, driving connection
//! acquisition, mirror fail-over, redirect handling and header/body framing.
//!
//! Grounded on `original_source/src/dlcon.cc`'s `dlcon::WorkLoop`: the
//! source hand-multiplexes many jobs over shared sockets via libevent
//! callbacks stepping a `tDlJob`'s `EStreamState`. Tokio's scheduler gives
//! the same multiplex-many-jobs-over-shared-connections shape for free —
//! each job is its own cooperatively-scheduled future driving its
//! `DownloadJob::dl_state` instead of a hand-rolled fd-ready callback.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::agent::job::{evaluate_header, parse_last_modified, DownloadJob, HeaderAction, JobTarget};
use crate::agent::ratelimit::RateLimiter;
use crate::cache::fileitem::DestroyMode;
use crate::config::{AcngConfig, RangeOpsMode};
use crate::connector::{AsyncStream, Connector};
use crate::errors::{AcngError, Result};
use crate::http::chunked::ChunkDecoder;
use crate::http::{parse_response, RemoteStatus, ResponseHead};
use crate::pool::{ConnectionPool, PoolKey};

struct BlacklistEntry {
    #[allow(dead_code)]
    reason: String,
    #[allow(dead_code)]
    at: Instant,
}

/// Outcome of one connect-write-read attempt against the job's current
/// target, fed back into [`DownloadAgent::run_job`]'s retry loop.
enum AttemptError {
    /// Transport-level failure (connect refused/timed out, connection
    /// dropped mid-response): eligible for mirror fail-over.
    Transport(String),
    /// The response requires trying again against a (possibly new) target
    /// on a fresh connection — redirect applied, or a 416 probe retry —
    /// without counting against the mirror blacklist.
    Reconnect,
    /// Unrecoverable for this job: bad data, protocol violation, or a
    /// terminal upstream status.
    Fatal(AcngError),
}

/// Drives [`DownloadJob`]s to completion against their target backend(s),
/// with connection reuse, mirror fail-over, and adaptive rate limiting.
pub struct DownloadAgent {
    config: Arc<AcngConfig>,
    connector: Arc<dyn Connector>,
    pool: Arc<ConnectionPool>,
    rate_limiter: Arc<RateLimiter>,
    /// Session-scoped backend blacklist (SPEC_FULL.md §10): a backend that
    /// fails a transport-level connect is skipped for the rest of the
    /// process's lifetime, never persisted across restarts.
    blacklist: DashMap<String, BlacklistEntry>,
}

impl DownloadAgent {
    pub fn new(config: Arc<AcngConfig>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(
            config.pipelinelen.max(1),
            config.nettimeout,
        ));
        let rate_limiter = RateLimiter::new(config.maxdlspeed);
        Arc::new(Self { config, connector, pool, rate_limiter, blacklist: DashMap::new() })
    }

    pub fn is_blacklisted(&self, backend_base: &str) -> bool {
        self.blacklist.contains_key(backend_base)
    }

    fn blacklist_backend(&self, backend_base: &str, reason: String) {
        warn!(backend = backend_base, reason = %reason, "blacklisting mirror for this run");
        self.blacklist.insert(backend_base.to_string(), BlacklistEntry { reason, at: Instant::now() });
    }

    fn current_backend_base(&self, job: &DownloadJob) -> Option<String> {
        match &job.target {
            JobTarget::Repo { repo, backend_index, .. } => repo.backends.get(*backend_index).cloned(),
            JobTarget::ExplicitUrl(_) => None,
        }
    }

    /// Per-repo `proxy` takes precedence over `global_proxy` (SPEC_FULL.md
    /// §10 "Proxy chain precedence"); a job with neither dials direct.
    fn effective_proxy(&self, job: &DownloadJob) -> Option<url::Url> {
        let configured = match &job.target {
            JobTarget::Repo { repo, .. } => repo.proxy.as_ref().or(self.config.global_proxy.as_ref()),
            JobTarget::ExplicitUrl(_) => self.config.global_proxy.as_ref(),
        }?;
        url::Url::parse(configured).ok()
    }

    fn backend_count(&self, job: &DownloadJob) -> usize {
        match &job.target {
            JobTarget::Repo { repo, .. } => repo.backends.len(),
            JobTarget::ExplicitUrl(_) => 1,
        }
    }

    /// Runs `job` to completion: acquires a connection (pool or fresh
    /// dial), issues the request, reads and evaluates the response head,
    /// streams the body into the job's file-item, and fails over to the
    /// next mirror on transport errors (spec.md §8.3 scenario 5).
    pub async fn run_job(&self, job: &mut DownloadJob) -> Result<()> {
        let _active = self.rate_limiter.enter();
        let repo_name = match &job.target {
            JobTarget::Repo { repo, .. } => repo.name.clone(),
            JobTarget::ExplicitUrl(_) => String::new(),
        };

        let max_attempts = (self.config.dlretriesmax.max(1) as usize) * self.backend_count(job).max(1);
        for _ in 0..max_attempts {
            match self.attempt_once(job).await {
                Ok(()) => {
                    job.holder.get().dl_ref_dec(RemoteStatus::new(200, "OK"));
                    return Ok(());
                }
                Err(AttemptError::Reconnect) => continue,
                Err(AttemptError::Transport(msg)) => {
                    if let Some(base) = self.current_backend_base(job) {
                        self.blacklist_backend(&base, msg);
                    }
                    if job.advance_backend() {
                        job.reset_stream_state();
                        continue;
                    }
                    let status = RemoteStatus::new(502, "mirror exhausted");
                    job.holder.get().dl_set_error(status.clone(), DestroyMode::Truncate);
                    job.holder.get().dl_ref_dec(status);
                    return Err(AcngError::MirrorExhausted { repo: repo_name });
                }
                Err(AttemptError::Fatal(e)) => {
                    job.holder.get().dl_ref_dec(RemoteStatus::new(e.status_code(), e.to_string()));
                    return Err(e);
                }
            }
        }

        let status = RemoteStatus::new(503, "exceeded retry budget");
        job.holder.get().dl_set_error(status.clone(), DestroyMode::Truncate);
        job.holder.get().dl_ref_dec(status);
        Err(AcngError::Internal("exceeded retry budget".into()))
    }

    /// One connect-request-response cycle against the job's current target.
    async fn attempt_once(&self, job: &mut DownloadJob) -> std::result::Result<(), AttemptError> {
        // Skip any backend already blacklisted this run before dialing.
        while let Some(base) = self.current_backend_base(job) {
            if !self.is_blacklisted(&base) {
                break;
            }
            if !job.advance_backend() {
                return Err(AttemptError::Transport("all mirrors blacklisted".into()));
            }
        }

        let url = job
            .target
            .current_url()
            .ok_or_else(|| AttemptError::Fatal(AcngError::Internal("job has no resolvable url".into())))?;
        let host = url
            .host_str()
            .ok_or_else(|| AttemptError::Fatal(AcngError::Internal("url has no host".into())))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let ssl = url.scheme() == "https";

        // A failing per-repo/global proxy degrades to a direct connection
        // rather than failing the job outright (SPEC_FULL.md §10).
        let proxy = self.effective_proxy(job);
        let mut dial_host = host.clone();
        let mut dial_port = port;
        let mut dial_ssl = ssl;
        let mut via_proxy = false;
        if let Some(proxy_url) = &proxy {
            if let Some(proxy_host) = proxy_url.host_str() {
                let proxy_port = proxy_url.port_or_known_default().unwrap_or(3128);
                dial_host = proxy_host.to_string();
                dial_port = proxy_port;
                dial_ssl = false;
                via_proxy = true;
            }
        }

        let proxy_key = PoolKey::new(dial_host.clone(), dial_port, dial_ssl);

        let mut stream: Box<dyn AsyncStream> = match self.pool.checkout(&proxy_key).await {
            Some(s) => s,
            None => match self.connector.connect(&dial_host, dial_port, dial_ssl, self.config.nettimeout).await {
                Ok(s) => s,
                Err(e) if via_proxy => {
                    warn!(proxy = %dial_host, error = %e, "proxy unreachable, falling back to direct connection");
                    via_proxy = false;
                    dial_host = host.clone();
                    dial_port = port;
                    dial_ssl = ssl;
                    self.connector
                        .connect(&host, port, ssl, self.config.nettimeout)
                        .await
                        .map_err(|e| AttemptError::Transport(e.to_string()))?
                }
                Err(e) => return Err(AttemptError::Transport(e.to_string())),
            },
        };
        let key = PoolKey::new(dial_host, dial_port, dial_ssl);

        self.write_request(&mut stream, &url, &host, job, via_proxy)
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let (head, leftover) = loop {
            let (h, lo) = self
                .read_response_head(&mut stream)
                .await
                .map_err(|e| AttemptError::Transport(e.to_string()))?;
            if matches!(evaluate_header(&h, job, job.range_start_used), HeaderAction::Continue) {
                continue;
            }
            break (h, lo);
        };

        job.wants_close = head.headers.wants_close();
        let expected = job.range_start_used;
        let action = evaluate_header(&head, job, expected);

        match action {
            HeaderAction::Continue => unreachable!("filtered out above"),

            HeaderAction::Redirect { location } => {
                if job.is_passthrough {
                    // SPEC_FULL.md §11.3: re-evaluating a redirect mid-stream is
                    // unsafe for pass-through jobs other readers may be
                    // attached to; deliver the redirect status verbatim
                    // instead of chasing it.
                    let status = head.status.clone();
                    job.holder.get().dl_set_error(status.clone(), DestroyMode::Keep);
                    self.finish_stream(stream, &key, job, head.headers.wants_close()).await;
                    return Err(AttemptError::Fatal(AcngError::Upstream {
                        status: status.code,
                        message: location,
                    }));
                }
                job.apply_redirect(&location)
                    .map_err(|e| AttemptError::Fatal(AcngError::Upstream { status: 502, message: e.into() }))?;
                Err(AttemptError::Reconnect)
            }

            HeaderAction::RestartFullDownload => {
                job.probe_retried = true;
                job.range_start_used = -1;
                Err(AttemptError::Reconnect)
            }

            HeaderAction::RangeFailurePastStreamStart => {
                job.holder
                    .get()
                    .dl_set_error(RemoteStatus::new(416, "Range Not Satisfiable"), DestroyMode::Keep);
                Err(AttemptError::Fatal(AcngError::RangeNotSatisfiable))
            }

            HeaderAction::ResumeAccepted { seek_pos, content_length, probe_confirmed_current } => {
                let total_len = if content_length < 0 { -1 } else { seek_pos + content_length };
                self.accept_head(job, &head, seek_pos, total_len)?;
                if probe_confirmed_current {
                    job.holder.get().dl_finish(false);
                    self.finish_stream(stream, &key, job, head.headers.wants_close()).await;
                    return Ok(());
                }
                self.stream_body(&mut stream, job, &head, content_length, leftover).await?;
                self.finish_stream(stream, &key, job, job.wants_close).await;
                Ok(())
            }

            HeaderAction::FullBody { content_length } => {
                self.accept_head(job, &head, 0, content_length)?;
                self.stream_body(&mut stream, job, &head, content_length, leftover).await?;
                self.finish_stream(stream, &key, job, job.wants_close).await;
                Ok(())
            }

            HeaderAction::Deliver { status } => {
                if let JobTarget::Repo { repo, rest_path, .. } = &job.target {
                    if crate::agent::job::is_keyfile_missing(rest_path, status.code, &repo.keyfile_suffixes) {
                        if let Some(base) = self.current_backend_base(job) {
                            self.blacklist_backend(&base, format!("keyfile missing: {status}"));
                        }
                    }
                }
                let destroy = if status.code >= 500 { DestroyMode::Truncate } else { DestroyMode::Delete };
                job.holder.get().dl_set_error(status.clone(), destroy);
                self.finish_stream(stream, &key, job, head.headers.wants_close()).await;
                Err(AttemptError::Fatal(AcngError::Upstream { status: status.code, message: status.message }))
            }
        }
    }

    fn accept_head(
        &self,
        job: &DownloadJob,
        head: &ResponseHead,
        seek_pos: i64,
        total_len: i64,
    ) -> std::result::Result<(), AttemptError> {
        let mod_date = parse_last_modified(head);
        let origin = head.headers.get("x-original-source").map(str::to_string);
        let raw = Some(format!("HTTP/1.1 {}\r\n", head.status).into_bytes());
        let ok = job.holder.get().dl_started(raw, mod_date, origin, head.status.clone(), seek_pos, total_len);
        if !ok {
            return Err(AttemptError::Fatal(AcngError::CacheIntegrity(
                "response head contradicts a previously accepted one".into(),
            )));
        }
        Ok(())
    }

    /// Writes the request line, `Host`, an optional `Range`/`If-Range` pair
    /// (spec.md §4.4: resume for a partially cached item, or the
    /// probe-minus-one freshness check for a fully-cached volatile one),
    /// the job's extra headers, and `Connection`.
    async fn write_request(
        &self,
        stream: &mut Box<dyn AsyncStream>,
        url: &url::Url,
        host: &str,
        job: &mut DownloadJob,
        via_proxy: bool,
    ) -> Result<()> {
        let item = job.holder.get().clone();
        let method = if item.special_attrs.head_only { "HEAD" } else { "GET" };
        let path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        // Plain-HTTP proxying needs the absolute-form request target
        // (RFC 7230 §5.3.2); origin-form is used for a direct connection.
        let request_target = if via_proxy { url.as_str().to_string() } else { path };
        let mut req = format!("{method} {request_target} HTTP/1.1\r\nHost: {host}\r\n");

        let cached = item.size_checked();
        let known_len = item.content_length();
        let is_probe_case = item.special_attrs.volatile && known_len > 0 && cached == known_len;
        let send_range = cached > 0
            && match self.config.vrangeops {
                RangeOpsMode::Disabled => false,
                RangeOpsMode::Enabled => true,
                RangeOpsMode::ProbeOnly => is_probe_case,
            };

        if send_range {
            let start = if is_probe_case { known_len - 1 } else { cached };
            job.range_start_used = start;
            req.push_str(&format!("Range: bytes={start}-\r\n"));
            let mod_date = item.response_mod_date();
            if let Some(formatted) = mod_date.format() {
                req.push_str(&format!("If-Range: {formatted}\r\n"));
            }
        } else {
            job.range_start_used = -1;
        }

        for (k, v) in &job.extra_headers {
            req.push_str(&format!("{k}: {v}\r\n"));
        }
        req.push_str(if self.config.persistoutgoing { "Connection: keep-alive\r\n" } else { "Connection: close\r\n" });
        req.push_str("\r\n");

        stream.write_all(req.as_bytes()).await?;
        Ok(())
    }

    /// Reads until a full response head has arrived, returning it along
    /// with any body bytes already read past the header terminator.
    async fn read_response_head(&self, stream: &mut Box<dyn AsyncStream>) -> Result<(ResponseHead, Vec<u8>)> {
        let mut buf = Vec::with_capacity(self.config.dlbufsize);
        let mut tmp = vec![0u8; self.config.dlbufsize];
        loop {
            let n = tokio::time::timeout(self.config.nettimeout, stream.read(&mut tmp))
                .await
                .map_err(|_| AcngError::Io("response head read timed out".into()))??;
            if n == 0 {
                return Err(AcngError::MalformedHttp("connection closed before response head arrived".into()));
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some((head, consumed)) = parse_response(&buf)? {
                let leftover = buf[consumed..].to_vec();
                return Ok((head, leftover));
            }
            if buf.len() > 64 * 1024 {
                return Err(AcngError::MalformedHttp("response head exceeded size limit".into()));
            }
        }
    }

    /// Runs `FileItem::dl_add_data` (disk I/O for `Storage` items) on the
    /// blocking pool, mirroring `spldb_saver.rs`'s confinement of blocking
    /// fs calls away from the tokio worker thread. `false` on panic as well
    /// as rejection, since either way the chunk wasn't accepted.
    async fn add_data_blocking(item: &Arc<crate::cache::fileitem::FileItem>, chunk: Vec<u8>) -> bool {
        let item = item.clone();
        tokio::task::spawn_blocking(move || item.dl_add_data(&chunk)).await.unwrap_or(false)
    }

    /// Streams the response body into the job's file-item, decoding
    /// chunked transfer-coding via [`ChunkDecoder`] or reading a known (or
    /// EOF-terminated) byte count directly, throttled by the rate limiter.
    async fn stream_body(
        &self,
        stream: &mut Box<dyn AsyncStream>,
        job: &mut DownloadJob,
        head: &ResponseHead,
        announced_remaining: i64,
        mut leftover: Vec<u8>,
    ) -> std::result::Result<(), AttemptError> {
        let item = job.holder.get().clone();
        let chunked = head.headers.is_chunked();
        let mut buf = vec![0u8; self.config.dlbufsize];

        if chunked {
            let mut decoder = ChunkDecoder::new();
            job.chunk_decoder = None;
            loop {
                let (data, consumed) = decoder
                    .feed(&leftover)
                    .map_err(AttemptError::Fatal)?;
                if !data.is_empty() {
                    self.rate_limiter.throttle(data.len()).await;
                    if !Self::add_data_blocking(&item, data).await {
                        return Err(AttemptError::Fatal(AcngError::CacheIntegrity(
                            "file-item rejected chunk data".into(),
                        )));
                    }
                }
                leftover.drain(..consumed);
                if decoder.is_done() {
                    break;
                }
                let n = tokio::time::timeout(self.config.nettimeout, stream.read(&mut buf))
                    .await
                    .map_err(|_| AttemptError::Transport("body read timed out".into()))?
                    .map_err(|e| AttemptError::Transport(e.to_string()))?;
                if n == 0 {
                    return Err(AttemptError::Transport("connection closed mid chunked body".into()));
                }
                leftover.extend_from_slice(&buf[..n]);
            }
        } else {
            let mut remaining: i64 = announced_remaining;
            if !leftover.is_empty() {
                let take = if remaining < 0 { leftover.len() } else { (remaining as usize).min(leftover.len()) };
                let chunk = leftover[..take].to_vec();
                self.rate_limiter.throttle(chunk.len()).await;
                if !Self::add_data_blocking(&item, chunk).await {
                    return Err(AttemptError::Fatal(AcngError::CacheIntegrity("file-item rejected data".into())));
                }
                if remaining >= 0 {
                    remaining -= take as i64;
                }
            }
            while remaining != 0 {
                let want = if remaining < 0 { buf.len() } else { (remaining as usize).min(buf.len()) };
                let n = tokio::time::timeout(self.config.nettimeout, stream.read(&mut buf[..want]))
                    .await
                    .map_err(|_| AttemptError::Transport("body read timed out".into()))?
                    .map_err(|e| AttemptError::Transport(e.to_string()))?;
                if n == 0 {
                    if remaining < 0 {
                        break; // EOF-terminated body (no Content-Length): expected end
                    }
                    return Err(AttemptError::Transport("connection closed before body complete".into()));
                }
                self.rate_limiter.throttle(n).await;
                if !Self::add_data_blocking(&item, buf[..n].to_vec()).await {
                    return Err(AttemptError::Fatal(AcngError::CacheIntegrity("file-item rejected data".into())));
                }
                if remaining > 0 {
                    remaining -= n as i64;
                }
            }
        }

        item.dl_finish(true);
        Ok(())
    }

    /// Returns the connection to the pool unless the response asked for
    /// `Connection: close` or `persistoutgoing` is disabled.
    async fn finish_stream(&self, stream: Box<dyn AsyncStream>, key: &PoolKey, _job: &DownloadJob, wants_close: bool) {
        if wants_close || !self.config.persistoutgoing {
            return;
        }
        self.pool.put(key.clone(), stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::job::JobTarget;
    use crate::cache::fileitem::{FileItemKind, SpecialAttrs};
    use crate::cache::registry::{Registry, SharingHow};
    use crate::cache::store::CacheStore;
    use crate::config::AcngConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    struct StaticConnector {
        scripted: parking_lot::Mutex<VecDeque<TcpStream>>,
    }

    #[async_trait]
    impl Connector for StaticConnector {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
            _ssl: bool,
            _timeout: Duration,
        ) -> Result<Box<dyn AsyncStream>> {
            let s = self.scripted.lock().pop_front().ok_or_else(|| AcngError::Io("no more scripted streams".into()))?;
            Ok(Box::new(s))
        }
    }

    async fn server_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (server, client.await.unwrap())
    }

    fn agent_and_holder(cfg: Arc<AcngConfig>) -> (tempfile::TempDir, Arc<DownloadAgent>, crate::cache::holder::FileItemHolder) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let reg = Registry::new(store, cfg.clone());
        let holder = reg.create("pool/a.deb", SharingHow::AlwaysShare, SpecialAttrs::default(), FileItemKind::Storage);
        let connector: Arc<dyn Connector> = Arc::new(StaticConnector { scripted: parking_lot::Mutex::new(VecDeque::new()) });
        let agent = DownloadAgent::new(cfg, connector);
        (dir, agent, holder)
    }

    #[tokio::test]
    async fn full_download_persists_body_and_completes_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let cfg = Arc::new(AcngConfig::for_tests(dir.path().to_path_buf()));
        let reg = Registry::new(store.clone(), cfg.clone());
        let holder = reg.create("pool/a.deb", SharingHow::AlwaysShare, SpecialAttrs::default(), FileItemKind::Storage);

        let (mut server, client) = server_pair().await;
        let connector: Arc<dyn Connector> =
            Arc::new(StaticConnector { scripted: parking_lot::Mutex::new(VecDeque::from([client])) });
        let agent = DownloadAgent::new(cfg, connector);

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            let _req = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut job = DownloadJob::new(
            holder,
            JobTarget::ExplicitUrl(url::Url::parse("http://mirror.example/pool/a.deb").unwrap()),
            vec![],
            false,
            20,
        );
        agent.run_job(&mut job).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(job.holder.get().status(), crate::cache::fileitem::FiStatus::Complete);
        let body = store.open_body_ro("pool/a.deb").unwrap();
        use std::io::Read;
        let mut contents = Vec::new();
        { let mut f = body; f.read_to_end(&mut contents).unwrap(); }
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn connect_failure_blacklists_backend_and_fails_over() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(AcngConfig::for_tests(dir.path().to_path_buf()));
        let (_dir2, agent, holder) = agent_and_holder(cfg);

        let repo = Arc::new(crate::config::RepoDescriptor {
            name: "debian".into(),
            backends: vec!["http://127.0.0.1:1/".into(), "http://127.0.0.1:1/".into()],
            keyfile_suffixes: vec![],
            proxy: None,
        });
        let mut job = DownloadJob::new(
            holder,
            JobTarget::Repo { repo, rest_path: "pool/a.deb".into(), backend_index: 0 },
            vec![],
            false,
            20,
        );
        // The dummy StaticConnector has nothing scripted, so every attempt
        // fails as a transport error, exercising the blacklist + fail-over
        // path through to final exhaustion.
        let result = agent.run_job(&mut job).await;
        assert!(result.is_err());
    }

    #[test]
    fn per_repo_proxy_wins_over_global_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AcngConfig::for_tests(dir.path().to_path_buf());
        cfg.global_proxy = Some("http://global-proxy.example:3128".into());
        let (_dir2, agent, holder) = agent_and_holder(Arc::new(cfg));

        let repo = Arc::new(crate::config::RepoDescriptor {
            name: "debian".into(),
            backends: vec!["http://mirror.example/".into()],
            keyfile_suffixes: vec![],
            proxy: Some("http://repo-proxy.example:8080".into()),
        });
        let job = DownloadJob::new(
            holder,
            JobTarget::Repo { repo, rest_path: "pool/a.deb".into(), backend_index: 0 },
            vec![],
            false,
            20,
        );
        let proxy = agent.effective_proxy(&job).unwrap();
        assert_eq!(proxy.host_str(), Some("repo-proxy.example"));
    }

    #[test]
    fn global_proxy_used_when_repo_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AcngConfig::for_tests(dir.path().to_path_buf());
        cfg.global_proxy = Some("http://global-proxy.example:3128".into());
        let (_dir2, agent, holder) = agent_and_holder(Arc::new(cfg));

        let repo = Arc::new(crate::config::RepoDescriptor {
            name: "debian".into(),
            backends: vec!["http://mirror.example/".into()],
            keyfile_suffixes: vec![],
            proxy: None,
        });
        let job = DownloadJob::new(
            holder,
            JobTarget::Repo { repo, rest_path: "pool/a.deb".into(), backend_index: 0 },
            vec![],
            false,
            20,
        );
        let proxy = agent.effective_proxy(&job).unwrap();
        assert_eq!(proxy.host_str(), Some("global-proxy.example"));
    }

    #[tokio::test]
    async fn keyfile_missing_response_blacklists_backend() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(AcngConfig::for_tests(dir.path().to_path_buf()));
        let (_dir2, agent, holder) = agent_and_holder(cfg.clone());

        let repo = Arc::new(crate::config::RepoDescriptor {
            name: "debian".into(),
            backends: vec!["http://mirror.example/".into()],
            keyfile_suffixes: vec!["Release.gpg".into()],
            proxy: None,
        });
        let (mut server, client) = server_pair().await;
        let connector: Arc<dyn Connector> =
            Arc::new(StaticConnector { scripted: parking_lot::Mutex::new(VecDeque::from([client])) });
        let agent = DownloadAgent::new(cfg, connector);

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let _n = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n").await.unwrap();
        });

        let mut job = DownloadJob::new(
            holder,
            JobTarget::Repo { repo, rest_path: "debian/Release.gpg".into(), backend_index: 0 },
            vec![],
            false,
            20,
        );
        let _ = agent.run_job(&mut job).await;
        server_task.await.unwrap();

        assert!(agent.is_blacklisted("http://mirror.example/"));
    }
}

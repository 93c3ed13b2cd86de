//! Client Job (spec.md §3.5/§4.6): the per-connection state machine that
//! turns one parsed client request into a cache lookup, an optional
//! download hand-off to the Agent, and a synthesized response streamed
//! back from the file-item.
//!
//! Grounded on `original_source/src/job.h`/`job.cc`'s `tRepoUsageHooks` and
//! `eJobResult` state machine (`PREPARE`, `STATE_SEND_DATA` /
//! `STATE_SEND_CHUNK_HEADER`, `STATE_SEND_CHUNK_DATA`, `FILE_SOLID`
//! classification etc.) and `tHttpUrl`'s traversal checks.

pub mod classify;
pub mod range;

use std::sync::Arc;

use tracing::warn;

use crate::cache::fileitem::FiStatus;
use crate::cache::holder::FileItemHolder;
use crate::cache::registry::SharingHow;
use crate::config::AcngConfig;
use crate::context::Context;
use crate::errors::{AcngError, Result};
use crate::http::{Headers, HttpDate, Method, RemoteStatus, RequestHead};
use crate::key::derive_key;

pub use classify::{is_nasty_path, FileClass, UrlClassifier};
pub use range::{parse_range, ByteRange};

/// Mirrors `tDlJob`'s client-facing counterpart, `eJobResult`
/// (spec.md §4.6 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientJobState {
    NotStarted,
    SendData,
    SendChunkHeader,
    SendChunkData,
    Done,
    /// Sending a locally-composed buffer (error page, directory listing)
    /// rather than file-item bytes.
    SendBufNotFitem,
    DiscoAsap,
}

/// What [`ClientJob::cook_response_header`] decided to do, paired with the
/// ready-to-send header bytes.
#[derive(Debug)]
pub struct CookedResponse {
    pub head_bytes: Vec<u8>,
    pub next_state: ClientJobState,
    /// `true` once a response head has been emitted; failure handling after
    /// this point must disconnect rather than substitute an error page
    /// (spec.md §4.6.4).
    pub committed: bool,
}

/// One client request's worth of cache-lookup and streaming state.
pub struct ClientJob {
    pub peer: String,
    pub method: Method,
    pub path: String,
    pub keep_alive: bool,
    pub is_passthrough: bool,
    pub class: FileClass,
    pub holder: Option<FileItemHolder>,
    /// Canonical, normalized cache key (spec.md §3.1) — what the registry
    /// and the on-disk layout actually index by, as opposed to `path`,
    /// which is the raw request path echoed back in `X-Original-Source`.
    pub cache_key: String,
    pub range: Option<ByteRange>,
    /// Raw `Range:` header value, kept so the range can be re-parsed once
    /// the real content length is known (spec.md §4.6.1 step 12: the
    /// length snapshotted in `prepare()` is `-1` for an item that hasn't
    /// been downloaded before, so an open-ended range parsed against it
    /// would wrongly resolve `to` to "unbounded" and then fail a bounds
    /// check against the real length later).
    raw_range_header: Option<String>,
    pub if_modified_since: Option<HttpDate>,
    pub send_pos: u64,
    pub state: ClientJobState,
    config: Arc<AcngConfig>,
}

impl ClientJob {
    /// Runs spec.md §4.6.1's preparation steps: method check, path safety,
    /// URL classification, pass-through decision, registry acquisition,
    /// `setup()`. Returns `Err` with a `RemoteStatus` ready to be rendered
    /// as an error page for anything rejected before a file-item is even
    /// acquired (steps 1-8).
    pub async fn prepare(ctx: &Context, request: &RequestHead, peer: String) -> std::result::Result<Self, RemoteStatus> {
        if request.method != Method::Get && request.method != Method::Head {
            return Err(RemoteStatus::new(403, "method not allowed"));
        }

        let keep_alive = match request.headers.get("connection") {
            Some(v) => v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("keep-alive")),
            None => true,
        };

        let path = normalize_https_scheme_hack(&request.path);

        if is_nasty_path(&path) {
            return Err(RemoteStatus::new(403, "rejected path"));
        }

        let class = ctx.classifier.classify(&path);
        if class == FileClass::Nasty {
            return Err(RemoteStatus::new(403, "rejected path"));
        }

        let no_store = request
            .headers
            .get("cache-control")
            .is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("no-store")));
        let is_passthrough = class == FileClass::PassThrough || no_store;

        let cache_key = derive_key(&ctx.resolver, &ctx.own_host_port, &path, ctx.config.escape_dos_unfriendly).path;

        let mut job = Self {
            peer,
            method: request.method,
            path: path.clone(),
            keep_alive,
            is_passthrough,
            class,
            holder: None,
            cache_key,
            range: None,
            raw_range_header: request.headers.get("range").map(str::to_string),
            if_modified_since: request.headers.get("if-modified-since").and_then(HttpDate::parse),
            send_pos: 0,
            state: ClientJobState::NotStarted,
            config: ctx.config.clone(),
        };

        job.acquire_item(ctx, &path).await;

        if let Some(range_hdr) = &job.raw_range_header {
            let known_len = job.holder.as_ref().map(|h| h.get().content_length()).unwrap_or(-1);
            job.range = parse_range(range_hdr, known_len);
        }

        Ok(job)
    }

    /// Re-parses the `Range:` header against the now-resolved content length.
    ///
    /// The parse done in `prepare()` used whatever length was known before
    /// `wait_for_head()` ran, which is `-1` for an item that hasn't been
    /// downloaded before. An open-ended range parsed against `-1` resolves
    /// `to` to `i64::MAX`, which then fails every bounds check once the real
    /// length is known. Call this after `wait_for_head()` returns.
    fn reparse_range(&mut self) {
        let Some(range_hdr) = &self.raw_range_header else { return };
        let known_len = self.holder.as_ref().map(|h| h.get().content_length()).unwrap_or(-1);
        self.range = parse_range(range_hdr, known_len);
    }

    async fn acquire_item(&mut self, ctx: &Context, path: &str) {
        let how = if self.is_passthrough { SharingHow::ForceMoveOutOfTheWay } else { SharingHow::AutoMoveOutOfTheWay };
        let kind = if self.is_passthrough {
            crate::cache::fileitem::FileItemKind::PassThrough
        } else {
            crate::cache::fileitem::FileItemKind::Storage
        };
        let special = crate::cache::fileitem::SpecialAttrs {
            volatile: self.class == FileClass::Volatile,
            head_only: self.method == Method::Head,
            no_store: self.is_passthrough,
            range_limit: -1,
            credentials: String::new(),
        };

        let holder = ctx.registry.create(&self.cache_key, how, special.clone(), kind);
        let status = holder.get().setup();

        if ctx.config.trackfileuse && !self.is_passthrough {
            if let Err(e) = ctx.store.record_access(&self.cache_key) {
                warn!(key = %self.cache_key, error = %e, "failed to record last-access time");
            }
        }

        if status != FiStatus::Complete {
            // A second, independently-owned holder for the download job:
            // it shares the same file-item (same key, same registry) but
            // outlives this client's holder on its own reference count.
            let dl_holder = ctx.registry.create(&self.cache_key, SharingHow::AlwaysShare, special, kind);
            if let Some(resolved) = ctx.resolver.resolve(&ctx.own_host_port, path) {
                let target = crate::agent::job::JobTarget::Repo {
                    repo: resolved.repo,
                    rest_path: resolved.rest_path,
                    backend_index: 0,
                };
                ctx.spawn_download(dl_holder, target, self.is_passthrough);
            } else if let Ok(url) = url::Url::parse(path) {
                let target = crate::agent::job::JobTarget::ExplicitUrl(url);
                ctx.spawn_download(dl_holder, target, self.is_passthrough);
            } else {
                warn!(path, "no route and not a valid absolute url; serving whatever is cached");
            }
        }

        self.holder = Some(holder);
    }

    /// Waits until the item has at least a response head (spec.md §4.6.2:
    /// "Called once the item has reached at least `DL_GOT_HEAD`").
    pub async fn wait_for_head(&mut self) -> FiStatus {
        let Some(holder) = &self.holder else { return FiStatus::DlError };
        let item = holder.get().clone();
        let nettimeout = self.config.nettimeout;
        let status = loop {
            let status = item.status();
            if status >= FiStatus::DlGotHead {
                break status;
            }
            let (status, _) = item.wait_for_finish(Some(nettimeout), || true).await;
            if status >= FiStatus::DlGotHead {
                break status;
            }
        };
        self.reparse_range();
        status
    }

    /// Synthesizes the response header (spec.md §4.6.2).
    pub fn cook_response_header(&mut self) -> CookedResponse {
        let Some(holder) = &self.holder else {
            return self.synthesize_error(RemoteStatus::new(500, "no file-item"));
        };
        let item = holder.get();
        let status = item.status();
        let response_status = item.response_status();

        if status == FiStatus::DlError {
            return self.synthesize_error(response_status);
        }

        if response_status.is_redirect() {
            let mut headers = Headers::default();
            headers.push("Location", response_status.message.clone());
            self.finish_header(response_status, headers, false)
        } else if let (Some(ims), true) = (self.if_modified_since, item.response_mod_date().is_set()) {
            if item.response_mod_date() <= ims {
                self.finish_header(RemoteStatus::new(304, "Not Modified"), Headers::default(), false)
            } else {
                self.cook_body_header(&item)
            }
        } else {
            self.cook_body_header(&item)
        }
    }

    fn cook_body_header(&mut self, item: &Arc<crate::cache::fileitem::FileItem>) -> CookedResponse {
        let content_length = item.content_length();
        let still_receiving = item.status() < FiStatus::Complete;

        // Length unknown (still chunked from upstream): always chunk-encode
        // to the client too, Range request or not (spec.md §4.6.2) — there
        // is no total length to validate or satisfy a byte-range against
        // yet, so a Range header can't be honored here.
        if content_length < 0 && still_receiving {
            self.send_pos = 0;
            let mut headers = Headers::default();
            headers.push("Transfer-Encoding", "chunked");
            self.state = ClientJobState::SendChunkHeader;
            return self.finish_header(RemoteStatus::new(200, "OK"), headers, true);
        }

        if let Some(range) = self.range {
            if content_length >= 0 && (range.from >= content_length || range.to >= content_length) {
                return self.synthesize_error(RemoteStatus::new(416, "Range Not Satisfiable"));
            }
            if content_length >= 0 {
                self.send_pos = range.from as u64;
                let mut headers = Headers::default();
                headers.push("Content-Range", format!("bytes {}-{}/{}", range.from, range.to, content_length));
                headers.push("Content-Length", (range.to - range.from + 1).to_string());
                self.state = ClientJobState::SendData;
                return self.finish_header(RemoteStatus::new(206, "Partial Content"), headers, true);
            }
        }

        self.send_pos = 0;
        let mut headers = Headers::default();
        headers.push("Content-Length", content_length.max(0).to_string());
        if let Some(mod_date) = item.response_mod_date().format() {
            headers.push("Last-Modified", mod_date);
        }
        if self.config.exporigin {
            headers.push("X-Original-Source", self.path.clone());
        }
        self.state = ClientJobState::SendData;
        self.finish_header(RemoteStatus::new(200, "OK"), headers, true)
    }

    fn finish_header(&mut self, status: RemoteStatus, mut headers: Headers, has_body: bool) -> CookedResponse {
        headers.push("Date", httpdate::fmt_http_date(std::time::SystemTime::now()));
        headers.push("Server", "acng-core");
        headers.push("Connection", if self.keep_alive { "keep-alive" } else { "close" });
        if !has_body {
            self.state = ClientJobState::Done;
        }
        let head_bytes =
            crate::http::format_response_head(crate::http::header::HttpVersion::Http11, &status, &headers);
        CookedResponse { head_bytes, next_state: self.state, committed: true }
    }

    fn synthesize_error(&mut self, status: RemoteStatus) -> CookedResponse {
        self.state = ClientJobState::Done;
        let body = format!(
            "<html><head><title>{0} {1}</title></head><body><h1>{0} {1}</h1></body></html>",
            status.code, status.message
        );
        let mut headers = Headers::default();
        headers.push("Content-Type", "text/html");
        headers.push("Content-Length", body.len().to_string());
        headers.push("Date", httpdate::fmt_http_date(std::time::SystemTime::now()));
        headers.push("Server", "acng-core");
        headers.push("Connection", if self.keep_alive { "keep-alive" } else { "close" });
        let mut head_bytes =
            crate::http::format_response_head(crate::http::header::HttpVersion::Http11, &status, &headers);
        head_bytes.extend_from_slice(body.as_bytes());
        CookedResponse { head_bytes, next_state: ClientJobState::Done, committed: false }
    }

    /// One `SEND_DATA` step (spec.md §4.6.3): waits for more bytes to
    /// become available, bounded by the client's requested range, and
    /// returns what to write next (`None` once done).
    pub async fn next_body_chunk(&mut self, bufsize: usize) -> Result<Option<Vec<u8>>> {
        let Some(holder) = &self.holder else { return Ok(None) };
        let item = holder.get().clone();

        let limit = self.range.map(|r| r.to as u64 + 1);
        loop {
            let available = item.size_checked().max(0) as u64;
            let cap = limit.map(|l| l.min(available)).unwrap_or(available);
            if self.send_pos < cap {
                let want = ((cap - self.send_pos) as usize).min(bufsize);
                let mut pos = self.send_pos;
                // Storage items read from disk; keep that syscall off the
                // tokio worker thread (teacher's `spldb_saver.rs` idiom of
                // confining blocking fs calls to `spawn_blocking`).
                let blocking_item = item.clone();
                let (chunk, new_pos) = tokio::task::spawn_blocking(move || {
                    let mut pos = pos;
                    let chunk = blocking_item.read_body_chunk(&mut pos, want);
                    (chunk, pos)
                })
                .await
                .map_err(|e| AcngError::Internal(format!("body read task panicked: {e}")))?;
                let chunk = chunk?;
                pos = new_pos;
                self.send_pos = pos;
                if chunk.is_empty() {
                    continue;
                }
                return Ok(Some(chunk));
            }

            let done = limit.is_some_and(|l| self.send_pos >= l) || item.status() >= FiStatus::Complete;
            if done {
                self.state = ClientJobState::Done;
                return Ok(None);
            }

            let (status, resp) = item.wait_for_finish(Some(self.config.nettimeout), || true).await;
            if status == FiStatus::DlError && self.send_pos == 0 {
                return Err(AcngError::Upstream { status: resp.code, message: resp.message });
            }
        }
    }
}

/// Normalizes the `https://host/path` scheme hack some clients (notably
/// acngfs) embed in the request path instead of using `CONNECT`.
fn normalize_https_scheme_hack(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("https://") {
        rest.find('/').map(|i| rest[i..].to_string()).unwrap_or_else(|| "/".to_string())
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_scheme_hack_is_stripped_to_path() {
        assert_eq!(normalize_https_scheme_hack("https://mirror.example/debian/Release"), "/debian/Release");
        assert_eq!(normalize_https_scheme_hack("/debian/Release"), "/debian/Release");
    }
}

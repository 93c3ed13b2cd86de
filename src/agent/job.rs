//! Download Job (spec.md §3.5) and the pure `GETHEADER` response-handling
//! decision logic (spec.md §4.4's `GETHEADER` bullet), grounded on
//! `original_source/src/dlcon.cc`'s `tDlJob` (fields, `RewriteSource` for
//! redirects) and `src/job.h`'s state-machine vocabulary.

use std::time::Duration;

use url::Url;

use crate::cache::holder::FileItemHolder;
use crate::config::RepoDescriptor;
use crate::http::chunked::ChunkDecoder;
use crate::http::{HttpDate, RemoteStatus, ResponseHead};
use std::sync::Arc;

/// Mirrors `tDlJob::EStreamState` (spec.md §3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlState {
    GetHeader,
    ProcessData,
    GetChunkHead,
    ProcessChunkData,
    GetChunkTrailer,
    Finish,
}

/// Where the job is pointed: an explicit URL (pass-through / redirected out
/// of backend mode), or a repo-resolved path still eligible for mirror
/// fail-over (spec.md §3.4, §3.5).
#[derive(Debug, Clone)]
pub enum JobTarget {
    ExplicitUrl(Url),
    Repo { repo: Arc<RepoDescriptor>, rest_path: String, backend_index: usize },
}

impl JobTarget {
    /// Resolves the concrete URL to request right now.
    pub fn current_url(&self) -> Option<Url> {
        match self {
            JobTarget::ExplicitUrl(u) => Some(u.clone()),
            JobTarget::Repo { repo, rest_path, backend_index } => {
                let base = repo.backends.get(*backend_index)?;
                let mut s = base.trim_end_matches('/').to_string();
                s.push('/');
                s.push_str(rest_path.trim_start_matches('/'));
                Url::parse(&s).ok()
            }
        }
    }

    pub fn is_backend_mode(&self) -> bool {
        matches!(self, JobTarget::Repo { .. })
    }
}

pub struct DownloadJob {
    pub holder: FileItemHolder,
    pub target: JobTarget,
    pub extra_headers: Vec<(String, String)>,
    pub is_passthrough: bool,
    /// Byte offset the current request's `Range:` header asked for, or -1
    /// when the request was unranged (spec.md §3.5 `range_start_used`).
    pub range_start_used: i64,
    pub redir_budget: u32,
    pub dl_state: DlState,
    /// SPEC_FULL.md §11 item 1: tracks whether the probe-minus-one 416
    /// fallback HEAD has already been issued for this job, so it is
    /// attempted at most once.
    pub probe_retried: bool,
    pub chunk_decoder: Option<ChunkDecoder>,
    pub wants_close: bool,
}

impl DownloadJob {
    pub fn new(
        holder: FileItemHolder,
        target: JobTarget,
        extra_headers: Vec<(String, String)>,
        is_passthrough: bool,
        redir_budget: u32,
    ) -> Self {
        holder.get().dl_ref_add();
        Self {
            holder,
            target,
            extra_headers,
            is_passthrough,
            range_start_used: -1,
            redir_budget,
            dl_state: DlState::GetHeader,
            probe_retried: false,
            chunk_decoder: None,
            wants_close: false,
        }
    }

    pub fn reset_stream_state(&mut self) {
        self.dl_state = DlState::GetHeader;
        self.range_start_used = -1;
        self.chunk_decoder = None;
    }

    /// Mirrors `tDlJob::RewriteSource`: applies a redirect `Location`,
    /// switching between backend mode and explicit-URL mode as needed.
    /// Returns `false` (and leaves `error` set internally by the caller) on
    /// loop exhaustion or a malformed target.
    pub fn apply_redirect(&mut self, location: &str) -> Result<(), &'static str> {
        if self.redir_budget == 0 {
            return Err("redirection loop");
        }
        self.redir_budget -= 1;

        if location.is_empty() {
            return Err("bad redirection");
        }

        if let Some(rest) = location.strip_prefix('/') {
            // Absolute path on the same host.
            match &mut self.target {
                JobTarget::ExplicitUrl(u) => {
                    u.set_path(&format!("/{rest}"));
                }
                JobTarget::Repo { repo, backend_index, .. } => {
                    let base = repo
                        .backends
                        .get(*backend_index)
                        .ok_or("bad redirection target in backend mode")?;
                    let mut base_url = Url::parse(base).map_err(|_| "bad redirection target")?;
                    base_url.set_path(&format!("/{rest}"));
                    self.target = JobTarget::ExplicitUrl(base_url);
                }
            }
            return Ok(());
        }

        if let Ok(new_url) = Url::parse(location) {
            self.target = JobTarget::ExplicitUrl(new_url);
            return Ok(());
        }

        // Relative path: resolve it against the current URL's directory.
        let current = self.target.current_url().ok_or("no current url to resolve against")?;
        let joined = current.join(location).map_err(|_| "bad redirection")?;
        self.target = JobTarget::ExplicitUrl(joined);
        Ok(())
    }

    /// Advances `target` to the next mirror for backend-mode jobs after a
    /// failure (spec.md §2 "backend fail-over"). Returns `false` once every
    /// backend has been tried.
    pub fn advance_backend(&mut self) -> bool {
        match &mut self.target {
            JobTarget::Repo { repo, backend_index, .. } => {
                if *backend_index + 1 < repo.backends.len() {
                    *backend_index += 1;
                    true
                } else {
                    false
                }
            }
            JobTarget::ExplicitUrl(_) => false,
        }
    }
}

/// Outcome of evaluating a just-parsed response head in `GETHEADER`
/// (spec.md §4.4). Kept as data so the decision logic is unit-testable
/// without sockets.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderAction {
    /// 1xx other than the final status: drop and keep reading.
    Continue,
    /// 301/302/303/307/308: apply the redirect, then restart at GETHEADER.
    Redirect { location: String },
    /// 416 on a fresh item that never validated a byte: clear cached size
    /// and request a full re-download.
    RestartFullDownload,
    /// 416 after bytes were already streamed to the client: unrecoverable.
    RangeFailurePastStreamStart,
    /// 206: resume accepted; `content_length` is the remaining byte count,
    /// `probe_confirmed_current` is set when this was a probe-minus-one
    /// check whose range matches the already-cached end exactly.
    ResumeAccepted { seek_pos: i64, content_length: i64, probe_confirmed_current: bool },
    /// 200: full body follows from offset 0.
    FullBody { content_length: i64 },
    /// Any other status: deliver to the file-item, no body expected from us.
    Deliver { status: RemoteStatus },
}

/// Determines what a job should do with a parsed response head, given its
/// current state (spec.md §4.4 `GETHEADER` bullet point by point). This is
/// the decision function the engine's I/O loop calls before touching the
/// file-item or the socket.
pub fn evaluate_header(
    head: &ResponseHead,
    job: &DownloadJob,
    expected_resume_offset: i64,
) -> HeaderAction {
    let code = head.status.code;

    if (100..200).contains(&code) && code != 101 {
        return HeaderAction::Continue;
    }

    if head.status.is_redirect() {
        let location = head.headers.get("location").unwrap_or_default().to_string();
        return HeaderAction::Redirect { location };
    }

    if code == 416 {
        if expected_resume_offset <= 0 && !job.probe_retried {
            return HeaderAction::RestartFullDownload;
        }
        return HeaderAction::RangeFailurePastStreamStart;
    }

    if code == 206 {
        let (start, _end, _total) = parse_content_range(head.headers.get("content-range").unwrap_or_default())
            .unwrap_or((expected_resume_offset.max(0), -1, -1));
        let content_length = head.headers.content_length().unwrap_or(-1);
        let probe_confirmed_current = job.range_start_used >= 0 && start == job.range_start_used;
        return HeaderAction::ResumeAccepted { seek_pos: start, content_length, probe_confirmed_current };
    }

    if code == 200 {
        let content_length = head.headers.content_length().unwrap_or(-1);
        return HeaderAction::FullBody { content_length };
    }

    HeaderAction::Deliver { status: RemoteStatus { code: head.status.code, message: head.status.message.clone() } }
}

/// Parses `Content-Range: bytes start-end/total`. Returns `(start, end,
/// total)`; `total` is `-1` for `*`.
fn parse_content_range(value: &str) -> Option<(i64, i64, i64)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let total = if total.trim() == "*" { -1 } else { total.trim().parse().ok()? };
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

/// Detects a keyfile-missing pattern: a configured keyfile suffix that came
/// back with >= 400 (SPEC_FULL.md §10 "keyfile blacklisting detail").
pub fn is_keyfile_missing(path: &str, status_code: u16, keyfile_suffixes: &[String]) -> bool {
    status_code >= 400 && keyfile_suffixes.iter().any(|sfx| path.ends_with(sfx.as_str()))
}

pub fn parse_last_modified(head: &ResponseHead) -> HttpDate {
    head.headers
        .get("last-modified")
        .and_then(HttpDate::parse)
        .unwrap_or_else(HttpDate::unset)
}

pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(200);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;

    fn head(status: u16, headers: Vec<(&str, &str)>) -> ResponseHead {
        ResponseHead {
            version: crate::http::header::HttpVersion::Http11,
            status: RemoteStatus { code: status, message: "x".into() },
            headers: Headers(headers.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        }
    }

    fn dummy_job(holder: FileItemHolder) -> DownloadJob {
        DownloadJob::new(holder, JobTarget::ExplicitUrl(Url::parse("http://x/y").unwrap()), vec![], false, 20)
    }

    fn test_holder() -> (tempfile::TempDir, FileItemHolder) {
        use crate::cache::fileitem::{FileItemKind, SpecialAttrs};
        use crate::cache::registry::{Registry, SharingHow};
        use crate::cache::store::CacheStore;
        use crate::config::AcngConfig;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let cfg = Arc::new(AcngConfig::for_tests(dir.path().to_path_buf()));
        let reg = Registry::new(store, cfg);
        let holder = reg.create("k", SharingHow::AlwaysShare, SpecialAttrs::default(), FileItemKind::Storage);
        (dir, holder)
    }

    #[test]
    fn informational_status_continues() {
        let (_d, h) = test_holder();
        let job = dummy_job(h);
        assert_eq!(evaluate_header(&head(100, vec![]), &job, -1), HeaderAction::Continue);
    }

    #[test]
    fn redirect_status_yields_location() {
        let (_d, h) = test_holder();
        let job = dummy_job(h);
        let action = evaluate_header(&head(302, vec![("location", "/new/path")]), &job, -1);
        assert_eq!(action, HeaderAction::Redirect { location: "/new/path".into() });
    }

    #[test]
    fn fresh_416_requests_full_restart() {
        let (_d, h) = test_holder();
        let job = dummy_job(h);
        let action = evaluate_header(&head(416, vec![]), &job, -1);
        assert_eq!(action, HeaderAction::RestartFullDownload);
    }

    #[test]
    fn repeated_416_after_probe_retry_fails_hard() {
        let (_d, h) = test_holder();
        let mut job = dummy_job(h);
        job.probe_retried = true;
        let action = evaluate_header(&head(416, vec![]), &job, -1);
        assert_eq!(action, HeaderAction::RangeFailurePastStreamStart);
    }

    #[test]
    fn two_hundred_six_parses_content_range() {
        let (_d, h) = test_holder();
        let job = dummy_job(h);
        let action = evaluate_header(
            &head(206, vec![("content-range", "bytes 100-199/200"), ("content-length", "100")]),
            &job,
            100,
        );
        assert_eq!(
            action,
            HeaderAction::ResumeAccepted { seek_pos: 100, content_length: 100, probe_confirmed_current: false }
        );
    }

    #[test]
    fn two_hundred_resets_to_full_body() {
        let (_d, h) = test_holder();
        let job = dummy_job(h);
        let action = evaluate_header(&head(200, vec![("content-length", "555")]), &job, 100);
        assert_eq!(action, HeaderAction::FullBody { content_length: 555 });
    }

    #[test]
    fn redirect_in_backend_mode_with_absolute_path_stays_on_backend() {
        let (_d, h) = test_holder();
        let repo = Arc::new(RepoDescriptor {
            name: "debian".into(),
            backends: vec!["http://mirror.example/debian".into()],
            keyfile_suffixes: vec![],
            proxy: None,
        });
        let mut job = DownloadJob::new(
            h,
            JobTarget::Repo { repo, rest_path: "pool/a.deb".into(), backend_index: 0 },
            vec![],
            false,
            20,
        );
        job.apply_redirect("/pool/b.deb").unwrap();
        assert_eq!(job.target.current_url().unwrap().path(), "/pool/b.deb");
    }

    #[test]
    fn redirect_loop_exhaustion_is_rejected() {
        let (_d, h) = test_holder();
        let mut job = dummy_job(h);
        job.redir_budget = 0;
        assert!(job.apply_redirect("/x").is_err());
    }

    #[test]
    fn keyfile_missing_pattern_detected() {
        assert!(is_keyfile_missing("debian/Release.gpg", 404, &["Release.gpg".into()]));
        assert!(!is_keyfile_missing("debian/Release.gpg", 200, &["Release.gpg".into()]));
        assert!(!is_keyfile_missing("debian/pool/a.deb", 404, &["Release.gpg".into()]));
    }

    #[test]
    fn advance_backend_exhausts_mirror_list() {
        let (_d, h) = test_holder();
        let repo = Arc::new(RepoDescriptor {
            name: "debian".into(),
            backends: vec!["http://a/".into(), "http://b/".into()],
            keyfile_suffixes: vec![],
            proxy: None,
        });
        let mut job = DownloadJob::new(
            h,
            JobTarget::Repo { repo, rest_path: "x".into(), backend_index: 0 },
            vec![],
            false,
            20,
        );
        assert!(job.advance_backend());
        assert!(!job.advance_backend());
    }
}

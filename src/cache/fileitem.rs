//! File-Item state machine (spec.md §3.2, §4.2).
//!
//! Grounded on `original_source/src/fileitem.h`/`fileitem.cc`: `FiStatus`,
//! `EDestroyMode`, `DlStarted`'s contradiction checks, `Setup`'s
//! already-cached shortcut, and `WaitForFinish`'s timeout+callback loop. The
//! source's `fileitem` / `fileitem_with_storage` / `tPassThroughFitem` /
//! `tGeneratedFitemBase` inheritance chain is replaced by one shared state
//! struct plus a `FileItemKind` sum type (spec.md §9 design notes), in the
//! teacher's `CacheBody`-enum style rather than trait objects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::cache::store::{CacheStore, HeadMeta};
use crate::http::{HttpDate, RemoteStatus};

/// State machine driving a file-item (spec.md §3.2). Declaration order is
/// significant: comparisons like `status < FIST_COMPLETE` in the original
/// source rely on this exact ordinal ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FiStatus {
    Fresh,
    Inited,
    DlPending,
    DlGotHead,
    DlReceiving,
    Complete,
    DlError,
    DlStopped,
}

/// What to do with on-disk data at destruction (spec.md §3.2). Ordered by
/// severity, ascending: `Keep` is the gentlest, `Delete` the harshest.
/// Grounded on `fileitem.cc`'s `DlSetError`, which keeps the *smallest*
/// (gentlest) mode ever recorded — see SPEC_FULL.md §11 item 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DestroyMode {
    #[default]
    Keep,
    DeleteKeepHead,
    Truncate,
    Abandoned,
    Delete,
}

#[derive(Debug, Clone, Default)]
pub struct SpecialAttrs {
    pub volatile: bool,
    pub head_only: bool,
    pub no_store: bool,
    pub range_limit: i64,
    pub credentials: String,
}

/// The three ways a file-item can be realized (spec.md §9 "sum type of
/// file-item variants"). `PassThrough` never touches disk; `Storage` is the
/// common cached case; `Generated` covers synthetic/local responses (error
/// pages, directory listings) that never see a downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileItemKind {
    Storage,
    PassThrough,
    Generated,
    Local,
}

/// Everything that changes while the item lives. Guarded by a single mutex;
/// `Notify` replaces the source's condition variable (`wait_for_finish`).
#[derive(Debug)]
struct Inner {
    status: FiStatus,
    destroy_mode: DestroyMode,

    size_cached_initial: i64,
    size_checked: i64,
    content_length: i64,

    response_status: RemoteStatus,
    response_mod_date: HttpDate,
    response_origin: Option<String>,

    content_type: Option<String>,
    raw_response_header: Option<Vec<u8>>,

    dl_ref_count: u32,
    user_count: u32,

    time_dl_started: Option<Instant>,
    incoming_byte_count: u64,

    body_file: Option<std::fs::File>,
    /// In-memory body for pass-through/generated items that never hit disk.
    pass_through_buf: Vec<u8>,
    preallocated: bool,
}

pub struct FileItem {
    pub path_rel: String,
    pub kind: FileItemKind,
    pub special_attrs: SpecialAttrs,
    store: Arc<CacheStore>,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl FileItem {
    pub fn new(
        path_rel: String,
        kind: FileItemKind,
        special_attrs: SpecialAttrs,
        store: Arc<CacheStore>,
    ) -> Self {
        Self {
            path_rel,
            kind,
            special_attrs,
            store,
            inner: Mutex::new(Inner {
                status: FiStatus::Fresh,
                destroy_mode: DestroyMode::Keep,
                size_cached_initial: -1,
                size_checked: -1,
                content_length: -1,
                response_status: RemoteStatus { code: 0, message: String::new() },
                response_mod_date: HttpDate::unset(),
                response_origin: None,
                content_type: None,
                raw_response_header: None,
                dl_ref_count: 0,
                user_count: 0,
                time_dl_started: None,
                incoming_byte_count: 0,
                body_file: None,
                pass_through_buf: Vec::new(),
                preallocated: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn status(&self) -> FiStatus {
        self.inner.lock().status
    }

    pub fn destroy_mode(&self) -> DestroyMode {
        self.inner.lock().destroy_mode
    }

    pub fn response_status(&self) -> RemoteStatus {
        self.inner.lock().response_status.clone()
    }

    /// Called once by the Client Job after acquiring the item from the
    /// Registry. Mirrors `fileitem_with_storage::Setup()`: reads what's on
    /// disk, decides whether the cached copy can be trusted as-is.
    ///
    /// For `PassThrough`/`Generated`/`Local` kinds there is no disk state to
    /// read; they go straight to `Inited` and rely on the downloader (or a
    /// local producer) to drive the rest of the machine.
    pub fn setup(&self) -> FiStatus {
        let mut g = self.inner.lock();
        if g.status != FiStatus::Fresh {
            return g.status;
        }

        if self.kind != FileItemKind::Storage {
            g.status = FiStatus::Inited;
            return g.status;
        }

        let on_disk_len = self.store.body_len(&self.path_rel).map(|l| l as i64);
        let head = self.store.read_head_meta(&self.path_rel).ok();

        let Some(head) = head else {
            // No usable head file: reset and treat as freshly initialized.
            g.size_cached_initial = -1;
            g.size_checked = -1;
            g.content_length = -1;
            g.status = FiStatus::Inited;
            return g.status;
        };

        let cached_initial = on_disk_len.unwrap_or(-1);
        g.size_cached_initial = cached_initial;
        g.response_status = RemoteStatus { code: 200, message: "OK".into() };
        g.response_mod_date = head.last_modified;
        g.response_origin = head.origin.clone();
        g.content_length = head.content_length;

        if !self.special_attrs.volatile {
            if self.special_attrs.head_only {
                g.status = FiStatus::DlGotHead;
                return g.status;
            }
            if head.content_length >= 0 {
                if cached_initial >= 0 && head.content_length < cached_initial {
                    // On-disk body is longer than the head claims: inconsistent,
                    // reset and re-fetch from scratch.
                    g.size_cached_initial = -1;
                    g.size_checked = -1;
                    g.content_length = -1;
                    g.status = FiStatus::Inited;
                    return g.status;
                }
                if cached_initial == head.content_length {
                    // Already fully cached and non-volatile: skip the downloader
                    // entirely (spec.md §4.2 "setup()" contract).
                    g.size_checked = cached_initial;
                    g.status = FiStatus::Complete;
                    return g.status;
                }
            }
        }

        // Either volatile, or content-length unknown, or partially cached:
        // needs remote confirmation before being trusted. Whatever is
        // already on disk is still valid as a resume point, so record it
        // rather than leaving size_checked at "nothing cached" (spec.md
        // §8.3 scenarios #2/#3 depend on this to build a Range request).
        g.size_checked = cached_initial.max(0);
        g.status = FiStatus::Inited;
        g.status
    }

    /// Called by the downloader when a response head has arrived (spec.md
    /// §4.2). Returns `false` when the new head contradicts a previously
    /// established one, mirroring `fileitem::DlStarted`'s exact checks.
    #[allow(clippy::too_many_arguments)]
    pub fn dl_started(
        &self,
        raw_header: Option<Vec<u8>>,
        mod_date: HttpDate,
        origin: Option<String>,
        status: RemoteStatus,
        seek_pos: i64,
        announced_len: i64,
    ) -> bool {
        let mut g = self.inner.lock();

        if g.status >= FiStatus::DlGotHead {
            if (g.content_length != announced_len && g.content_length != -1)
                || mod_date != g.response_mod_date
                || seek_pos > g.size_checked
            {
                return false;
            }
        } else {
            g.content_length = -1;
        }

        g.status = FiStatus::DlGotHead;

        if seek_pos >= 0 {
            if g.size_checked >= 0 && seek_pos < g.size_checked {
                return false;
            }
            g.size_checked = seek_pos;
        }

        g.response_status = status;
        g.response_origin = origin;
        g.response_mod_date = mod_date;
        g.content_length = announced_len;
        if raw_header.is_some() {
            g.raw_response_header = raw_header;
        }

        drop(g);
        self.notify.notify_waiters();
        true
    }

    /// Appends body bytes (spec.md §4.2). Returns `false` to abort the
    /// download, mirroring `fileitem_with_storage::DlAddData`'s guard
    /// against writing while the item isn't past `DlGotHead` or is already
    /// terminal.
    pub fn dl_add_data(&self, chunk: &[u8]) -> bool {
        let mut g = self.inner.lock();
        self.notify.notify_waiters();

        g.incoming_byte_count += chunk.len() as u64;

        if g.status < FiStatus::DlGotHead {
            warn!(path = %self.path_rel, "dl_add_data called before DlGotHead");
            return false;
        }
        if g.status > FiStatus::Complete {
            return false;
        }

        match self.kind {
            FileItemKind::Storage => {
                if g.body_file.is_none() {
                    match self.store.open_body_rw(&self.path_rel) {
                        Ok(f) => {
                            let preallocated =
                                self.store.maybe_preallocate(&f, g.size_checked, g.content_length);
                            g.preallocated = preallocated;
                            g.body_file = Some(f);
                        }
                        Err(e) => {
                            warn!(path = %self.path_rel, error = %e, "cannot open cache body");
                            return false;
                        }
                    }
                }
                let pos = g.size_checked.max(0) as u64;
                let file = g.body_file.as_mut().expect("opened above");
                if let Err(e) = crate::cache::store::write_at(file, pos, chunk) {
                    warn!(path = %self.path_rel, error = %e, "write error");
                    return false;
                }
                g.status = FiStatus::DlReceiving;
            }
            FileItemKind::PassThrough | FileItemKind::Generated | FileItemKind::Local => {
                g.pass_through_buf.extend_from_slice(chunk);
                g.status = FiStatus::DlReceiving;
            }
        }

        g.size_checked += chunk.len() as i64;
        true
    }

    /// Transitions to `Complete` (spec.md §4.2). If `content_length` was
    /// unknown (chunked transfer), it's fixed to the final `size_checked`
    /// and the head file is rewritten unconditionally; otherwise the head is
    /// only rewritten when `force_header_update` is set.
    pub fn dl_finish(&self, force_header_update: bool) {
        let mut g = self.inner.lock();
        let had_unknown_length = g.content_length < 0;
        if had_unknown_length {
            g.content_length = g.size_checked;
        }
        g.status = FiStatus::Complete;

        if self.kind == FileItemKind::Storage && (had_unknown_length || force_header_update) {
            let meta = HeadMeta {
                content_length: g.content_length,
                last_modified: g.response_mod_date,
                origin: g.response_origin.clone(),
                ..Default::default()
            };
            let status_line = format!(
                "HTTP/1.1 {} {}",
                g.response_status.code, g.response_status.message
            );
            if let Err(e) = self.store.write_head_meta(&self.path_rel, &status_line, &meta) {
                warn!(path = %self.path_rel, error = %e, "failed to persist head on finish");
            }
        }

        drop(g);
        self.notify.notify_waiters();
    }

    /// Transitions to `DlError` (spec.md §4.2). Records the *least* severe
    /// `destroy_mode` ever seen — see SPEC_FULL.md §11 item 4.
    pub fn dl_set_error(&self, status: RemoteStatus, destroy_mode: DestroyMode) {
        let mut g = self.inner.lock();
        debug!(path = %self.path_rel, code = status.code, msg = %status.message, "fileitem entering DlError");
        g.response_status = status;
        g.status = FiStatus::DlError;
        if destroy_mode < g.destroy_mode {
            g.destroy_mode = destroy_mode;
        }
        drop(g);
        self.notify.notify_waiters();
    }

    /// Consumer-side blocking waiter (spec.md §4.2). Keeps waiting while
    /// `status < Complete` (note: `DlError`/`DlStopped` are both numerically
    /// greater than `Complete` and thus also terminate the wait) and, on
    /// each timeout tick, consults `keep_waiting` exactly like the source's
    /// `waitInterrupted` callback — returning `false` aborts with a
    /// synthetic 500.
    pub async fn wait_for_finish(
        &self,
        timeout: Option<Duration>,
        mut keep_waiting: impl FnMut() -> bool,
    ) -> (FiStatus, RemoteStatus) {
        loop {
            {
                let g = self.inner.lock();
                if g.status >= FiStatus::Complete {
                    return (g.status, g.response_status.clone());
                }
            }

            let notified = self.notify.notified();
            match timeout {
                None => notified.await,
                Some(d) => {
                    if tokio::time::timeout(d, notified).await.is_err() && !keep_waiting() {
                        return (
                            FiStatus::DlError,
                            RemoteStatus { code: 500, message: "E_TIMEOUT".into() },
                        );
                    }
                }
            }
        }
    }

    /// Zero-copy-ish transfer from the on-disk body (or in-memory buffer for
    /// pass-through/generated items) into `out`, starting at `*send_pos`.
    /// Returns bytes sent, or an error. This is the Rust analogue of
    /// `fileitem_with_storage::SendData`'s `sendfile`/`sendfile_generic`
    /// dispatch; actual socket writing happens in the Client Job, which owns
    /// the destination, so this returns the slice to write rather than
    /// performing the syscall itself.
    pub fn read_body_chunk(&self, send_pos: &mut u64, max: usize) -> crate::errors::Result<Vec<u8>> {
        let g = self.inner.lock();
        match self.kind {
            FileItemKind::Storage => {
                use std::io::{Read, Seek, SeekFrom};
                let mut f = self.store.open_body_ro(&self.path_rel)?;
                f.seek(SeekFrom::Start(*send_pos))?;
                let mut buf = vec![0u8; max];
                let n = f.read(&mut buf)?;
                buf.truncate(n);
                *send_pos += n as u64;
                Ok(buf)
            }
            FileItemKind::PassThrough | FileItemKind::Generated | FileItemKind::Local => {
                let start = (*send_pos as usize).min(g.pass_through_buf.len());
                let end = (start + max).min(g.pass_through_buf.len());
                let chunk = g.pass_through_buf[start..end].to_vec();
                *send_pos += chunk.len() as u64;
                Ok(chunk)
            }
        }
    }

    pub fn dl_ref_add(&self) {
        self.inner.lock().dl_ref_count += 1;
    }

    /// Mirrors `fileitem::DlRefCountDec`: if this is the last downloader
    /// leaving and the item never reached `Complete`, it's forced into
    /// `DlError` so waiting consumers don't hang forever.
    pub fn dl_ref_dec(&self, reason: RemoteStatus) {
        let should_error = {
            let mut g = self.inner.lock();
            g.dl_ref_count = g.dl_ref_count.saturating_sub(1);
            g.dl_ref_count == 0 && g.status < FiStatus::Complete
        };
        if should_error {
            let mode = self.inner.lock().destroy_mode;
            self.dl_set_error(reason, mode);
        }
    }

    pub fn user_count_add(&self) {
        self.inner.lock().user_count += 1;
    }

    pub fn user_count_dec(&self) -> u32 {
        let mut g = self.inner.lock();
        g.user_count = g.user_count.saturating_sub(1);
        g.user_count
    }

    /// Sets `destroy_mode` directly, bypassing the severity-merge used by
    /// `dl_set_error`. Used by the Registry's sharing-displacement path,
    /// where an item is explicitly abandoned rather than erroring out.
    pub fn mark_destroy_mode(&self, mode: DestroyMode) {
        self.inner.lock().destroy_mode = mode;
    }

    pub fn content_length(&self) -> i64 {
        self.inner.lock().content_length
    }

    pub fn size_checked(&self) -> i64 {
        self.inner.lock().size_checked
    }

    pub fn response_mod_date(&self) -> HttpDate {
        self.inner.lock().response_mod_date
    }

    pub fn mark_dl_started_now(&self) {
        self.inner.lock().time_dl_started = Some(Instant::now());
    }

    pub fn time_dl_started(&self) -> Option<Instant> {
        self.inner.lock().time_dl_started
    }

    pub fn take_incoming_byte_count(&self) -> u64 {
        let mut g = self.inner.lock();
        std::mem::take(&mut g.incoming_byte_count)
    }
}

/// Applies `destroy_mode` to on-disk state when the last reference goes,
/// mirroring `fileitem_with_storage::~fileitem_with_storage()`.
impl Drop for FileItem {
    fn drop(&mut self) {
        if self.special_attrs.no_store || self.kind != FileItemKind::Storage {
            return;
        }
        let g = self.inner.lock();
        match g.destroy_mode {
            DestroyMode::Keep => {
                if g.preallocated {
                    if let Ok(len) = u64::try_from(g.size_checked.max(0)) {
                        let _ = self.store.truncate_body(&self.path_rel, len);
                    }
                }
            }
            DestroyMode::Truncate => {
                let _ = self
                    .store
                    .truncate_body(&self.path_rel, 0)
                    .or_else(|_| self.store.unlink_body(&self.path_rel));
                let meta = HeadMeta {
                    content_length: -1,
                    last_modified: HttpDate::unset(),
                    origin: g.response_origin.clone(),
                    ..Default::default()
                };
                let _ = self.store.write_head_meta(&self.path_rel, "HTTP/1.1 200 OK", &meta);
            }
            DestroyMode::Abandoned => {
                let _ = self.store.unlink_body(&self.path_rel);
            }
            DestroyMode::Delete => {
                let _ = self.store.unlink_body(&self.path_rel);
                let _ = self.store.unlink_head(&self.path_rel);
            }
            DestroyMode::DeleteKeepHead => {
                let _ = self.store.unlink_body(&self.path_rel);
                let meta = HeadMeta {
                    content_length: -1,
                    last_modified: HttpDate::unset(),
                    origin: g.response_origin.clone(),
                    ..Default::default()
                };
                let _ = self.store.write_head_meta(&self.path_rel, "HTTP/1.1 200 OK", &meta);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn item(kind: FileItemKind) -> (tempfile::TempDir, FileItem) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let fi = FileItem::new("pool/a.deb".into(), kind, SpecialAttrs::default(), store);
        (dir, fi)
    }

    #[test]
    fn setup_on_empty_cache_goes_to_inited() {
        let (_dir, fi) = item(FileItemKind::Storage);
        assert_eq!(fi.setup(), FiStatus::Inited);
    }

    #[test]
    fn setup_shortcuts_to_complete_when_fully_cached_and_solid() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        {
            use std::io::Write;
            let mut f = store.open_body_rw("pool/a.deb").unwrap();
            f.write_all(b"0123456789").unwrap();
        }
        store
            .write_head_meta(
                "pool/a.deb",
                "HTTP/1.1 200 OK",
                &HeadMeta {
                    content_length: 10,
                    last_modified: HttpDate::from_unix(1_700_000_000),
                    origin: None,
                    ..Default::default()
                },
            )
            .unwrap();
        let fi = FileItem::new("pool/a.deb".into(), FileItemKind::Storage, SpecialAttrs::default(), store);
        assert_eq!(fi.setup(), FiStatus::Complete);
        assert_eq!(fi.size_checked(), 10);
    }

    #[test]
    fn setup_stays_inited_when_volatile_even_if_fully_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        {
            use std::io::Write;
            let mut f = store.open_body_rw("debian/Release").unwrap();
            f.write_all(b"abc").unwrap();
        }
        store
            .write_head_meta(
                "debian/Release",
                "HTTP/1.1 200 OK",
                &HeadMeta { content_length: 3, last_modified: HttpDate::unset(), origin: None, ..Default::default() },
            )
            .unwrap();
        let attrs = SpecialAttrs { volatile: true, ..Default::default() };
        let fi = FileItem::new("debian/Release".into(), FileItemKind::Storage, attrs, store);
        assert_eq!(fi.setup(), FiStatus::Inited);
        assert_eq!(fi.size_checked(), 3, "what's already on disk must still be usable as a resume point");
    }

    #[test]
    fn setup_records_size_checked_for_partial_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        {
            use std::io::Write;
            let mut f = store.open_body_rw("pool/a.deb").unwrap();
            f.write_all(b"abcde").unwrap();
        }
        store
            .write_head_meta(
                "pool/a.deb",
                "HTTP/1.1 200 OK",
                &HeadMeta { content_length: 5000, last_modified: HttpDate::unset(), origin: None, ..Default::default() },
            )
            .unwrap();
        let fi = FileItem::new("pool/a.deb".into(), FileItemKind::Storage, SpecialAttrs::default(), store);
        assert_eq!(fi.setup(), FiStatus::Inited);
        assert_eq!(fi.size_checked(), 5, "a resumable download must report what's already on disk");
    }

    #[test]
    fn dl_started_accepts_first_head() {
        let (_dir, fi) = item(FileItemKind::Storage);
        fi.setup();
        let ok = fi.dl_started(
            None,
            HttpDate::from_unix(1),
            None,
            RemoteStatus { code: 200, message: "OK".into() },
            0,
            100,
        );
        assert!(ok);
        assert_eq!(fi.status(), FiStatus::DlGotHead);
        assert_eq!(fi.content_length(), 100);
    }

    #[test]
    fn dl_started_rejects_contradictory_second_head() {
        let (_dir, fi) = item(FileItemKind::Storage);
        fi.setup();
        assert!(fi.dl_started(
            None,
            HttpDate::from_unix(1),
            None,
            RemoteStatus { code: 200, message: "OK".into() },
            0,
            100,
        ));
        // Different content-length on a second head for the same item: reject.
        let ok = fi.dl_started(
            None,
            HttpDate::from_unix(1),
            None,
            RemoteStatus { code: 200, message: "OK".into() },
            0,
            200,
        );
        assert!(!ok);
    }

    #[test]
    fn dl_started_rejects_seek_regression_past_size_checked() {
        let (_dir, fi) = item(FileItemKind::Storage);
        fi.setup();
        assert!(fi.dl_started(
            None,
            HttpDate::from_unix(1),
            None,
            RemoteStatus { code: 200, message: "OK".into() },
            50,
            100,
        ));
        let ok = fi.dl_started(
            None,
            HttpDate::from_unix(1),
            None,
            RemoteStatus { code: 200, message: "OK".into() },
            10,
            100,
        );
        assert!(!ok);
    }

    #[test]
    fn dl_add_data_then_finish_persists_body_and_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let fi = FileItem::new("pool/a.deb".into(), FileItemKind::Storage, SpecialAttrs::default(), store.clone());
        fi.setup();
        fi.dl_started(None, HttpDate::unset(), None, RemoteStatus { code: 200, message: "OK".into() }, 0, 5);
        assert!(fi.dl_add_data(b"hello"));
        fi.dl_finish(true);
        assert_eq!(fi.status(), FiStatus::Complete);
        let meta = store.read_head_meta("pool/a.deb").unwrap();
        assert_eq!(meta.content_length, 5);
    }

    #[test]
    fn dl_set_error_keeps_least_severe_mode() {
        let (_dir, fi) = item(FileItemKind::Storage);
        fi.setup();
        fi.dl_set_error(RemoteStatus { code: 500, message: "e1".into() }, DestroyMode::Delete);
        assert_eq!(fi.destroy_mode(), DestroyMode::Delete);
        fi.dl_set_error(RemoteStatus { code: 500, message: "e2".into() }, DestroyMode::Keep);
        assert_eq!(fi.destroy_mode(), DestroyMode::Keep);
        // A subsequent more severe mode must not override the gentler one already recorded.
        fi.dl_set_error(RemoteStatus { code: 500, message: "e3".into() }, DestroyMode::Truncate);
        assert_eq!(fi.destroy_mode(), DestroyMode::Keep);
    }

    #[test]
    fn dl_ref_dec_to_zero_before_complete_forces_error() {
        let (_dir, fi) = item(FileItemKind::Storage);
        fi.setup();
        fi.dl_ref_add();
        fi.dl_ref_dec(RemoteStatus { code: 500, message: "aborted".into() });
        assert_eq!(fi.status(), FiStatus::DlError);
    }

    #[test]
    fn pass_through_item_buffers_in_memory_and_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let fi = FileItem::new("pt/key".into(), FileItemKind::PassThrough, SpecialAttrs::default(), store);
        fi.setup();
        fi.dl_started(None, HttpDate::unset(), None, RemoteStatus { code: 200, message: "OK".into() }, 0, 3);
        assert!(fi.dl_add_data(b"abc"));
        let mut pos = 0u64;
        let chunk = fi.read_body_chunk(&mut pos, 10).unwrap();
        assert_eq!(chunk, b"abc");
        assert!(!dir.path().join("pt/key").exists());
    }

    #[tokio::test]
    async fn wait_for_finish_returns_once_complete() {
        let (_dir, fi) = item(FileItemKind::Storage);
        let fi = Arc::new(fi);
        fi.setup();
        fi.dl_started(None, HttpDate::unset(), None, RemoteStatus { code: 200, message: "OK".into() }, 0, 0);
        let waiter = {
            let fi = fi.clone();
            tokio::spawn(async move { fi.wait_for_finish(None, || true).await })
        };
        tokio::task::yield_now().await;
        fi.dl_finish(true);
        let (status, resp) = waiter.await.unwrap();
        assert_eq!(status, FiStatus::Complete);
        assert_eq!(resp.code, 200);
    }

    #[tokio::test]
    async fn wait_for_finish_times_out_when_keep_waiting_returns_false() {
        let (_dir, fi) = item(FileItemKind::Storage);
        fi.setup();
        let (status, resp) = fi
            .wait_for_finish(Some(Duration::from_millis(10)), || false)
            .await;
        assert_eq!(status, FiStatus::DlError);
        assert_eq!(resp.message, "E_TIMEOUT");

        let _path = PathBuf::from("pool/a.deb");
    }
}

//! Cache Store (spec.md §4.1): on-disk layout, atomic body replacement,
//! advisory pre-allocation, and Release-file side-storage snapshots.
//!
//! Grounded on `original_source/src/fileitem.cc`'s `SafeOpenOutFile` /
//! `MoveRelease2Sidestore` and `src/fileio.h`'s `falloc_helper`.

use crate::errors::Result;
use crate::http::HttpDate;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct HeadMeta {
    pub content_length: i64, // -1 == unknown
    pub last_modified: HttpDate,
    pub origin: Option<String>,
    /// Unix timestamp of the last time this entry was served to a client
    /// (`trackfileuse`, SPEC_FULL.md §10). `0` means never recorded.
    pub last_access: i64,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    dirperms: u32,
    fileperms: u32,
    stupidfs: bool,
    allocspace: u64,
}

impl CacheStore {
    pub fn new(root: PathBuf, dirperms: u32, fileperms: u32, stupidfs: bool) -> Self {
        Self::with_allocspace(root, dirperms, fileperms, stupidfs, 0)
    }

    pub fn with_allocspace(
        root: PathBuf,
        dirperms: u32,
        fileperms: u32,
        stupidfs: bool,
        allocspace: u64,
    ) -> Self {
        Self {
            root,
            dirperms,
            fileperms,
            stupidfs,
            allocspace,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserves disk space ahead of a fresh write, up to the configured
    /// `allocspace` ceiling, mirroring `SafeOpenOutFile`'s call to
    /// `falloc_helper` for the remaining expected sequence length. Returns
    /// whether anything was actually reserved.
    pub fn maybe_preallocate(
        &self,
        file: &std::fs::File,
        size_checked: i64,
        content_length: i64,
    ) -> bool {
        if self.allocspace == 0 || content_length <= 0 {
            return false;
        }
        let remaining = content_length - size_checked.max(0);
        if remaining <= 0 {
            return false;
        }
        let len = (remaining as u64).min(self.allocspace);
        self.pre_allocate(file, size_checked.max(0) as u64, len);
        true
    }

    pub fn body_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn head_path(&self, key: &str) -> PathBuf {
        let mut s = self.body_path(key).into_os_string();
        s.push(".head");
        PathBuf::from(s)
    }

    fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    parent,
                    std::fs::Permissions::from_mode(self.dirperms),
                );
            }
        }
        Ok(())
    }

    /// Reads `<cachedir>/K.head` and extracts content-length, last-modified
    /// and origin. Tolerates missing optional lines (spec.md §6.3).
    pub fn read_head_meta(&self, key: &str) -> Result<HeadMeta> {
        let path = self.head_path(key);
        let text = std::fs::read_to_string(&path)?;
        let mut meta = HeadMeta {
            content_length: -1,
            last_modified: HttpDate::unset(),
            origin: None,
            last_access: 0,
        };
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("Content-Length:") {
                meta.content_length = v.trim().parse().unwrap_or(-1);
            } else if let Some(v) = line.strip_prefix("Last-Modified:") {
                if let Some(d) = HttpDate::parse(v.trim()) {
                    meta.last_modified = d;
                }
            } else if let Some(v) = line.strip_prefix("X-Original-Source:") {
                meta.origin = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("X-Last-Access:") {
                meta.last_access = v.trim().parse().unwrap_or(0);
            }
        }
        Ok(meta)
    }

    /// Writes `K.head`, `O_CREAT|O_TRUNC` semantics (spec.md §4.1).
    pub fn write_head_meta(&self, key: &str, status_line: &str, meta: &HeadMeta) -> Result<()> {
        let path = self.head_path(key);
        self.ensure_parent_dir(&path)?;
        let mut out = format!("{status_line}\r\n");
        if meta.content_length >= 0 {
            out.push_str(&format!("Content-Length: {}\r\n", meta.content_length));
        }
        if let Some(f) = meta.last_modified.format() {
            out.push_str(&format!("Last-Modified: {f}\r\n"));
        }
        if let Some(origin) = &meta.origin {
            out.push_str(&format!("X-Original-Source: {origin}\r\n"));
        }
        if meta.last_access > 0 {
            out.push_str(&format!("X-Last-Access: {}\r\n", meta.last_access));
        }
        out.push_str("\r\n");

        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.fileperms)
            .open(&path)?;
        f.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Stamps `K.head` with the current time as the last-access moment
    /// (`trackfileuse`, SPEC_FULL.md §10: "the write path belongs to the
    /// Cache Store"). A no-op when there is no existing head file yet.
    pub fn record_access(&self, key: &str) -> Result<()> {
        let path = self.head_path(key);
        let Ok(text) = std::fs::read_to_string(&path) else { return Ok(()) };
        let status_line = text.lines().next().unwrap_or("HTTP/1.1 200 OK").to_string();
        let mut meta = self.read_head_meta(key)?;
        meta.last_access = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.write_head_meta(key, &status_line, &meta)
    }

    pub fn open_body_rw(&self, key: &str) -> Result<std::fs::File> {
        let path = self.body_path(key);
        self.ensure_parent_dir(&path)?;
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(self.fileperms)
            .open(path)?;
        Ok(f)
    }

    pub fn open_body_ro(&self, key: &str) -> Result<std::fs::File> {
        Ok(std::fs::File::open(self.body_path(key))?)
    }

    pub fn body_len(&self, key: &str) -> Option<u64> {
        std::fs::metadata(self.body_path(key)).ok().map(|m| m.len())
    }

    /// Crash-safe replace: open a temp file alongside, fdatasync, link the
    /// old name aside, rename the new one in, unlink the old side name.
    /// Readers holding descriptors to the old inode keep seeing valid old
    /// bytes (spec.md §4.1, §5 "Shared-resource policy").
    pub fn replace_body(&self, key: &str) -> Result<std::fs::File> {
        self.snapshot_release_if_needed(key)?;

        let body_path = self.body_path(key);
        self.ensure_parent_dir(&body_path)?;
        let dir = body_path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_name = dir.join(format!(
            ".{}.tmp{}",
            body_path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id()
        ));

        let new_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.fileperms)
            .open(&tmp_name)?;
        new_file.sync_data().ok();

        let side_name = dir.join(format!(
            ".{}.old{}",
            body_path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id()
        ));

        let had_old = std::fs::rename(&body_path, &side_name).is_ok();
        std::fs::rename(&tmp_name, &body_path)?;
        if had_old {
            let _ = std::fs::remove_file(&side_name);
        }

        Ok(new_file)
    }

    /// Advisory pre-allocation; failure is non-fatal (spec.md §4.1).
    pub fn pre_allocate(&self, file: &std::fs::File, offset: u64, len: u64) {
        if self.stupidfs {
            // Degraded path for filesystems without reliable fallocate
            // (SPEC_FULL.md §10 "stupidfs mode"): reserve space via ftruncate.
            if let Err(e) = file.set_len(offset + len) {
                debug!("stupidfs pre-allocate via set_len failed: {e}");
            }
            return;
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe {
                libc::posix_fallocate(
                    file.as_raw_fd(),
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            };
            if rc != 0 {
                debug!("posix_fallocate failed with errno {rc}, ignoring (advisory)");
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (file, offset, len);
        }
    }

    /// Truncates the body to `len`, used by `destroy_mode == TRUNCATE`.
    pub fn truncate_body(&self, key: &str, len: u64) -> Result<()> {
        let f = std::fs::OpenOptions::new().write(true).open(self.body_path(key))?;
        f.set_len(len)?;
        Ok(())
    }

    pub fn unlink_body(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.body_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn unlink_head(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.head_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Links the existing files for `key` aside to `<path>.<timestamp>`, used
    /// when an incompatible new requester must displace a "stuck" item
    /// (spec.md §4.2 sharing policy).
    pub fn move_aside(&self, key: &str, timestamp_suffix: u64) -> Result<()> {
        let body = self.body_path(key);
        let head = self.head_path(key);
        if body.exists() {
            let dest = self.root.join(format!("{key}.{timestamp_suffix}"));
            self.ensure_parent_dir(&dest)?;
            let _ = std::fs::rename(&body, &dest);
        }
        if head.exists() {
            let dest = self.root.join(format!("{key}.head.{timestamp_suffix}"));
            let _ = std::fs::rename(&head, &dest);
        }
        Ok(())
    }

    /// Before truncating a Release/InRelease file, snapshot its prior
    /// contents under `_xstore/rsnap/` (spec.md §4.1, §6.3).
    fn snapshot_release_if_needed(&self, key: &str) -> Result<()> {
        if !(key.ends_with("/Release") || key.ends_with("/InRelease")) {
            return Ok(());
        }
        let body_path = self.body_path(key);
        let Ok(meta) = std::fs::metadata(&body_path) else {
            return Ok(());
        };
        if meta.len() == 0 {
            return Ok(());
        }

        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt;
            meta.ino()
        };
        #[cfg(not(unix))]
        let inode = 0u64;

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .unwrap_or_default();

        let dir_component = Path::new(key).parent().unwrap_or_else(|| Path::new(""));
        let snap_dir = self.root.join("_xstore/rsnap").join(dir_component);
        std::fs::create_dir_all(&snap_dir)?;
        let snap_path =
            snap_dir.join(format!("{inode}{}{}", mtime.as_secs(), mtime.subsec_nanos()));

        match std::fs::copy(&body_path, &snap_path) {
            Ok(_) => debug!("snapshotted release file {key} to {}", snap_path.display()),
            Err(e) => warn!("failed to snapshot release file {key}: {e}"),
        }
        Ok(())
    }
}

/// Seeks to `pos` and writes `data`, used by the downloader when resuming.
pub fn write_at(file: &mut std::fs::File, pos: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(data)?;
    Ok(())
}

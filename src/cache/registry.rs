//! Item Registry (spec.md §3.6, §4.2 "Volatility and sharing").
//!
//! Grounded on `original_source/src/acregistry.cc`'s `TFileItemRegistry`:
//! canonical-path → file-item map, `Create`'s sharing/displacement
//! decision, and `TFileItemHolder::~TFileItemHolder`'s prolonged-queue
//! parking. Lock order is registry-before-item (spec.md §5): the dashmap
//! shard lock for a key is held only long enough to look up or insert the
//! `Arc<FileItem>`, never across a call into the item itself.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::fileitem::{DestroyMode, FileItem, FileItemKind, FiStatus, SpecialAttrs};
use crate::cache::holder::FileItemHolder;
use crate::cache::store::CacheStore;
use crate::config::AcngConfig;

/// Mirrors `ESharingHow` (spec.md §4.2 sharing policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingHow {
    AlwaysShare,
    AutoMoveOutOfTheWay,
    ForceMoveOutOfTheWay,
}

struct ProlongedEntry {
    key: String,
    item: Arc<FileItem>,
    expires_at: Instant,
}

pub struct Registry {
    store: Arc<CacheStore>,
    config: Arc<AcngConfig>,
    items: DashMap<String, Arc<FileItem>>,
    prolonged: Mutex<VecDeque<ProlongedEntry>>,
    self_ref: std::sync::OnceLock<Weak<Registry>>,
}

impl Registry {
    pub fn new(store: Arc<CacheStore>, config: Arc<AcngConfig>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let this = Self {
                store,
                config,
                items: DashMap::new(),
                prolonged: Mutex::new(VecDeque::new()),
                self_ref: std::sync::OnceLock::new(),
            };
            let _ = this.self_ref.set(weak.clone());
            this
        })
    }

    fn weak_self(&self) -> Weak<Registry> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Creates a new item for `key`, or shares/displaces an existing one,
    /// per spec.md §4.2. Mirrors `TFileItemRegistry::Create`.
    pub fn create(
        &self,
        key: &str,
        how: SharingHow,
        spattr: SpecialAttrs,
        kind: FileItemKind,
    ) -> FileItemHolder {
        loop {
            if let Some(existing) = self.items.get(key).map(|e| e.clone()) {
                if how == SharingHow::AlwaysShare {
                    return self.holder_for(key, existing);
                }

                let stuck = existing
                    .time_dl_started()
                    .map(|t| t.elapsed() > self.config.stucksecs)
                    .unwrap_or(false);

                let make_way = how == SharingHow::ForceMoveOutOfTheWay
                    || stuck
                    || (!existing.special_attrs.volatile && spattr.volatile)
                    || (existing.special_attrs.head_only != spattr.head_only
                        && existing.special_attrs.head_only)
                    || (existing.special_attrs.range_limit != spattr.range_limit);

                if !make_way {
                    return self.holder_for(key, existing);
                }

                // Displace: move the old item's cache files aside and abandon
                // it, then fall through the loop to register the new one.
                let now = Instant::now();
                let suffix = now.elapsed().as_nanos() as u64 ^ (key.len() as u64);
                if let Err(e) = self.store.move_aside(key, suffix) {
                    debug!(key, error = %e, "failed to move aside displaced item, sharing instead");
                    return self.holder_for(key, existing);
                }
                existing.mark_destroy_mode(DestroyMode::Abandoned);
                self.items.remove_if(key, |_, v| Arc::ptr_eq(v, &existing));
                continue;
            }

            let item = Arc::new(FileItem::new(
                key.to_string(),
                kind,
                spattr.clone(),
                self.store.clone(),
            ));
            if self.items.insert(key.to_string(), item.clone()).is_some() {
                // Lost a race with a concurrent creator; retry the shared path.
                continue;
            }
            return self.holder_for(key, item);
        }
    }

    fn holder_for(&self, key: &str, item: Arc<FileItem>) -> FileItemHolder {
        FileItemHolder::new(item, key.to_string(), self.weak_self())
    }

    /// Called by `FileItemHolder::drop` when the last reference to an item
    /// goes away. Either parks the item in the prolonged queue (volatile,
    /// complete, within `maxtempdelay`) or unregisters it outright, mirroring
    /// `TFileItemHolder::~TFileItemHolder`.
    pub(crate) fn on_last_holder_dropped(&self, key: &str, item: Arc<FileItem>) {
        let now = Instant::now();
        if item.status() == FiStatus::Complete
            && item.special_attrs.volatile
            && !self.config.maxtempdelay.is_zero()
        {
            let started = item.time_dl_started().unwrap_or(now);
            let expires_at = started + self.config.maxtempdelay;
            if expires_at > now {
                self.prolonged.lock().push_back(ProlongedEntry {
                    key: key.to_string(),
                    item,
                    expires_at,
                });
                return;
            }
        }
        self.items.remove_if(key, |_, v| Arc::ptr_eq(v, &item));
    }

    /// Sweeps the prolonged queue, unregistering entries whose deadline has
    /// passed. Returns the number of entries still pending, for the caller
    /// (spec.md's periodic maintenance loop) to decide when to reschedule,
    /// mirroring `TFileItemRegistry::BackgroundCleanup`'s `time_t` return.
    pub fn background_cleanup(&self) -> usize {
        let now = Instant::now();
        let mut q = self.prolonged.lock();
        while let Some(front) = q.front() {
            if front.expires_at > now {
                break;
            }
            let entry = q.pop_front().unwrap();
            self.items.remove_if(&entry.key, |_, v| Arc::ptr_eq(v, &entry.item));
        }
        q.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcngConfig;

    fn registry() -> (tempfile::TempDir, Arc<Registry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let cfg = Arc::new(AcngConfig::for_tests(dir.path().to_path_buf()));
        (dir, Registry::new(store, cfg))
    }

    #[test]
    fn concurrent_create_for_same_key_shares_one_item() {
        let (_dir, reg) = registry();
        let h1 = reg.create("k", SharingHow::AlwaysShare, SpecialAttrs::default(), FileItemKind::Storage);
        let h2 = reg.create("k", SharingHow::AlwaysShare, SpecialAttrs::default(), FileItemKind::Storage);
        assert!(Arc::ptr_eq(h1.get(), h2.get()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_items() {
        let (_dir, reg) = registry();
        let h1 = reg.create("a", SharingHow::AlwaysShare, SpecialAttrs::default(), FileItemKind::Storage);
        let h2 = reg.create("b", SharingHow::AlwaysShare, SpecialAttrs::default(), FileItemKind::Storage);
        assert!(!Arc::ptr_eq(h1.get(), h2.get()));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn head_only_vs_full_request_displaces_the_head_only_item() {
        let (_dir, reg) = registry();
        let head_only = SpecialAttrs { head_only: true, ..Default::default() };
        let h1 = reg.create("k", SharingHow::AutoMoveOutOfTheWay, head_only, FileItemKind::Storage);
        let full = SpecialAttrs::default();
        let h2 = reg.create("k", SharingHow::AutoMoveOutOfTheWay, full, FileItemKind::Storage);
        assert!(!Arc::ptr_eq(h1.get(), h2.get()));
        assert_eq!(h1.get().destroy_mode(), DestroyMode::Abandoned);
    }

    #[test]
    fn background_cleanup_returns_queue_length() {
        let (_dir, reg) = registry();
        assert_eq!(reg.background_cleanup(), 0);
    }
}

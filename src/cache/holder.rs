//! RAII file-item holder (spec.md §3.6, §9 design notes).
//!
//! Grounded on `original_source/src/acregistry.h`'s `TFileItemHolder`: a
//! strong reference that, on drop, decrements `user_count` and — if it was
//! the last holder — hands the item back to the Registry for either
//! prolonged-queue parking (volatile, complete, within `maxtempdelay`) or
//! unregistration. The source's `m_globRef` map iterator and `weak_ptr`
//! back-reference are replaced by the item storing its own key and the
//! holder storing a `Weak<Registry>`, so drop order never depends on map
//! iterator stability (spec.md §9 "This removes the source's fragile
//! `m_globRef` iterator field").

use std::sync::{Arc, Weak};

use crate::cache::fileitem::FileItem;
use crate::cache::registry::Registry;

pub struct FileItemHolder {
    item: Option<Arc<FileItem>>,
    key: String,
    registry: Weak<Registry>,
}

impl FileItemHolder {
    pub(crate) fn new(item: Arc<FileItem>, key: String, registry: Weak<Registry>) -> Self {
        item.user_count_add();
        Self { item: Some(item), key, registry }
    }

    pub fn get(&self) -> &Arc<FileItem> {
        self.item.as_ref().expect("holder used after drop")
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FileItemHolder {
    fn drop(&mut self) {
        let Some(item) = self.item.take() else { return };
        let remaining = item.user_count_dec();
        if remaining > 0 {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.on_last_holder_dropped(&self.key, item);
        }
        // If the registry is already gone (shutdown), the Arc simply drops
        // here and FileItem's own Drop impl applies destroy_mode.
    }
}

impl std::fmt::Debug for FileItemHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileItemHolder").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fileitem::{FileItemKind, SpecialAttrs};
    use crate::cache::store::CacheStore;
    use crate::config::AcngConfig;

    #[test]
    fn dropping_last_holder_unregisters_from_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let cfg = Arc::new(AcngConfig::for_tests(dir.path().to_path_buf()));
        let registry = Registry::new(store, cfg);

        {
            let _h1 = registry.create(
                "pool/a.deb",
                crate::cache::registry::SharingHow::AlwaysShare,
                SpecialAttrs::default(),
                FileItemKind::Storage,
            );
            assert!(registry.contains("pool/a.deb"));
        }
        assert!(!registry.contains("pool/a.deb"));
    }

    #[test]
    fn sharing_keeps_item_registered_while_any_holder_alive() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
        let cfg = Arc::new(AcngConfig::for_tests(dir.path().to_path_buf()));
        let registry = Registry::new(store, cfg);

        let h1 = registry.create(
            "pool/a.deb",
            crate::cache::registry::SharingHow::AlwaysShare,
            SpecialAttrs::default(),
            FileItemKind::Storage,
        );
        let h2 = registry.create(
            "pool/a.deb",
            crate::cache::registry::SharingHow::AlwaysShare,
            SpecialAttrs::default(),
            FileItemKind::Storage,
        );
        assert!(Arc::ptr_eq(h1.get(), h2.get()));
        drop(h1);
        assert!(registry.contains("pool/a.deb"));
        drop(h2);
        assert!(!registry.contains("pool/a.deb"));
    }
}

//! spec.md §8.3 scenario 4 / §8.4: concurrent requests for the same,
//! not-yet-cached key must all be handed the same underlying file-item
//! rather than each triggering their own fetch.

mod common;

use std::sync::Arc;

use acng_core::cache::fileitem::{FileItemKind, SpecialAttrs};
use acng_core::cache::registry::{Registry, SharingHow};
use acng_core::cache::store::CacheStore;

#[tokio::test]
async fn fifty_concurrent_creates_share_one_file_item() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Arc::new(common::test_config(dir.path().to_path_buf()));
    let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
    let registry = Registry::new(store, cfg);

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry.create(
                "debian/dists/stable/Release",
                SharingHow::AutoMoveOutOfTheWay,
                SpecialAttrs { volatile: true, ..Default::default() },
                FileItemKind::Storage,
            )
        }));
    }

    let mut holders = Vec::new();
    for t in tasks {
        holders.push(t.await.unwrap());
    }

    let first = holders[0].get().clone();
    for holder in &holders[1..] {
        assert!(Arc::ptr_eq(&first, holder.get()), "every concurrent create must share the same file-item");
    }
    assert_eq!(registry.len(), 1, "one key must map to exactly one registered item");
}

#[tokio::test]
async fn distinct_keys_never_share() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Arc::new(common::test_config(dir.path().to_path_buf()));
    let store = Arc::new(CacheStore::new(dir.path().to_path_buf(), 0o755, 0o644, false));
    let registry = Registry::new(store, cfg);

    let a = registry.create("pool/a.deb", SharingHow::AutoMoveOutOfTheWay, SpecialAttrs::default(), FileItemKind::Storage);
    let b = registry.create("pool/b.deb", SharingHow::AutoMoveOutOfTheWay, SpecialAttrs::default(), FileItemKind::Storage);
    assert!(!Arc::ptr_eq(a.get(), b.get()));
}

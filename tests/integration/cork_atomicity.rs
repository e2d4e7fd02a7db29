#![allow(missing_docs)]

use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;
use volmeta::backend::embedded::EmbeddedBackend;
use volmeta::{
    CacheConfig, CachedMetadataStore, Clh, ClusterAddress, ClusterLocation, Hash, MetadataBackend,
    SyncMode,
};

fn open_store(path: &std::path::Path, page_capacity: usize) -> CachedMetadataStore {
    let backend = EmbeddedBackend::open(path, page_capacity, SyncMode::Full).unwrap();
    let config = CacheConfig {
        capacity: 16,
        ignore_flush_errors: false,
        page_capacity,
    };
    CachedMetadataStore::open(Arc::new(backend), config).unwrap()
}

/// Distilled spec §8 property 2: writes inside an un-uncorked cork are
/// visible same-process but invisible to a freshly opened store on the same
/// backend until uncork completes.
#[test]
fn corked_writes_are_invisible_to_a_fresh_store_until_uncorked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.log");
    let ca = ClusterAddress::new(10);
    let clh = Clh::new(ClusterLocation::new(5, 0, 0, 0), Hash::of_bytes(b"payload"));

    let store = open_store(&path, 4);
    let cork_uuid = Uuid::new_v4();
    store.cork(cork_uuid);
    store.write_cluster(ca, clh).unwrap();

    // Visible same-process before uncork.
    assert_eq!(store.read_cluster(ca).unwrap(), clh);

    // A second backend handle on the same file sees nothing yet: the write
    // has not been flushed past the cork boundary.
    let second_backend = EmbeddedBackend::open(&path, 4, SyncMode::Full).unwrap();
    assert!(second_backend.get_page(
        ca.page_address(4)
    ).unwrap().is_none());

    store.cork(Uuid::new_v4());
    store.uncork(Some(cork_uuid)).unwrap();

    let third_backend = EmbeddedBackend::open(&path, 4, SyncMode::Full).unwrap();
    let page = third_backend
        .get_page(ca.page_address(4))
        .unwrap()
        .expect("page durable after uncork");
    assert_eq!(page.get(ca.offset_in_page(4)), clh);
}

/// Distilled spec §8 property 3: once c1 < c2 are both uncorked, the
/// backend's durable cork_uuid equals c2 and is never observed at an
/// intermediate value different from c1 or c2.
#[test]
fn cork_ordering_is_monotone_across_uncorks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.log");
    let store = open_store(&path, 4);

    let c1 = Uuid::new_v4();
    let c2 = Uuid::new_v4();
    let c3 = Uuid::new_v4();

    store.cork(c1);
    store
        .write_cluster(ClusterAddress::new(0), Clh::new(ClusterLocation::new(1, 0, 0, 0), Hash::ZERO))
        .unwrap();
    store.cork(c2);
    store.uncork(Some(c1)).unwrap();
    assert_eq!(store.last_cork(), Some(c1));

    store
        .write_cluster(ClusterAddress::new(1), Clh::new(ClusterLocation::new(2, 0, 0, 0), Hash::ZERO))
        .unwrap();
    store.cork(c3);
    store.uncork(Some(c2)).unwrap();
    assert_eq!(store.last_cork(), Some(c2));

    // never jumped straight to c3 or stayed at a value other than c1/c2
    store.uncork(Some(c3)).unwrap();
    assert_eq!(store.last_cork(), Some(c3));
}

/// `cork()` is idempotent: calling it again with the already-active uuid is
/// a no-op, not a new cork.
#[test]
fn cork_is_idempotent_for_the_active_uuid() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("meta.log"), 4);
    let uuid = Uuid::new_v4();
    store.cork(uuid);
    store.cork(uuid);
    // Only one cork is open, so uncork must still fail (no next cork yet).
    assert!(store.uncork(Some(uuid)).is_err());
}

/// `uncork` refuses a uuid that doesn't match the oldest pending cork.
#[test]
fn uncork_rejects_uuid_mismatch() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("meta.log"), 4);
    store.cork(Uuid::new_v4());
    store.cork(Uuid::new_v4());
    assert!(store.uncork(Some(Uuid::new_v4())).is_err());
}

#![allow(missing_docs)]

use std::sync::Arc;
use uuid::Uuid;
use volmeta::backend::coordination::CoordinationBackend;
use volmeta::{BackendConfig, CacheConfig, CachedMetadataStore, Clh, ClusterAddress, ClusterLocation, Hash};

fn coordination_config() -> BackendConfig {
    BackendConfig::coordination_default(vec!["coord-a".into()], "vol-system".into(), "parent-ns".into())
}

fn open_store(backend: Arc<CoordinationBackend>) -> CachedMetadataStore {
    let config = CacheConfig {
        capacity: 32,
        ignore_flush_errors: false,
        page_capacity: 4,
    };
    CachedMetadataStore::open(backend, config).unwrap()
}

fn write_one(store: &CachedMetadataStore, ca: ClusterAddress, clh: Clh) {
    let uuid = Uuid::new_v4();
    store.cork(uuid);
    store.write_cluster(ca, clh).unwrap();
    store.cork(Uuid::new_v4());
    store.uncork(Some(uuid)).unwrap();
}

/// E5: clone C from parent P at a snapshot; writing the first cluster in C
/// and reading every other cluster back returns the parent's CLH stamped
/// with C's clone_id (distilled spec §8 property 8).
#[test]
fn clone_reads_through_to_parent_with_incremented_clone_id() {
    let parent_backend = Arc::new(CoordinationBackend::new(coordination_config(), 4));
    let parent_store = open_store(parent_backend.clone());

    let parent_clh_0 = Clh::new(ClusterLocation::new(10, 0, 0, 0), Hash::of_bytes(b"zero"));
    let parent_clh_1 = Clh::new(ClusterLocation::new(11, 0, 0, 1), Hash::of_bytes(b"one"));
    write_one(&parent_store, ClusterAddress::new(0), parent_clh_0);
    write_one(&parent_store, ClusterAddress::new(1), parent_clh_1);

    let clone_backend = Arc::new(
        CoordinationBackend::with_frozen_parent(coordination_config(), 4, parent_backend).unwrap(),
    );
    let clone_store = open_store(clone_backend);

    // Cluster 0 is written locally by the clone.
    let clone_own = Clh::new(ClusterLocation::new(99, 1, 0, 0), Hash::of_bytes(b"clone-owned"));
    write_one(&clone_store, ClusterAddress::new(0), clone_own);
    assert_eq!(clone_store.read_cluster(ClusterAddress::new(0)).unwrap(), clone_own);

    // Cluster 1 was never written locally: falls through to the parent,
    // stamped with clone_id incremented by one.
    let read_through = clone_store.read_cluster(ClusterAddress::new(1)).unwrap();
    assert_eq!(read_through.location.clone_id(), parent_clh_1.location.clone_id() + 1);
    assert_eq!(read_through.location.number(), parent_clh_1.location.number());
    assert_eq!(read_through.hash, parent_clh_1.hash);
}

/// E9 / distilled spec §8 property 9: once every parent page the clone
/// could ever read through has been written locally, the clone becomes
/// emancipated and further reads never touch the parent backend again.
#[test]
fn clone_emancipates_once_every_parent_page_is_locally_written() {
    let parent_backend = Arc::new(CoordinationBackend::new(coordination_config(), 4));
    let parent_store = open_store(parent_backend.clone());

    // Two distinct pages (page_capacity = 4): CA 0 in page 0, CA 5 in page 1.
    write_one(
        &parent_store,
        ClusterAddress::new(0),
        Clh::new(ClusterLocation::new(1, 0, 0, 0), Hash::ZERO),
    );
    write_one(
        &parent_store,
        ClusterAddress::new(5),
        Clh::new(ClusterLocation::new(2, 0, 0, 0), Hash::ZERO),
    );

    let clone_backend = Arc::new(
        CoordinationBackend::with_frozen_parent(coordination_config(), 4, parent_backend).unwrap(),
    );
    assert!(!clone_backend.is_emancipated());
    let clone_store = open_store(clone_backend.clone());

    write_one(
        &clone_store,
        ClusterAddress::new(0),
        Clh::new(ClusterLocation::new(9, 1, 0, 0), Hash::ZERO),
    );
    assert!(!clone_backend.is_emancipated(), "page 1 is still unwritten locally");

    write_one(
        &clone_store,
        ClusterAddress::new(5),
        Clh::new(ClusterLocation::new(10, 1, 0, 0), Hash::ZERO),
    );
    assert!(clone_backend.is_emancipated());
    assert!(!clone_backend.has_frozen_parent());
}

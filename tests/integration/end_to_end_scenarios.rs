#![allow(missing_docs)]

use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;
use volmeta::backend::embedded::EmbeddedBackend;
use volmeta::{CacheConfig, CachedMetadataStore, Clh, ClusterAddress, ClusterLocation, Hash, Stats, SyncMode};

fn open_store(path: &std::path::Path, cache_capacity: usize, page_capacity: usize) -> CachedMetadataStore {
    let backend = EmbeddedBackend::open(path, page_capacity, SyncMode::Full).unwrap();
    let config = CacheConfig {
        capacity: cache_capacity,
        ignore_flush_errors: false,
        page_capacity,
    };
    CachedMetadataStore::open(Arc::new(backend), config).unwrap()
}

fn write_one(store: &CachedMetadataStore, ca: ClusterAddress, clh: Clh) {
    let uuid = Uuid::new_v4();
    store.cork(uuid);
    store.write_cluster(ca, clh).unwrap();
    store.cork(Uuid::new_v4());
    store.uncork(Some(uuid)).unwrap();
}

/// E1: a ten-page volume is written across its full range, the backend is
/// replaced with a fresh handle on the same durable file (standing in for
/// "fail over from backend A to backend B", since both are the embedded
/// backend over the same storage in this crate's scope), and every written
/// cluster reads back while an address that was never touched reads as the
/// canonical discarded value.
#[test]
fn ten_page_volume_survives_backend_failover_and_reads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.log");
    let page_capacity = 8;
    let store = open_store(&path, 32, page_capacity);

    let mut expected = Vec::new();
    for page in 0..10u64 {
        for offset in 0..page_capacity as u64 {
            let ca = ClusterAddress::new(page * page_capacity as u64 + offset);
            let clh = Clh::new(
                ClusterLocation::new((page * page_capacity as u64 + offset) as u32 + 1, 0, 0, 0),
                Hash::of_bytes(&ca.0.to_be_bytes()),
            );
            write_one(&store, ca, clh);
            expected.push((ca, clh));
        }
    }
    store.sync().unwrap();
    drop(store);

    // "Failover": a fresh backend handle (and fresh cache) on the same
    // durable file stands in for routing to a different replica.
    let failed_over = open_store(&path, 32, page_capacity);
    for (ca, clh) in &expected {
        assert_eq!(failed_over.read_cluster(*ca).unwrap(), *clh);
    }

    let untouched = failed_over
        .read_cluster(ClusterAddress::new(10 * page_capacity as u64))
        .unwrap();
    assert!(untouched.is_null(), "reading past the written range must be the canonical discard");
}

/// E7: with cache capacity N pages, dirtying more than N distinct pages
/// forces evictions rather than growing the cache unbounded. Every evicted
/// page must have been durably flushed (not merely dropped), and the
/// resident page count never exceeds the configured capacity.
#[test]
fn cache_evicts_rather_than_growing_past_capacity() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.log");
    let page_capacity = 4;
    let cache_capacity = 3;
    let store = open_store(&path, cache_capacity, page_capacity);

    let total_dirty_pages = 10usize;
    let mut expected = Vec::new();
    for page in 0..total_dirty_pages as u64 {
        let ca = ClusterAddress::new(page * page_capacity as u64);
        let clh = Clh::new(ClusterLocation::new(page as u32 + 1, 0, 0, 0), Hash::of_bytes(&page.to_be_bytes()));
        write_one(&store, ca, clh);
        expected.push((ca, clh));

        let mut stats = Stats::default();
        store.get_stats(&mut stats);
        assert!(
            stats.num_pages as usize <= cache_capacity,
            "resident pages ({}) must never exceed cache capacity ({cache_capacity})",
            stats.num_pages
        );
    }

    // Every page, including the (total_dirty_pages - cache_capacity) pages
    // forced out of the cache along the way, must still be durable.
    for (ca, clh) in expected {
        assert_eq!(store.read_cluster(ca).unwrap(), clh);
    }
}

/// Distilled spec §8 property 4: the backend's reported used-cluster count
/// always equals the number of non-discarded entries actually persisted,
/// through an interleaved sequence of writes and discards.
#[test]
fn used_clusters_tracks_non_discarded_entries_through_writes_and_discards() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(EmbeddedBackend::open(dir.path().join("meta.log"), 4, SyncMode::Full).unwrap());
    let config = CacheConfig {
        capacity: 8,
        ignore_flush_errors: false,
        page_capacity: 4,
    };
    let store = CachedMetadataStore::open(backend.clone(), config).unwrap();

    write_one(&store, ClusterAddress::new(0), Clh::new(ClusterLocation::new(1, 0, 0, 0), Hash::ZERO));
    write_one(&store, ClusterAddress::new(1), Clh::new(ClusterLocation::new(2, 0, 0, 0), Hash::ZERO));
    write_one(&store, ClusterAddress::new(2), Clh::new(ClusterLocation::new(3, 0, 0, 0), Hash::ZERO));
    assert_eq!(backend.get_used_clusters().unwrap(), 3);

    let uuid = Uuid::new_v4();
    store.cork(uuid);
    store.discard_cluster(ClusterAddress::new(1)).unwrap();
    store.cork(Uuid::new_v4());
    store.uncork(Some(uuid)).unwrap();
    assert_eq!(backend.get_used_clusters().unwrap(), 2);

    write_one(&store, ClusterAddress::new(1), Clh::new(ClusterLocation::new(4, 0, 0, 0), Hash::ZERO));
    assert_eq!(backend.get_used_clusters().unwrap(), 3);
}

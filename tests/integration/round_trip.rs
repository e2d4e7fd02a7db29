#![allow(missing_docs)]

use proptest::prelude::*;
use tempfile::tempdir;
use uuid::Uuid;
use volmeta::{
    CacheConfig, CachedMetadataStore, Clh, ClusterAddress, ClusterLocation, Hash, SyncMode,
};
use volmeta::backend::embedded::EmbeddedBackend;

fn open_store(dir: &std::path::Path, page_capacity: usize) -> CachedMetadataStore {
    let backend = EmbeddedBackend::open(dir.join("meta.log"), page_capacity, SyncMode::Full)
        .expect("open embedded backend");
    let config = CacheConfig {
        capacity: 32,
        ignore_flush_errors: false,
        page_capacity,
    };
    CachedMetadataStore::open(std::sync::Arc::new(backend), config).expect("open store")
}

fn write_one(store: &CachedMetadataStore, ca: ClusterAddress, clh: Clh) {
    let uuid = Uuid::new_v4();
    store.cork(uuid);
    store.write_cluster(ca, clh).unwrap();
    store.cork(Uuid::new_v4());
    store.uncork(Some(uuid)).unwrap();
}

/// Distilled spec §8 property 1: for all CA in range, write then sync then
/// read returns exactly what was written.
#[test]
fn every_written_cluster_reads_back_after_sync() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path(), 4);

    let mut expected = Vec::new();
    for i in 0..40u64 {
        let ca = ClusterAddress::new(i);
        let clh = Clh::new(ClusterLocation::new(i as u32 + 1, 0, 0, (i % 7) as u16), Hash::of_bytes(&i.to_be_bytes()));
        write_one(&store, ca, clh);
        expected.push((ca, clh));
    }
    store.sync().unwrap();

    for (ca, clh) in expected {
        assert_eq!(store.read_cluster(ca).unwrap(), clh);
    }
}

proptest! {
    /// Same property, randomized over CA/location/content, to catch
    /// page-boundary arithmetic bugs a fixed range wouldn't exercise.
    #[test]
    fn round_trip_holds_for_arbitrary_addresses_and_locations(
        addrs in prop::collection::vec(0u64..4096, 1..64),
        numbers in prop::collection::vec(1u32..u32::MAX, 1..64),
    ) {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 16);

        let n = addrs.len().min(numbers.len());
        let mut expected = std::collections::BTreeMap::new();
        for i in 0..n {
            let ca = ClusterAddress::new(addrs[i]);
            let clh = Clh::new(ClusterLocation::new(numbers[i], 0, 0, 0), Hash::of_bytes(&numbers[i].to_be_bytes()));
            write_one(&store, ca, clh);
            expected.insert(ca, clh);
        }
        store.sync().unwrap();

        for (ca, clh) in expected {
            prop_assert_eq!(store.read_cluster(ca).unwrap(), clh);
        }
    }
}

#![allow(missing_docs)]

use std::sync::Arc;
use uuid::Uuid;
use volmeta::backend::replicated::{ReplicatedBackend, ReplicatedCluster};
use volmeta::config::Role;
use volmeta::{BackendConfig, CacheConfig, CachedMetadataStore, Clh, ClusterAddress, ClusterLocation, Hash};

fn config() -> BackendConfig {
    BackendConfig::replicated_default(vec!["node-a".into(), "node-b".into()], Role::Master)
}

fn open_store(backend: Arc<ReplicatedBackend>) -> CachedMetadataStore {
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

/// E6: with 7 TLogs' worth of cork/uncork cycles on the master, a fresh
/// slave's dry-run and real catch-up both report the same count, further
/// calls report zero, and page reads agree with the master after promotion.
#[test]
fn slave_converges_with_master_after_catch_up() {
    let cluster = ReplicatedCluster::new(&[Role::Master, Role::Slave]);
    let master = Arc::new(ReplicatedBackend::new(cluster.clone(), 0, config()).with_page_capacity(4));
    let master_store = open_store(master.clone());

    let mut expected = Vec::new();
    for i in 0..7u64 {
        let ca = ClusterAddress::new(i);
        let clh = Clh::new(ClusterLocation::new(i as u32 + 1, 0, 0, 0), Hash::of_bytes(&i.to_be_bytes()));
        write_one(&master_store, ca, clh);
        expected.push((ca, clh));
    }

    let slave = Arc::new(ReplicatedBackend::new(cluster.clone(), 1, config()).with_page_capacity(4));

    // Each write_one produces one page record plus one cork record: 14
    // pending log entries for 7 corks (7 pages assuming page_capacity=4
    // spreads CA 0..6 across two pages, plus 7 cork advances).
    let dry_run_count = slave.catch_up(true).unwrap();
    assert!(dry_run_count > 0, "dry run must report the same backlog a real catch-up would apply");

    let applied = slave.catch_up(false).unwrap();
    assert_eq!(applied, dry_run_count, "dry run and real catch-up must agree on count");

    assert_eq!(slave.catch_up(true).unwrap(), 0, "fully caught up slave has nothing left to apply");
    assert_eq!(slave.catch_up(false).unwrap(), 0);

    let slave_store = open_store(slave);
    for (ca, clh) in &expected {
        assert_eq!(slave_store.read_cluster(*ca).unwrap(), *clh);
    }
    assert_eq!(slave_store.last_cork(), master_store.last_cork());
}

/// Failover protocol (SPEC_FULL §4.4 / §9): a slave can only be promoted to
/// master once it has caught up to zero lag; afterward it accepts writes
/// and the former master is demoted.
#[test]
fn failover_promotes_caught_up_slave_and_demotes_old_master() {
    let cluster = ReplicatedCluster::new(&[Role::Master, Role::Slave]);
    let master = ReplicatedBackend::new(cluster.clone(), 0, config()).with_page_capacity(4);
    let pa_clh = Clh::new(ClusterLocation::new(42, 0, 0, 0), Hash::ZERO);
    let mut page = volmeta::Page::new(volmeta::types::PageAddress::new(0).unwrap(), 4);
    page.set(0, pa_clh);
    master.put_page(&page, 1).unwrap();

    let slave = ReplicatedBackend::new(cluster.clone(), 1, config()).with_page_capacity(4);
    slave.promote_to_master().unwrap();
    assert_eq!(slave.get_page(volmeta::types::PageAddress::new(0).unwrap()).unwrap().unwrap().get(0), pa_clh);

    // Old master is now a slave and refuses writes.
    assert!(master.put_page(&page, 0).is_err());
}

/// Transient unavailability (network partition to the replicated backend)
/// surfaces as `BackendUnavailable`, distinct from a permanent failure, so
/// the catch-up path can retry instead of treating it as data loss.
#[test]
fn unreachable_cluster_surfaces_as_transient_not_permanent() {
    let cluster = ReplicatedCluster::new(&[Role::Master]);
    let master = ReplicatedBackend::new(cluster.clone(), 0, config());
    cluster.set_unavailable(true);

    let err = master.get_cork_uuid().unwrap_err();
    assert!(matches!(err, volmeta::MetaError::BackendUnavailable(_)));
    assert!(!err.is_fatal());
}

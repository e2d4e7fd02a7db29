#![allow(missing_docs)]

use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;
use volmeta::backend::embedded::EmbeddedBackend;
use volmeta::{
    CacheConfig, CachedMetadataStore, Clh, ClusterAddress, ClusterLocation, Hash, Relocation,
    ScrubApplier, ScrubReply, SyncMode,
};

fn open_store(dir: &std::path::Path) -> CachedMetadataStore {
    let backend = EmbeddedBackend::open(dir.join("meta.log"), 4, SyncMode::Full).unwrap();
    let config = CacheConfig {
        capacity: 32,
        ignore_flush_errors: false,
        page_capacity: 4,
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

/// E3: two snapshots with distinct clusters; a scrub relocates the clusters
/// formerly belonging to the deleted snapshot. After apply, reads return the
/// relocated physical location and the scrub id has changed.
#[test]
fn scrub_relocates_surviving_entries_and_changes_scrub_id() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let ca_s1 = ClusterAddress::new(0);
    let ca_s2 = ClusterAddress::new(1);
    let s1_loc = ClusterLocation::new(100, 0, 0, 0);
    let s2_loc = ClusterLocation::new(200, 0, 0, 0);
    let s1_hash = Hash::of_bytes(b"snapshot one content");
    let s2_hash = Hash::of_bytes(b"snapshot two content");
    write_one(&store, ca_s1, Clh::new(s1_loc, s1_hash));
    write_one(&store, ca_s2, Clh::new(s2_loc, s2_hash));

    let old_scrub_id = store.scrub_id();
    assert!(old_scrub_id.is_none());

    // s1 is deleted and scrubbed away; its cluster is rewritten into a new
    // SCO at a new location. s2 is untouched.
    let relocated_loc = ClusterLocation::new(300, 0, 1, 0);
    let reply = ScrubReply {
        new_scrub_id: Uuid::new_v4(),
        clone_id: 0,
        relocations: vec![Relocation {
            ca: ca_s1,
            old_location: s1_loc,
            new_location: relocated_loc,
        }],
    };

    let applied = ScrubApplier::apply(&store, &reply).unwrap();
    assert_eq!(applied, 1);

    let relocated = store.read_cluster(ca_s1).unwrap();
    assert_eq!(relocated.location, relocated_loc);
    assert_eq!(relocated.hash, s1_hash, "content hash is preserved across relocation");

    let untouched = store.read_cluster(ca_s2).unwrap();
    assert_eq!(untouched.location, s2_loc);

    assert_eq!(store.scrub_id(), Some(reply.new_scrub_id));
    assert_ne!(store.scrub_id(), old_scrub_id);
}

/// E4: a scrub with zero relocations (fill_ratio=0.0 in the source) still
/// advances scrub_id on every replica that applies it, without touching any
/// page.
#[test]
fn empty_scrub_reply_still_advances_scrub_id() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let ca = ClusterAddress::new(0);
    let clh = Clh::new(ClusterLocation::new(1, 0, 0, 0), Hash::of_bytes(b"untouched"));
    write_one(&store, ca, clh);

    let before = Uuid::new_v4();
    store.set_scrub_id(before).unwrap();

    let reply = ScrubReply {
        new_scrub_id: Uuid::new_v4(),
        clone_id: 0,
        relocations: vec![],
    };
    let applied = ScrubApplier::apply(&store, &reply).unwrap();

    assert_eq!(applied, 0);
    assert_eq!(store.read_cluster(ca).unwrap(), clh, "no-op scrub must not touch pages");
    assert_eq!(store.scrub_id(), Some(reply.new_scrub_id));
    assert_ne!(store.scrub_id(), Some(before));
}

/// A crash between the temporary scrub_id write and the final relocation
/// flush must leave the backend's scrub_id mismatched against whatever the
/// snapshot layer expects, so the recovery path (outside this crate) wipes
/// the store rather than trusting half-applied relocations.
#[test]
fn interrupted_apply_leaves_a_mismatched_temporary_scrub_id() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let ca = ClusterAddress::new(0);
    write_one(&store, ca, Clh::new(ClusterLocation::new(1, 0, 0, 0), Hash::ZERO));

    let final_scrub_id = Uuid::new_v4();
    // Simulate "crash after step 2, before step 5": only the temporary id
    // lands on the backend.
    let temporary = Uuid::new_v4();
    store.set_scrub_id(temporary).unwrap();

    assert_ne!(store.scrub_id(), Some(final_scrub_id));
    assert_eq!(store.scrub_id(), Some(temporary));
}

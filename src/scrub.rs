//! Scrub-application path: applying a scrub result rewrites a range of
//! snapshot metadata and tags the volume with a fresh scrub identifier
//! every replica can detect.
//!
//! The scrub result object itself — which SCOs it created, which it marks
//! for deletion, prefetch hints — is data-path bookkeeping out of scope
//! here. [`ScrubReply`] carries only what this crate's invariants need: the
//! new scrub id and the ordered list of `(CA, CL_old, CL_new)` relocations
//! to compare-and-swap into the metadata store.

use crate::cache::CachedMetadataStore;
use crate::error::Result;
use crate::types::{Clh, ClusterAddress, ClusterLocation};
use uuid::Uuid;

/// One `(CA, CL_old) (CA, CL_new)` pair from a relocation TLog: the
/// cluster at `ca` moved from `old_location` to `new_location` without its
/// content changing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub ca: ClusterAddress,
    pub old_location: ClusterLocation,
    pub new_location: ClusterLocation,
}

/// Everything [`ScrubApplier`] needs to apply one scrub result, already
/// resolved by the volume manager from the backend scrub-result object.
/// `clone_id` is the clone this reply is being applied to — relocation
/// TLogs are generated against clone 0 and must be stamped per clone
/// before they're compared against what's actually stored there.
#[derive(Clone, Debug)]
pub struct ScrubReply {
    pub new_scrub_id: Uuid,
    pub clone_id: u8,
    pub relocations: Vec<Relocation>,
}

impl CachedMetadataStore {
    /// For every relocation, stamps both locations by `clone_id` and only
    /// relocates an entry whose *current* location still equals the
    /// relocation's recorded old location — an entry overwritten by newer
    /// application data since the scrub was computed must not be
    /// relocated.
    pub fn apply_relocs(&self, relocations: &[Relocation], clone_id: u8) -> Result<u64> {
        let mut applied = 0u64;
        for reloc in relocations {
            let old = reloc.old_location.with_clone_id_delta(clone_id);
            let current = self.read_cluster(reloc.ca)?;
            if current.location.raw() != old.raw() {
                continue;
            }
            let new = reloc.new_location.with_clone_id_delta(clone_id);
            let relocated = Clh::new(new, current.hash);
            self.replay_into_cache(reloc.ca, relocated)?;
            applied += 1;
        }
        Ok(applied)
    }
}

/// Applies a [`ScrubReply`] to a volume's metadata store in six steps (plus
/// a replicated-backend-only relocation push that rides along with step 4):
///
/// 1. the scrub result is already loaded by the caller into `reply`;
/// 2. a temporary scrub id is written *before* relocating anything, so a
///    crash mid-apply leaves the snapshot layer's scrub id mismatched
///    against what's on the backend and the metadata store is wiped on
///    restart rather than left half-relocated — a scrub mismatch is a
///    recovery condition, not an error to propagate;
/// 3. every relocation is compare-and-swapped in;
/// 4. dirty pages are flushed, staying resident in cache, and — for a
///    replicated backend configured with `apply_relocations_to_slaves` —
///    pushed on to every slave immediately rather than left for the
///    slave's own next `catch_up`;
/// 5. the final scrub id is written as a barrier;
/// 6. the backend is synced.
pub struct ScrubApplier;

impl ScrubApplier {
    /// Applies `reply` to `mdstore`, returning the number of relocations
    /// actually applied (which may be less than `reply.relocations.len()`
    /// if some were superseded by newer writes). A scrub reply with zero
    /// relocations still changes `scrub_id`.
    pub fn apply(mdstore: &CachedMetadataStore, reply: &ScrubReply) -> Result<u64> {
        let temporary = Uuid::new_v4();
        mdstore.set_scrub_id(temporary)?;

        let applied = mdstore.apply_relocs(&reply.relocations, reply.clone_id)?;

        mdstore.flush_dirty_pages()?;
        mdstore.replicate_scrub_to_slaves()?;
        mdstore.set_scrub_id(reply.new_scrub_id)?;
        mdstore.sync()?;

        Ok(applied)
    }
}

//! Pluggable persistence contract for one volume's metadata. Three variants
//! implement it: [`embedded::EmbeddedBackend`] (single-writer, on-disk,
//! ordered), [`replicated::ReplicatedBackend`] (master/slave cluster over
//! RPC-shaped batching), and [`coordination::CoordinationBackend`]
//! (freezeable, supports clone parent chains). Dispatch is per-volume, not
//! on the read-hot path — the page cache in front of it absorbs that.

pub mod coordination;
pub mod embedded;
pub mod replicated;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::page::Page;
use crate::types::PageAddress;
use std::sync::Arc;
use uuid::Uuid;

/// Functor signature for [`MetadataBackend::for_each`]: visits every
/// non-null `(ClusterAddress, Clh)` pair with `ClusterAddress < ca_max`, in
/// page-ascending order.
pub type ForEachFn<'a> = dyn FnMut(crate::types::ClusterAddress, crate::types::Clh) + 'a;

/// Shared contract for every metadata backend variant.
///
/// Every entry point returns a `Result`; the only place a failure is
/// swallowed instead of propagated is the destructor path and
/// `clear_all_keys`, both of which only log.
pub trait MetadataBackend: Send + Sync {
    /// `Ok(Some(page))` if persisted, `Ok(None)` if absent — the caller
    /// zero-fills in that case.
    fn get_page(&self, pa: PageAddress) -> Result<Option<Page>>;

    /// Durably persists `page` and folds `used_clusters_delta` into the
    /// `used_clusters` system key in the same atomic group.
    fn put_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()>;

    /// Deletes the page's key and folds `used_clusters_delta` into
    /// `used_clusters` in the same atomic group. A missing key is not an
    /// error: `used_clusters` is only adjusted when the key actually
    /// existed, and each variant is responsible for reporting that through
    /// the delta it was given rather than silently re-deriving it here.
    fn discard_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()>;

    /// Only meaningful when a parent is attached; `false` otherwise.
    fn page_exists_in_parent(&self, pa: PageAddress) -> Result<bool> {
        let _ = pa;
        Ok(false)
    }

    fn get_cork_uuid(&self) -> Result<Option<Uuid>>;

    /// `barrier` means: durable and ordered strictly after every preceding
    /// write this backend has accepted.
    fn set_cork_uuid(&self, uuid: Uuid, barrier: bool) -> Result<()>;

    fn get_scrub_id(&self) -> Result<Option<Uuid>>;

    fn set_scrub_id(&self, id: Uuid, barrier: bool) -> Result<()>;

    /// Wipes every key for this volume's namespace. Failures here are
    /// logged, never propagated.
    fn clear_all_keys(&self) -> Result<()>;

    fn get_used_clusters(&self) -> Result<u64>;

    /// True only for the coordination-service variant, which participates
    /// in the two-phase emancipation protocol for clones.
    fn freezeable(&self) -> bool {
        false
    }

    fn has_frozen_parent(&self) -> bool {
        false
    }

    fn is_emancipated(&self) -> bool {
        true
    }

    /// Copies the parent backend's current `cork_uuid` into this backend's
    /// `cork_uuid` with a barrier. Fails if the parent has no cork yet.
    fn set_cork_from_frozen_parent(&self, _parent: &dyn MetadataBackend) -> Result<()> {
        Err(crate::error::MetaError::InvalidArgument(
            "backend does not support frozen-parent cork adoption".into(),
        ))
    }

    /// Visits every non-null entry with `ca < ca_max`, in page-ascending
    /// order.
    fn for_each(&self, ca_max: crate::types::ClusterAddress, f: &mut ForEachFn<'_>) -> Result<()>;

    fn get_config(&self) -> BackendConfig;

    fn mark_delete_local_artifacts_on_drop(&self) {}

    fn mark_delete_global_artifacts_on_drop(&self) {}

    /// Forces any buffered writes out to durable storage.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Pushes a just-applied scrub's relocations out to this backend's
    /// slaves eagerly, instead of leaving them to pick the relocations up on
    /// their own next `catch_up`. Only meaningful for the replicated
    /// variant, and only when its config's `apply_relocations_to_slaves` is
    /// set — every other variant, and a replicated master with the flag
    /// cleared, takes the default no-op.
    fn replicate_scrub_to_slaves(&self) -> Result<()> {
        Ok(())
    }

    /// Batched form of put/discard/cork used by the replicated variant,
    /// which submits a whole uncork's worth of page writes plus the
    /// `cork_uuid` advance as a single RPC group. The default sequences the
    /// individual calls, which is indistinguishable from a real batch for
    /// the embedded and coordination variants since they have no RPC
    /// round-trip to amortize.
    fn multiset(
        &self,
        puts: &[(&Page, i32)],
        discards: &[(&Page, i32)],
        cork: Option<(Uuid, bool)>,
    ) -> Result<()> {
        for (page, delta) in puts {
            self.put_page(page, *delta)?;
        }
        for (page, delta) in discards {
            self.discard_page(page, *delta)?;
        }
        if let Some((uuid, barrier)) = cork {
            self.set_cork_uuid(uuid, barrier)?;
        }
        Ok(())
    }
}

/// Shared handle type used throughout the cache/builder/scrub layers.
pub type BackendHandle = Arc<dyn MetadataBackend>;

//! Traits for the external collaborators this crate only *consumes*: the
//! object backend's namespace handle, the snapshot layer's persistor, and
//! the TLog reader. The data path, the object storage transport, and the
//! snapshot XML format are themselves out of scope here — only the shapes
//! this crate calls through are specified, as trait objects a real volume
//! manager wires up to its own implementations.

use crate::error::Result;
use crate::tlog::TLogId;
use uuid::Uuid;

/// A per-volume key-prefix handle on the object backend (distilled spec
/// §6 "Backend namespace handle"). `read`/`write` move a local scratch
/// file in and out of the backend under `key`; `write_tag`/`get_tag`
/// manage small conditional markers such as the namespace `owner_tag`.
pub trait BackendNamespaceHandle: Send + Sync {
    /// Downloads the object stored under `key` to the local path.
    fn read(&self, key: &str, path: &std::path::Path) -> Result<()>;

    /// Uploads the local path as `key`, optionally refusing to clobber an
    /// existing object.
    fn write(&self, path: &std::path::Path, key: &str, overwrite: bool) -> Result<()>;

    /// Writes `key` with a value, succeeding only if `condition` holds
    /// against whatever is currently stored (or absent) — the mechanism
    /// namespace-ownership claims (SPEC_FULL §6 "Namespace ownership") and
    /// conditional publication of a scrub result both rely on.
    fn write_tag(&self, key: &str, value: &str, condition: Option<&str>) -> Result<()>;

    fn get_tag(&self, key: &str) -> Result<Option<String>>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn object_exists(&self, key: &str) -> Result<bool> {
        self.exists(key)
    }

    /// Lists every key under `prefix`, ascending.
    fn for_each(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Direction to walk a clone chain in
/// [`SnapshotPersistor::visit_clone_chain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOrder {
    OldestFirst,
    NewestFirst,
}

/// One clone in a volume's ancestry, as reported by the snapshot layer.
#[derive(Debug, Clone)]
pub struct CloneTLogs {
    pub clone_id: u8,
    pub tlogs: Vec<TLogId>,
}

/// The snapshot layer's view of corks and TLogs for one volume (distilled
/// spec §6 "SnapshotPersistor"). [`crate::store_builder::MetadataStoreBuilder`]
/// and [`crate::scrub::ScrubApplier`] consume this to discover what to
/// replay or relocate; they never parse snapshot XML themselves.
pub trait SnapshotPersistor: Send + Sync {
    fn last_cork(&self) -> Result<Option<Uuid>>;

    fn scrub_id(&self) -> Result<Uuid>;

    /// TLogs strictly after `start_cork` (or from the beginning if
    /// `None`) up to and including `md_cork`, oldest first, grouped by
    /// clone-id for clone chains.
    fn tlogs_on_backend_since_last_cork(
        &self,
        md_cork: Option<Uuid>,
        start_cork: Option<Uuid>,
    ) -> Result<Vec<CloneTLogs>>;

    fn snapshot_cork(&self, name: &str) -> Result<Option<Uuid>>;

    fn trim_to_backend(&self) -> Result<()>;

    /// Visits every volume in the clone chain in the requested order.
    fn visit_clone_chain(&self, order: ChainOrder, visitor: &mut dyn FnMut(u8));
}

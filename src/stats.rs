//! Observability snapshot returned by `CachedMetadataStore::get_stats`
//! (SPEC_FULL §4.3), mirroring the teacher's `PagerStats`/`StorageMetrics`
//! snapshot-struct convention: a plain `Default`-able struct copied out
//! under lock rather than a live handle into the cache's internals.

use crate::error::{MetaError, Result};
use serde::Serialize;
use uuid::Uuid;

/// Snapshot of one [`crate::cache::CachedMetadataStore`]'s counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub written_clusters: u64,
    pub discarded_clusters: u64,
    pub hits: u64,
    pub misses: u64,
    pub num_pages: u64,
    /// `(cork_uuid, clusters written inside that cork)` for every cork
    /// still pending in memory, oldest first — mirrors the source's
    /// `getCorkedClusters`.
    pub corked_clusters: Vec<(Uuid, u64)>,
}

impl Stats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    /// Renders this snapshot as pretty-printed JSON, the shape a volume
    /// manager's monitoring endpoint forwards as-is (grounded in the
    /// teacher CLI's `serde_json::to_string_pretty` status output).
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| MetaError::Serialization(err.to_string()))
    }
}

//! # volmeta — metadata engine for a distributed block-storage volume driver
//!
//! A volume presents a linear address space of fixed-size clusters; each
//! cluster is physically stored once in a SCO on an object backend. This
//! crate owns the authoritative mapping
//!
//! ```text
//! cluster_address -> (cluster_location, content_hash)
//! ```
//!
//! for every volume, together with the ordering guarantees needed to
//! survive crashes without corruption, support copy-on-write clones chained
//! to a parent, support snapshot restore, support online scrubbing that
//! rewrites cold data, and fail over between replicas of the metadata
//! store.
//!
//! ## Architecture
//!
//! - [`page`] — fixed-capacity array of cluster-location-and-hash entries,
//!   the unit of caching and persistence.
//! - [`backend`] — the pluggable [`backend::MetadataBackend`] contract plus
//!   its three implementations: embedded on-disk, replicated master/slave,
//!   and coordination-service (freezeable, clone-aware).
//! - [`cache`] — [`cache::CachedMetadataStore`], the in-memory page cache
//!   and cork/uncork barrier pipeline in front of one backend.
//! - [`scrub`] — [`scrub::ScrubApplier`], which applies a scrub result to a
//!   volume's metadata atomically.
//! - [`store_builder`] — rebuilds a store from a volume's TLog stream.
//! - [`scanner`] — validates and replays local TLogs left behind by a
//!   crash.
//!
//! The data path (SCO reads/writes), backend object transport, snapshot
//! XML format, CLI/bindings, prefetch policy, and backend garbage
//! collection are out of scope — this crate only specifies the interfaces
//! in [`interfaces`] that a real volume manager wires up to its own
//! implementations of those concerns.

pub mod backend;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod logging;
pub mod page;
pub mod primitives;
pub mod scanner;
pub mod scrub;
pub mod stats;
pub mod store_builder;
pub mod tlog;
pub mod types;

pub use crate::backend::{BackendHandle, MetadataBackend};
pub use crate::cache::CachedMetadataStore;
pub use crate::config::{BackendConfig, CacheConfig, HashingConfig, Role, SyncMode};
pub use crate::error::{MetaError, Result};
pub use crate::page::Page;
pub use crate::scanner::{LocalTLogScanner, ScoCrcVerifier};
pub use crate::scrub::{Relocation, ScrubApplier, ScrubReply};
pub use crate::stats::Stats;
pub use crate::store_builder::{BuildResult, CheckScrubId, MetadataStoreBuilder};
pub use crate::tlog::{TLogEntry, TLogId, TLogReader};
pub use crate::types::{Clh, ClusterAddress, ClusterLocation, Hash, PageAddress};

//! Configuration types for the cache and the pluggable backend variants.
//! Persisted/reloaded via `get_config`/`update_backend_config`, so every
//! variant config derives `Serialize`/`Deserialize`.

use crate::error::{MetaError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Durability mode for backend writes. `Full` forces a durable flush on
/// every `put_page`/`discard_page`; `Normal` defers to the next explicit
/// `sync()` or cork barrier; `Off` never forces one (still
/// barrier-synchronous on `cork_uuid`/`scrub_id`, which is unconditional).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    Full,
    Normal,
    Off,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Normal
    }
}

/// Role of a replicated-backend node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Master,
    Slave,
}

/// Configuration for one [`crate::backend::MetadataBackend`] variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendConfig {
    Embedded {
        path: PathBuf,
        page_capacity: usize,
        sync: SyncMode,
    },
    Replicated {
        nodes: Vec<String>,
        role: Role,
        timeout_ms: u64,
        /// Whether [`crate::scrub::ScrubApplier::apply`] pushes a scrub's
        /// relocations to every slave eagerly (`true`) or leaves slaves to
        /// pick them up on their own next `catch_up` (`false`). Consulted by
        /// [`crate::backend::replicated::ReplicatedBackend::replicate_scrub_to_slaves`].
        apply_relocations_to_slaves: bool,
    },
    Coordination {
        endpoints: Vec<String>,
        system: String,
        namespace: String,
    },
}

impl BackendConfig {
    pub fn embedded_default(path: PathBuf) -> Self {
        BackendConfig::Embedded {
            path,
            page_capacity: crate::types::DEFAULT_PAGE_CAPACITY,
            sync: SyncMode::Normal,
        }
    }

    pub fn replicated_default(nodes: Vec<String>, role: Role) -> Self {
        BackendConfig::Replicated {
            nodes,
            role,
            timeout_ms: 5_000,
            apply_relocations_to_slaves: true,
        }
    }

    pub fn coordination_default(endpoints: Vec<String>, system: String, namespace: String) -> Self {
        BackendConfig::Coordination {
            endpoints,
            system,
            namespace,
        }
    }

    /// Loads a backend config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(MetaError::Io)?;
        toml::from_str(&contents).map_err(|err| MetaError::Serialization(err.to_string()))
    }

    /// Persists this config as TOML, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(MetaError::Io)?;
        }
        let serialized =
            toml::to_string_pretty(self).map_err(|err| MetaError::Serialization(err.to_string()))?;
        fs::write(path, serialized).map_err(MetaError::Io)
    }
}

/// In-memory page cache configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Whether `maybe_write_page` should swallow a backend flush error
    /// (logging it) instead of propagating it and halting the volume. Only
    /// ever set for destructor-path or equivalent best-effort flushes.
    pub ignore_flush_errors: bool,
    pub page_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ignore_flush_errors: false,
            page_capacity: crate::types::DEFAULT_PAGE_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn production() -> Self {
        Self {
            capacity: 1024,
            ignore_flush_errors: false,
            page_capacity: crate::types::DEFAULT_PAGE_CAPACITY,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}

/// Hashing policy: content hashing can be disabled entirely, in which case
/// every stored hash reads back as zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HashingConfig {
    pub enabled: bool,
    pub cluster_size: usize,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cluster_size: 4096,
        }
    }
}

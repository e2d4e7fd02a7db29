//! Low-level primitives shared by the backend variants.
//!
//! Includes checksums and file I/O abstractions — the building blocks the
//! pluggable [`crate::backend::MetadataBackend`] implementations are
//! assembled from.

/// Checksum helpers used for page and TLog frame validation.
pub mod checksum;

/// I/O abstractions for positioned file reads/writes.
pub mod io;

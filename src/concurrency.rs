//! In-process concurrency helpers enforcing the per-volume locking
//! discipline. `CachedMetadataStore` takes its three locks in a fixed
//! order — `corks_lock → cache_lock → backend_lock`, reversed never — all
//! in-process (`parking_lot`) rather than cross-process (`flock`).

use crate::error::{MetaError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Serializes `uncork` for one volume. A concurrent uncork is a programming
/// error upstream; this turns it into a catchable `Result` rather than an
/// abort.
#[derive(Default)]
pub struct SingleWriter {
    busy: AtomicBool,
}

/// RAII guard released on drop, panicking-free even if the caller forgets
/// to check the `Result` from [`SingleWriter::enter`].
pub struct WriterGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl SingleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the critical section, failing fast if another call is
    /// already inside it.
    pub fn enter(&self) -> Result<WriterGuard<'_>> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(MetaError::InvalidArgument(
                "uncork is not reentrant for a single volume".into(),
            ));
        }
        Ok(WriterGuard { flag: &self.busy })
    }
}

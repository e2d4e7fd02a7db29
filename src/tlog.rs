//! TLog entry shapes and the reader trait consumed by
//! [`crate::scanner::LocalTLogScanner`] and
//! [`crate::store_builder::MetadataStoreBuilder`]. The TLog wire format
//! itself is out of scope for this crate; a real volume manager supplies a
//! concrete [`TLogReader`] over whatever on-disk format it uses.

use crate::error::Result;
use crate::types::{Clh, ClusterAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one TLog; TLog ids double as cork uuids, since a cork's uuid
/// is the id of the TLog it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TLogId(pub Uuid);

impl fmt::Display for TLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tlog:{}", self.0)
    }
}

/// One entry kind in a TLog's entry stream. `SyncTc` is a sync marker the
/// data path emits between batches; the scanner and builder both skip it
/// without special handling beyond acknowledging it was seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TLogEntry {
    Loc(ClusterAddress, Clh),
    ScoCrc(u32),
    TLogCrc(u32),
    SyncTc,
}

/// Iterates the entries of one TLog, in write order.
pub trait TLogReader: Send {
    /// Returns the next entry, or `Ok(None)` at end of stream.
    fn next_entry(&mut self) -> Result<Option<TLogEntry>>;

    /// Drives `f` over every entry until exhaustion or the first error.
    /// `where Self: Sized` keeps this generic convenience method from
    /// making the trait itself non-dyn-compatible — `Box<dyn TLogReader>`
    /// and `&mut dyn TLogReader` are used throughout the scanner and
    /// builder and must keep working.
    fn for_each(&mut self, mut f: impl FnMut(TLogEntry) -> Result<()>) -> Result<()>
    where
        Self: Sized,
    {
        while let Some(entry) = self.next_entry()? {
            f(entry)?;
        }
        Ok(())
    }
}

/// In-memory [`TLogReader`] used by tests and by any caller that already
/// has a fully materialized entry list (e.g. a scratch-file download
/// already parsed into memory). Mirrors the shape of the source's
/// `TLogReader` closely enough for [`crate::scanner::LocalTLogScanner`] and
/// [`crate::store_builder::MetadataStoreBuilder`] to be exercised without a
/// real on-disk TLog format.
pub struct VecTLogReader {
    entries: std::vec::IntoIter<TLogEntry>,
}

impl VecTLogReader {
    pub fn new(entries: Vec<TLogEntry>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl TLogReader for VecTLogReader {
    fn next_entry(&mut self) -> Result<Option<TLogEntry>> {
        Ok(self.entries.next())
    }
}

//! Fixed-capacity page of [`Clh`] entries — the unit of caching and
//! persistence (SPEC_FULL §3, §4.1).

use crate::types::{Clh, ClusterAddress, PageAddress, CLH_BYTES};

/// A page holds `capacity` [`Clh`] entries plus the transient bookkeeping
/// flags the cache needs to decide whether (and how) to flush it.
#[derive(Clone, Debug)]
pub struct Page {
    address: PageAddress,
    capacity: usize,
    entries: Box<[Clh]>,
    dirty: bool,
    /// Net entries written since the last flush, fed to
    /// `put_page`'s `used_clusters_delta`.
    written_since_flush: i32,
    /// Net entries discarded since the last flush.
    discarded_since_flush: i32,
}

impl Page {
    pub fn new(address: PageAddress, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            address,
            capacity,
            entries: vec![Clh::NULL; capacity].into_boxed_slice(),
            dirty: false,
            written_since_flush: 0,
            discarded_since_flush: 0,
        }
    }

    pub fn from_entries(address: PageAddress, entries: Box<[Clh]>) -> Self {
        let capacity = entries.len();
        Self {
            address,
            capacity,
            entries,
            dirty: false,
            written_since_flush: 0,
            discarded_since_flush: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size_bytes(&self) -> usize {
        self.capacity * CLH_BYTES
    }

    pub fn address(&self) -> PageAddress {
        self.address
    }

    pub fn offset_of(&self, ca: ClusterAddress) -> usize {
        ca.offset_in_page(self.capacity)
    }

    pub fn get(&self, offset: usize) -> Clh {
        self.entries[offset]
    }

    pub fn entries(&self) -> &[Clh] {
        &self.entries
    }

    /// Overwrites one entry, marking the page dirty and tracking the
    /// net used-cluster delta for the next flush.
    pub fn set(&mut self, offset: usize, clh: Clh) {
        let was_null = self.entries[offset].is_null();
        let becomes_null = clh.is_null();
        match (was_null, becomes_null) {
            (true, false) => self.written_since_flush += 1,
            (false, true) => self.discarded_since_flush += 1,
            _ => {}
        }
        self.entries[offset] = clh;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Clh::is_null)
    }

    /// Net delta (`written - discarded`) to hand to the backend on flush.
    pub fn used_clusters_delta(&self) -> i32 {
        self.written_since_flush - self.discarded_since_flush
    }

    /// Clears the dirty flag and per-page counters after a successful flush.
    pub fn mark_flushed(&mut self) {
        self.dirty = false;
        self.written_since_flush = 0;
        self.discarded_since_flush = 0;
    }

    /// Adds `delta` to the clone-id field of every non-null entry. Used when
    /// a clone volume adopts a page fetched from its parent.
    pub fn stamp_clone_id(&mut self, delta: u8) {
        let mut changed = false;
        for entry in self.entries.iter_mut() {
            if !entry.is_null() {
                entry.location = entry.location.with_clone_id_delta(delta);
                changed = true;
            }
        }
        if changed {
            self.dirty = true;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_bytes());
        for entry in self.entries.iter() {
            entry.encode(&mut out);
        }
        out
    }

    pub fn decode(address: PageAddress, bytes: &[u8], capacity: usize) -> crate::error::Result<Self> {
        if bytes.len() != capacity * CLH_BYTES {
            return Err(crate::error::MetaError::Corruption(format!(
                "page {} has {} bytes, expected {}",
                address,
                bytes.len(),
                capacity * CLH_BYTES
            )));
        }
        let mut entries = Vec::with_capacity(capacity);
        for chunk in bytes.chunks(CLH_BYTES) {
            entries.push(Clh::decode(chunk)?);
        }
        Ok(Self {
            address,
            capacity,
            entries: entries.into_boxed_slice(),
            dirty: false,
            written_since_flush: 0,
            discarded_since_flush: 0,
        })
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}
impl Eq for Page {}

impl PartialOrd for Page {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Page {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.value().cmp(&other.address.value())
    }
}

//! Core addressing and content types shared by every component of the
//! metadata engine: [`ClusterAddress`], [`ClusterLocation`], [`Hash`] and the
//! combined [`Clh`] pair that is the single value the store persists per
//! cluster.

use crate::error::{MetaError, Result};
use crate::primitives::checksum::Crc32Fast;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default page capacity (entries per [`crate::page::Page`]), matching the
/// source's typical configuration. Must be a power of two.
pub const DEFAULT_PAGE_CAPACITY: usize = 256;

/// Logical address of one cluster within a volume's linear address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterAddress(pub u64);

impl ClusterAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Page this cluster falls in, given a page capacity (must be a power of two).
    pub fn page_address(self, page_capacity: usize) -> PageAddress {
        debug_assert!(page_capacity.is_power_of_two());
        let log2 = page_capacity.trailing_zeros();
        PageAddress::new_unchecked(self.0 >> log2)
    }

    /// Offset of this cluster's entry within its page.
    pub fn offset_in_page(self, page_capacity: usize) -> usize {
        debug_assert!(page_capacity.is_power_of_two());
        (self.0 as usize) & (page_capacity - 1)
    }
}

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ca:{}", self.0)
    }
}

/// Address of a [`crate::page::Page`] (`ClusterAddress >> log2(page_capacity)`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageAddress(u64);

impl PageAddress {
    /// System keys (`cork`, `scrub_id`, `used_clusters`, `emancipated`) are
    /// reserved at the top of the page-address space so that a backend can
    /// reject a page write that collides with them.
    pub const RESERVED_BASE: u64 = u64::MAX - 8;

    pub fn new(addr: u64) -> Result<Self> {
        if addr >= Self::RESERVED_BASE {
            return Err(MetaError::InvalidArgument(format!(
                "page address {addr} collides with the reserved system-key range"
            )));
        }
        Ok(Self(addr))
    }

    pub(crate) fn new_unchecked(addr: u64) -> Self {
        Self(addr)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// First cluster address belonging to this page.
    pub fn first_cluster(self, page_capacity: usize) -> ClusterAddress {
        debug_assert!(page_capacity.is_power_of_two());
        let log2 = page_capacity.trailing_zeros();
        ClusterAddress(self.0 << log2)
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pa:{}", self.0)
    }
}

/// 64-bit packed physical location of one cluster: `number:32 | clone_id:8 |
/// version:8 | offset:16`, low bits first. The all-zero value is the null
/// (unallocated/discarded) location.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLocation(u64);

impl ClusterLocation {
    pub const NULL: ClusterLocation = ClusterLocation(0);

    pub fn new(number: u32, clone_id: u8, version: u8, offset: u16) -> Self {
        let raw = (offset as u64)
            | ((version as u64) << 16)
            | ((clone_id as u64) << 24)
            | ((number as u64) << 32);
        Self(raw)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn number(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn clone_id(self) -> u8 {
        ((self.0 >> 24) & 0xff) as u8
    }

    pub fn version(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub fn offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Returns a copy with `delta` added into the clone-id byte, wrapping
    /// within the byte. Used to stamp pages fetched from a parent volume
    /// (one clone-id hop per generation) without disturbing the other
    /// packed fields.
    pub fn with_clone_id_delta(self, delta: u8) -> Self {
        if self.is_null() {
            return self;
        }
        let new_clone_id = self.clone_id().wrapping_add(delta);
        Self::new(self.number(), new_clone_id, self.version(), self.offset())
    }
}

/// Fixed-width content hash. Zero (`Hash::ZERO`) when hashing is disabled at
/// build time.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Computes a fixed-width digest of `data`. Not cryptographically
    /// strong — the engine only needs a stable fingerprint to detect
    /// relocation-vs-overwrite races during scrub application (§4.7), not
    /// collision resistance against an adversary.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut out = [0u8; 32];
        for (lane, chunk) in out.chunks_mut(4).enumerate() {
            let mut hasher = Crc32Fast::default();
            {
                use crate::primitives::checksum::Checksum;
                hasher.update(&(lane as u32).to_be_bytes());
                hasher.update(data);
                chunk.copy_from_slice(&hasher.finalize().to_be_bytes());
            }
        }
        Hash(out)
    }

    /// Digest of a `size`-byte all-zero cluster — the hash half of the
    /// canonical `discarded_location_and_hash` value.
    pub fn of_zero_cluster(size: usize) -> Self {
        let zeros = vec![0u8; size];
        Self::of_bytes(&zeros)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..4]))
    }
}

/// `(ClusterLocation, Hash)` — the single value the store persists per
/// cluster. Constant serialized width (`CLH_BYTES`) for every entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clh {
    pub location: ClusterLocation,
    pub hash: Hash,
}

/// Serialized width of one [`Clh`] entry: 8-byte location + 32-byte hash.
pub const CLH_BYTES: usize = 8 + 32;

impl Clh {
    pub const NULL: Clh = Clh {
        location: ClusterLocation::NULL,
        hash: Hash::ZERO,
    };

    pub fn new(location: ClusterLocation, hash: Hash) -> Self {
        Self { location, hash }
    }

    pub fn is_null(&self) -> bool {
        self.location.is_null()
    }

    /// Canonical value returned by `read_cluster` for unallocated addresses
    /// when hashing is enabled: a null location paired with the hash of a
    /// zero-filled cluster, not a bare zero hash. Easy detail to drop —
    /// confirmed against the source's `discarded_location_and_hash()`.
    pub fn discarded(cluster_size: usize, hashing_enabled: bool) -> Self {
        let hash = if hashing_enabled {
            Hash::of_zero_cluster(cluster_size)
        } else {
            Hash::ZERO
        };
        Clh {
            location: ClusterLocation::NULL,
            hash,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.location.raw().to_be_bytes());
        out.extend_from_slice(&self.hash.0);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CLH_BYTES {
            return Err(MetaError::Corruption("clh entry truncated".into()));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[0..8]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[8..40]);
        Ok(Clh {
            location: ClusterLocation::from_raw(u64::from_be_bytes(raw)),
            hash: Hash(hash),
        })
    }
}

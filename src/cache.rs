//! In-memory page cache, cork pipeline, and write-behind flush to exactly
//! one [`MetadataBackend`] (SPEC_FULL §4.3 / distilled spec §4.3) — the
//! busiest component in the crate.
//!
//! Lock order is fixed and asserted by construction (never taken in
//! reverse): `corks` → `cache` → `backend`. This mirrors the teacher's own
//! "ze locks, in this order" discipline
//! ([`crate::concurrency::SingleWriter`]), just with three guards instead
//! of one.

use crate::backend::{BackendHandle, MetadataBackend};
use crate::concurrency::SingleWriter;
use crate::config::{CacheConfig, HashingConfig};
use crate::error::{MetaError, Result};
use crate::page::Page;
use crate::stats::Stats;
use crate::types::{Clh, ClusterAddress, PageAddress};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One TLog's accumulated writes, not yet durable
/// (distilled spec §3 "Cork").
#[derive(Debug, Default)]
pub struct Cork {
    pub uuid: Uuid,
    pub map: BTreeMap<ClusterAddress, Clh>,
}

impl Cork {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            map: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    discarded: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct PageTable {
    lru: LruCache<PageAddress, Page>,
    capacity: usize,
    page_capacity: usize,
}

impl PageTable {
    fn new(capacity: usize, page_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity must be nonzero");
        Self {
            lru: LruCache::new(cap),
            capacity,
            page_capacity,
        }
    }
}

/// In-memory page cache fronting one [`MetadataBackend`] (C3).
pub struct CachedMetadataStore {
    backend: BackendHandle,
    hashing: HashingConfig,
    corks: RwLock<VecDeque<Cork>>,
    cache: RwLock<PageTable>,
    backend_lock: Mutex<()>,
    cork_uuid_last_durable: Mutex<Option<Uuid>>,
    scrub_id: RwLock<Option<Uuid>>,
    single_writer: SingleWriter,
    ignore_flush_errors: bool,
    halted: AtomicBool,
    counters: Counters,
}

impl CachedMetadataStore {
    /// Opens a cache in front of `backend`, priming `cork_uuid`/`scrub_id`
    /// from whatever is already durable (a fresh volume sees `None` for
    /// both, per distilled spec §3 "Lifecycle").
    pub fn open(backend: BackendHandle, config: CacheConfig) -> Result<Self> {
        let cork_uuid_last_durable = backend.get_cork_uuid()?;
        let scrub_id = backend.get_scrub_id()?;
        let store = Self {
            backend,
            hashing: HashingConfig::default(),
            corks: RwLock::new(VecDeque::new()),
            cache: RwLock::new(PageTable::new(config.capacity, config.page_capacity)),
            backend_lock: Mutex::new(()),
            cork_uuid_last_durable: Mutex::new(cork_uuid_last_durable),
            scrub_id: RwLock::new(scrub_id),
            single_writer: SingleWriter::new(),
            ignore_flush_errors: config.ignore_flush_errors,
            halted: AtomicBool::new(false),
            counters: Counters::default(),
        };
        Ok(store)
    }

    /// Overrides the hashing policy used to canonicalize unallocated reads
    /// (distilled spec §3: `discarded_location_and_hash`). Exposed
    /// separately from [`CacheConfig`] because it is a volume-wide, not
    /// cache-wide, policy (distilled spec §3 "Hash").
    pub fn with_hashing(mut self, hashing: HashingConfig) -> Self {
        self.hashing = hashing;
        self
    }

    fn check_halted(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            return Err(MetaError::Halted);
        }
        Ok(())
    }

    fn halt(&self, err: &MetaError) {
        error!(%err, "metadata store halted after a fatal backend error");
        self.halted.store(true, Ordering::Release);
    }

    fn canonical(&self, clh: Clh) -> Clh {
        if clh.is_null() {
            Clh::discarded(self.hashing.cluster_size, self.hashing.enabled)
        } else {
            clh
        }
    }

    /// `read_cluster` (distilled spec §4.3): scans corks newest-first,
    /// falls back to the page cache/backend.
    pub fn read_cluster(&self, ca: ClusterAddress) -> Result<Clh> {
        self.check_halted()?;
        {
            let corks = self.corks.read();
            for cork in corks.iter().rev() {
                if let Some(clh) = cork.map.get(&ca) {
                    return Ok(self.canonical(*clh));
                }
            }
        }
        let clh = self.get_cluster_location(ca)?;
        Ok(self.canonical(clh))
    }

    /// `write_cluster` (distilled spec §4.3). Must not be called
    /// concurrently by the caller for the same volume (single-writer
    /// invariant held by the data path).
    pub fn write_cluster(&self, ca: ClusterAddress, clh: Clh) -> Result<()> {
        self.check_halted()?;
        let mut corks = self.corks.write();
        let cork = corks
            .back_mut()
            .ok_or_else(|| MetaError::InvalidArgument("write_cluster with no open cork".into()))?;
        let was_present = cork.map.insert(ca, clh).is_some();
        let _ = was_present;
        if clh.is_null() {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.written.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// `discard_cluster` — writes the canonical discarded value.
    pub fn discard_cluster(&self, ca: ClusterAddress) -> Result<()> {
        self.write_cluster(ca, Clh::NULL)
    }

    /// `cork(uuid)`: idempotent if the active cork already has this uuid.
    pub fn cork(&self, uuid: Uuid) {
        let mut corks = self.corks.write();
        if let Some(last) = corks.back() {
            if last.uuid == uuid {
                debug!(%uuid, "cork already active, ignoring duplicate cork() call");
                return;
            }
        }
        corks.push_back(Cork::new(uuid));
    }

    /// `uncork(maybe_uuid)`. Serialized per volume; any backend failure
    /// during the flush or the `cork_uuid` barrier write halts the
    /// volume (SPEC_FULL §7).
    pub fn uncork(&self, maybe_uuid: Option<Uuid>) -> Result<()> {
        self.check_halted()?;
        let _guard = self.single_writer.enter()?;

        let mut corks = self.corks.write();
        if corks.len() < 2 {
            return Err(MetaError::InvalidArgument(
                "uncork requires the next TLog to already be corked".into(),
            ));
        }
        let front_uuid = corks.front().unwrap().uuid;
        if let Some(expected) = maybe_uuid {
            if front_uuid != expected {
                return Err(MetaError::InvalidArgument(format!(
                    "uncork uuid mismatch: expected {expected}, front is {front_uuid}"
                )));
            }
        }
        debug_assert_ne!(
            front_uuid,
            corks.back().unwrap().uuid,
            "front and back cork must differ while uncorking"
        );

        let front = corks.pop_front().unwrap();
        drop(corks);

        // Pages touched by this cork, deduplicated in address order (the
        // cork's map is already a BTreeMap<ClusterAddress, _>, so adjacent
        // clusters land in the same page consecutively). A cork rarely
        // spans more than a handful of pages, so the common case never
        // spills to the heap.
        let mut touched: SmallVec<[PageAddress; 8]> = SmallVec::new();
        {
            let mut table = self.cache.write();
            for (ca, clh) in front.map.iter() {
                let pa = ca.page_address(table.page_capacity);
                self.replay_entry_locked(&mut table, *ca, *clh)?;
                if touched.last() != Some(&pa) {
                    touched.push(pa);
                }
            }
        }

        for pa in touched {
            let result = {
                let mut table = self.cache.write();
                match table.lru.get(&pa) {
                    Some(page) if page.is_dirty() => {
                        let page = page.clone();
                        Some(self.maybe_write_page(&mut table, pa, page))
                    }
                    _ => None,
                }
            };
            if let Some(Err(err)) = result {
                self.halt(&err);
                return Err(err);
            }
        }

        let result = (|| -> Result<()> {
            let _backend_guard = self.backend_lock.lock();
            self.backend.set_cork_uuid(front.uuid, true)
        })();
        if let Err(err) = result {
            self.halt(&err);
            return Err(err);
        }

        *self.cork_uuid_last_durable.lock() = Some(front.uuid);
        Ok(())
    }

    /// Replays one `(CA, CLH)` pair into the page cache with the same
    /// effect a fresh `write_cluster` would have had directly on pages —
    /// used both by `uncork`'s drain step and by
    /// [`crate::store_builder::MetadataStoreBuilder`] to rebuild a store
    /// straight from TLogs, bypassing corks entirely.
    pub(crate) fn replay_into_cache(&self, ca: ClusterAddress, clh: Clh) -> Result<()> {
        let mut table = self.cache.write();
        self.replay_entry_locked(&mut table, ca, clh)
    }

    fn replay_entry_locked(&self, table: &mut PageTable, ca: ClusterAddress, clh: Clh) -> Result<()> {
        let page_capacity = table.page_capacity;
        let pa = ca.page_address(page_capacity);
        self.ensure_page_loaded(table, pa)?;
        let page = table.lru.get_mut(&pa).expect("just loaded");
        page.set(ca.offset_in_page(page_capacity), clh);
        Ok(())
    }

    /// `last_cork()`.
    pub fn last_cork(&self) -> Option<Uuid> {
        *self.cork_uuid_last_durable.lock()
    }

    /// Flushes every dirty page and advances `cork_uuid` directly,
    /// bypassing the cork deque entirely. Used only by
    /// [`crate::store_builder::MetadataStoreBuilder`], which replays TLogs
    /// straight into the cache via [`Self::replay_into_cache`] rather than
    /// through `write_cluster`'s cork protocol — there is no "next" cork to
    /// satisfy `uncork`'s two-corks invariant during an offline rebuild.
    pub(crate) fn commit_rebuild_cork(&self, uuid: Uuid) -> Result<()> {
        self.check_halted()?;
        self.flush_dirty_pages()?;
        let result = (|| -> Result<()> {
            let _backend_guard = self.backend_lock.lock();
            self.backend.set_cork_uuid(uuid, true)
        })();
        if let Err(err) = result {
            self.halt(&err);
            return Err(err);
        }
        *self.cork_uuid_last_durable.lock() = Some(uuid);
        Ok(())
    }

    /// `clear_all_keys()`: drops all corks and cached pages without
    /// writing them, then asks the backend to wipe its keys. Backend
    /// failures here are logged, never propagated (SPEC_FULL §7).
    pub fn clear_all_keys(&self) -> Result<()> {
        {
            let mut corks = self.corks.write();
            corks.clear();
        }
        {
            let mut table = self.cache.write();
            table.lru.clear();
        }
        if let Err(err) = self.backend.clear_all_keys() {
            warn!(%err, "clear_all_keys: backend failed to wipe keys (logged, not propagated)");
        }
        *self.cork_uuid_last_durable.lock() = None;
        *self.scrub_id.write() = None;
        Ok(())
    }

    /// `for_each(functor, ca_max)`: refuses to run while any cork holds
    /// pending writes.
    pub fn for_each(
        &self,
        ca_max: ClusterAddress,
        f: &mut dyn FnMut(ClusterAddress, Clh),
    ) -> Result<()> {
        {
            let corks = self.corks.read();
            if corks.iter().any(|c| !c.map.is_empty()) {
                return Err(MetaError::InvalidArgument(
                    "for_each requires every cork to be empty (fully uncorked)".into(),
                ));
            }
        }
        self.backend.for_each(ca_max, f)
    }

    /// `scrub_id()`.
    pub fn scrub_id(&self) -> Option<Uuid> {
        *self.scrub_id.read()
    }

    /// Pushes a just-applied scrub out to this volume's replicated slaves,
    /// if its backend is replicated and configured to do so eagerly. A
    /// no-op for every other backend variant. See
    /// [`crate::backend::MetadataBackend::replicate_scrub_to_slaves`].
    pub(crate) fn replicate_scrub_to_slaves(&self) -> Result<()> {
        self.backend.replicate_scrub_to_slaves()
    }

    /// `set_scrub_id(id)` — barrier-synchronous, taken under `cache_lock`
    /// then `backend_lock` per the fixed lock order.
    pub fn set_scrub_id(&self, id: Uuid) -> Result<()> {
        self.check_halted()?;
        let _table = self.cache.write();
        let _backend_guard = self.backend_lock.lock();
        match self.backend.set_scrub_id(id, true) {
            Ok(()) => {
                *self.scrub_id.write() = Some(id);
                Ok(())
            }
            Err(err) => {
                self.halt(&err);
                Err(err)
            }
        }
    }

    /// `set_cache_capacity(n)`: flushes and drops everything, then
    /// reallocates the backing cache. Callable online.
    pub fn set_cache_capacity(&self, n: usize) -> Result<()> {
        self.flush_dirty_pages()?;
        let mut table = self.cache.write();
        let page_capacity = table.page_capacity;
        table.lru.clear();
        *table = PageTable::new(n, page_capacity);
        Ok(())
    }

    /// `get_page(CA) -> Vec<CLH>`: the full page containing `ca`, merging
    /// the persisted/cached page with every overlay found in every cork
    /// (later corks override earlier), used by read-ahead paths.
    pub fn get_page(&self, ca: ClusterAddress) -> Result<Vec<Clh>> {
        self.check_halted()?;
        let page_capacity = {
            let table = self.cache.read();
            table.page_capacity
        };
        let pa = ca.page_address(page_capacity);
        let mut entries = {
            let mut table = self.cache.write();
            self.ensure_page_loaded(&mut table, pa)?;
            table.lru.get(&pa).expect("just loaded").entries().to_vec()
        };
        let range_start = pa.first_cluster(page_capacity);
        let range_end = ClusterAddress::new(range_start.0 + page_capacity as u64);
        let corks = self.corks.read();
        for cork in corks.iter() {
            for (&overlay_ca, &clh) in cork.map.range(range_start..range_end) {
                entries[overlay_ca.offset_in_page(page_capacity)] = clh;
            }
        }
        Ok(entries)
    }

    /// Flushes every dirty page to the backend, keeping them in cache
    /// (used by [`crate::scrub::ScrubApplier`] step 4 and available as a
    /// general best-effort `sync`).
    pub fn flush_dirty_pages(&self) -> Result<()> {
        self.check_halted()?;
        let dirty: Vec<PageAddress> = {
            let table = self.cache.read();
            table
                .lru
                .iter()
                .filter(|(_, p)| p.is_dirty())
                .map(|(pa, _)| *pa)
                .collect()
        };
        for pa in dirty {
            let page = {
                let mut table = self.cache.write();
                table.lru.get(&pa).cloned()
            };
            let Some(page) = page else { continue };
            if !page.is_dirty() {
                continue;
            }
            let mut table = self.cache.write();
            self.maybe_write_page(&mut table, pa, page)?;
        }
        Ok(())
    }

    /// Forces the backend to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.flush_dirty_pages()?;
        self.backend.sync()
    }

    /// Copies counters into `stats`, mirroring the source's
    /// `getStats`/`getCorkedClusters` pair.
    pub fn get_stats(&self, stats: &mut Stats) {
        stats.written_clusters = self.counters.written.load(Ordering::Relaxed);
        stats.discarded_clusters = self.counters.discarded.load(Ordering::Relaxed);
        stats.hits = self.counters.hits.load(Ordering::Relaxed);
        stats.misses = self.counters.misses.load(Ordering::Relaxed);
        stats.num_pages = self.cache.read().lru.len() as u64;
        stats.corked_clusters = self
            .corks
            .read()
            .iter()
            .map(|c| (c.uuid, c.map.len() as u64))
            .collect();
    }

    // -- internal: page cache plumbing ------------------------------------

    fn get_cluster_location(&self, ca: ClusterAddress) -> Result<Clh> {
        let page_capacity = {
            let table = self.cache.read();
            table.page_capacity
        };
        let pa = ca.page_address(page_capacity);
        let mut table = self.cache.write();
        let was_cached = table.lru.contains(&pa);
        self.ensure_page_loaded(&mut table, pa)?;
        if was_cached {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        let page = table.lru.get(&pa).expect("just loaded");
        Ok(page.get(ca.offset_in_page(page_capacity)))
    }

    /// Loads `pa` into the cache if absent, evicting the LRU victim first
    /// if at capacity.
    fn ensure_page_loaded(&self, table: &mut PageTable, pa: PageAddress) -> Result<()> {
        if table.lru.get(&pa).is_some() {
            // `get` itself touches the entry, promoting it to MRU.
            return Ok(());
        }
        if table.lru.len() >= table.capacity {
            if let Some((evicted_pa, evicted_page)) = table.lru.pop_lru() {
                if evicted_page.is_dirty() {
                    self.possibly_discard_or_write(evicted_pa, evicted_page)?;
                }
            }
        }
        let loaded = match self.backend.get_page(pa)? {
            Some(page) => page,
            None => Page::new(pa, table.page_capacity),
        };
        table.lru.put(pa, loaded);
        Ok(())
    }

    /// `possibly_discard_page`: an empty dirty page is discarded unless it
    /// still masks a parent page, in which case it must be written as an
    /// empty page instead.
    fn possibly_discard_or_write(&self, pa: PageAddress, mut page: Page) -> Result<()> {
        let masks_parent = page.is_empty() && self.backend.page_exists_in_parent(pa)?;
        let _backend_guard = self.backend_lock.lock();
        let result = if page.is_empty() && !masks_parent {
            self.backend.discard_page(&page, page.used_clusters_delta())
        } else {
            self.backend.put_page(&page, page.used_clusters_delta())
        };
        match result {
            Ok(()) => {
                page.mark_flushed();
                Ok(())
            }
            Err(err) => {
                if self.ignore_flush_errors {
                    warn!(%err, page = %pa, "evicting dirty page: flush failed, ignoring per config");
                    Ok(())
                } else {
                    self.halt(&err);
                    Err(err)
                }
            }
        }
    }

    /// `maybe_write_page`: flushes `page` (already known dirty) while
    /// keeping it resident in `table`.
    fn maybe_write_page(&self, table: &mut PageTable, pa: PageAddress, mut page: Page) -> Result<()> {
        if !page.is_dirty() {
            return Ok(());
        }
        let masks_parent = page.is_empty() && self.backend.page_exists_in_parent(pa)?;
        let result = {
            let _backend_guard = self.backend_lock.lock();
            if page.is_empty() && !masks_parent {
                self.backend.discard_page(&page, page.used_clusters_delta())
            } else {
                self.backend.put_page(&page, page.used_clusters_delta())
            }
        };
        match result {
            Ok(()) => {
                page.mark_flushed();
                if let Some(slot) = table.lru.peek_mut(&pa) {
                    *slot = page;
                }
                Ok(())
            }
            Err(err) => {
                if self.ignore_flush_errors {
                    warn!(%err, page = %pa, "maybe_write_page failed, ignoring per config");
                    Ok(())
                } else {
                    self.halt(&err);
                    Err(err)
                }
            }
        }
    }
}

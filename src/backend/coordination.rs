//! Coordination-service metadata backend: the only variant that is
//! `freezeable()`, and the only one that can have a frozen parent backend to
//! read through to while a clone is still unemancipated.
//!
//! The wire protocol to a real consensus-backed coordination service
//! (etcd/Arakoon-shaped) is out of scope here; [`CoordinationBackend`] keeps
//! an in-memory table instead — making that table consistent across
//! replicas of the service itself is orthogonal to the page/cork semantics
//! this crate owns.

use super::{ForEachFn, MetadataBackend};
use crate::config::BackendConfig;
use crate::error::{MetaError, Result};
use crate::page::Page;
use crate::types::{ClusterAddress, PageAddress};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use uuid::Uuid;

struct Table {
    pages: FxHashMap<u64, Vec<u8>>,
    cork_uuid: Option<Uuid>,
    scrub_id: Option<Uuid>,
    used_clusters: u64,
    emancipated: bool,
}

impl Table {
    fn new() -> Self {
        Self {
            pages: FxHashMap::default(),
            cork_uuid: None,
            scrub_id: None,
            used_clusters: 0,
            emancipated: true,
        }
    }
}

/// Freezeable backend with optional read-through to a frozen parent
/// volume's backend. A clone is created with `parent = Some(...)` and
/// `emancipated = false`; once every page it could ever read through has
/// been copy-on-written locally, the volume manager calls
/// [`CoordinationBackend::emancipate`] and the parent is dropped for good.
pub struct CoordinationBackend {
    table: Mutex<Table>,
    parent: Mutex<Option<Arc<dyn MetadataBackend>>>,
    /// Page addresses known to exist in the parent at attach time, consulted
    /// by `page_exists_in_parent` without a round trip to the parent on
    /// every miss.
    parent_keys: Mutex<FxHashSet<u64>>,
    config: BackendConfig,
    page_capacity: usize,
}

impl CoordinationBackend {
    /// Builds a fresh (non-clone) backend with no parent.
    pub fn new(config: BackendConfig, page_capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table::new()),
            parent: Mutex::new(None),
            parent_keys: Mutex::new(FxHashSet::default()),
            config,
            page_capacity,
        }
    }

    /// Builds a clone backend frozen against `parent`: reads for a page not
    /// yet present locally fall through to `parent`, stamping the fetched
    /// page's clone-id via [`Page::stamp_clone_id`] so overwritten entries
    /// are attributed to this volume's generation.
    pub fn with_frozen_parent(
        config: BackendConfig,
        page_capacity: usize,
        parent: Arc<dyn MetadataBackend>,
    ) -> Result<Self> {
        let mut keys = FxHashSet::default();
        parent.for_each(ClusterAddress::new(u64::MAX), &mut |ca, _clh| {
            keys.insert(ca.page_address(page_capacity).value());
        })?;
        let mut table = Table::new();
        table.emancipated = false;
        Ok(Self {
            table: Mutex::new(table),
            parent: Mutex::new(Some(parent)),
            parent_keys: Mutex::new(keys),
            config,
            page_capacity,
        })
    }

    /// Severs the parent link for good, the terminal step of the two-phase
    /// emancipation protocol. Idempotent. Also reached automatically by
    /// [`Self::forget_parent_key_and_maybe_emancipate`] once every page
    /// that could ever be read through from the parent has been
    /// copy-on-written locally.
    pub fn emancipate(&self) {
        self.parent.lock().take();
        self.table.lock().emancipated = true;
    }

    /// Drops `pa` from the set of pages this clone could still read
    /// through to its parent for, and emancipates once that set is empty:
    /// once no parent page remains relevant, the volume becomes
    /// emancipated and the parent handle is dropped.
    fn forget_parent_key_and_maybe_emancipate(&self, pa: PageAddress) {
        if self.parent.lock().is_none() {
            return;
        }
        let empty = {
            let mut keys = self.parent_keys.lock();
            keys.remove(&pa.value());
            keys.is_empty()
        };
        if empty {
            self.emancipate();
        }
    }
}

impl MetadataBackend for CoordinationBackend {
    fn get_page(&self, pa: PageAddress) -> Result<Option<Page>> {
        {
            let table = self.table.lock();
            if let Some(bytes) = table.pages.get(&pa.value()) {
                return Ok(Some(Page::decode(pa, bytes, self.page_capacity)?));
            }
        }
        let parent = self.parent.lock().clone();
        if let Some(parent) = parent {
            if self.parent_keys.lock().contains(&pa.value()) {
                if let Some(mut page) = parent.get_page(pa)? {
                    page.stamp_clone_id(1);
                    return Ok(Some(page));
                }
            }
        }
        Ok(None)
    }

    fn put_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()> {
        {
            let mut table = self.table.lock();
            table
                .pages
                .insert(page.address().value(), page.encode());
            table.used_clusters = table.used_clusters.saturating_add_signed(used_clusters_delta as i64);
        }
        self.forget_parent_key_and_maybe_emancipate(page.address());
        Ok(())
    }

    fn discard_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()> {
        {
            let mut table = self.table.lock();
            table.pages.remove(&page.address().value());
            table.used_clusters = table.used_clusters.saturating_add_signed(used_clusters_delta as i64);
        }
        self.forget_parent_key_and_maybe_emancipate(page.address());
        Ok(())
    }

    fn page_exists_in_parent(&self, pa: PageAddress) -> Result<bool> {
        Ok(self.parent.lock().is_some() && self.parent_keys.lock().contains(&pa.value()))
    }

    fn get_cork_uuid(&self) -> Result<Option<Uuid>> {
        Ok(self.table.lock().cork_uuid)
    }

    fn set_cork_uuid(&self, uuid: Uuid, _barrier: bool) -> Result<()> {
        self.table.lock().cork_uuid = Some(uuid);
        Ok(())
    }

    fn get_scrub_id(&self) -> Result<Option<Uuid>> {
        Ok(self.table.lock().scrub_id)
    }

    fn set_scrub_id(&self, id: Uuid, _barrier: bool) -> Result<()> {
        self.table.lock().scrub_id = Some(id);
        Ok(())
    }

    fn clear_all_keys(&self) -> Result<()> {
        let mut table = self.table.lock();
        table.pages.clear();
        table.cork_uuid = None;
        table.scrub_id = None;
        table.used_clusters = 0;
        Ok(())
    }

    fn get_used_clusters(&self) -> Result<u64> {
        Ok(self.table.lock().used_clusters)
    }

    fn freezeable(&self) -> bool {
        true
    }

    fn has_frozen_parent(&self) -> bool {
        self.parent.lock().is_some()
    }

    fn is_emancipated(&self) -> bool {
        self.table.lock().emancipated
    }

    fn set_cork_from_frozen_parent(&self, parent: &dyn MetadataBackend) -> Result<()> {
        let uuid = parent.get_cork_uuid()?.ok_or_else(|| {
            MetaError::InvalidArgument("frozen parent has no cork to adopt".into())
        })?;
        self.set_cork_uuid(uuid, true)
    }

    fn for_each(&self, ca_max: ClusterAddress, f: &mut ForEachFn<'_>) -> Result<()> {
        let table = self.table.lock();
        let mut addrs: Vec<u64> = table.pages.keys().copied().collect();
        addrs.sort_unstable();
        for raw in addrs {
            let bytes = &table.pages[&raw];
            let pa = PageAddress::new_unchecked(raw);
            if pa.first_cluster(self.page_capacity).0 >= ca_max.0 {
                continue;
            }
            let page = Page::decode(pa, bytes, self.page_capacity)?;
            for (offset, clh) in page.entries().iter().enumerate() {
                if clh.is_null() {
                    continue;
                }
                let ca = ClusterAddress::new(pa.first_cluster(self.page_capacity).0 + offset as u64);
                if ca.0 < ca_max.0 {
                    f(ca, *clh);
                }
            }
        }
        Ok(())
    }

    fn get_config(&self) -> BackendConfig {
        self.config.clone()
    }
}

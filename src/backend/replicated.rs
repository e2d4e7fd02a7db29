//! Master/slave replicated metadata backend: pages, `cork_uuid`,
//! `scrub_id` and `used_clusters` are served from a remote table reachable
//! over RPC; writes are refused unless the backend's node currently holds
//! the `Master` role.
//!
//! There is no real network transport in this crate; the wire protocol to
//! a coordination/RPC service is out of scope. [`ReplicatedCluster`] stands
//! in for it: an in-process, lock-guarded table shared by every node, with
//! an append-only log each slave drains via [`ReplicatedBackend::catch_up`]
//! — a pull-based replication shape, minus the actual socket.

use crate::config::{BackendConfig, Role};
use crate::error::{MetaError, Result};
use crate::page::Page;
use crate::types::PageAddress;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{ForEachFn, MetadataBackend};

#[derive(Clone, Debug)]
enum LogRecord {
    Put {
        pa: u64,
        bytes: Vec<u8>,
        delta: i32,
    },
    Discard {
        pa: u64,
        delta: i32,
    },
    Cork(Uuid),
    ScrubId(Uuid),
}

struct ReplicaState {
    role: Role,
    pages: FxHashMap<u64, Vec<u8>>,
    cork_uuid: Option<Uuid>,
    scrub_id: Option<Uuid>,
    used_clusters: u64,
    /// Index into the shared log of the next record this node hasn't
    /// applied yet.
    cursor: usize,
}

impl ReplicaState {
    fn new(role: Role) -> Self {
        Self {
            role,
            pages: FxHashMap::default(),
            cork_uuid: None,
            scrub_id: None,
            used_clusters: 0,
            cursor: 0,
        }
    }

    fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::Put { pa, bytes, delta } => {
                self.pages.insert(*pa, bytes.clone());
                self.used_clusters = self.used_clusters.saturating_add_signed(*delta as i64);
            }
            LogRecord::Discard { pa, delta } => {
                self.pages.remove(pa);
                self.used_clusters = self.used_clusters.saturating_add_signed(*delta as i64);
            }
            LogRecord::Cork(uuid) => self.cork_uuid = Some(*uuid),
            LogRecord::ScrubId(uuid) => self.scrub_id = Some(*uuid),
        }
    }
}

/// The in-process stand-in for the remote coordination/RPC service that
/// backs every node's [`ReplicatedBackend`] handle. Tests construct one
/// [`ReplicatedCluster`] and hand out a [`ReplicatedBackend`] per node.
pub struct ReplicatedCluster {
    replicas: Vec<Mutex<ReplicaState>>,
    log: Mutex<Vec<LogRecord>>,
    /// Test hook: when set, every RPC on every node fails with
    /// [`MetaError::BackendUnavailable`], simulating a severed connection.
    /// Transient errors like this must be retried, never treated as data
    /// loss.
    unavailable: AtomicBool,
}

impl ReplicatedCluster {
    /// Builds a cluster with `node_roles.len()` nodes, role `node_roles[i]`
    /// assigned to node `i`. Exactly one node should normally be `Master`.
    pub fn new(node_roles: &[Role]) -> Arc<Self> {
        Arc::new(Self {
            replicas: node_roles
                .iter()
                .map(|r| Mutex::new(ReplicaState::new(*r)))
                .collect(),
            log: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Test-only: toggle simulated connectivity loss.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetaError::BackendUnavailable(
                "replicated cluster unreachable".into(),
            ));
        }
        Ok(())
    }

    fn append(&self, node: usize, record: LogRecord) -> Result<()> {
        self.check_available()?;
        let mut replica = self.replicas[node].lock();
        if replica.role != Role::Master {
            return Err(MetaError::Backend(
                "writes are only permitted on the master replica".into(),
            ));
        }
        replica.apply(&record);
        replica.cursor = {
            let mut log = self.log.lock();
            log.push(record);
            log.len()
        };
        Ok(())
    }

    /// Applies every log record this node hasn't seen yet. Returns the
    /// number of records applied (or that *would be* applied, under
    /// `dry_run`): a replica is only safe to promote once this returns 0.
    pub fn catch_up(&self, node: usize, dry_run: bool) -> Result<u64> {
        self.check_available()?;
        let log = self.log.lock();
        let mut replica = self.replicas[node].lock();
        let pending = &log[replica.cursor..];
        let count = pending.len() as u64;
        if !dry_run {
            for record in pending {
                replica.apply(record);
            }
            replica.cursor = log.len();
        }
        Ok(count)
    }

    /// Eagerly drains every `Slave` replica's catch-up backlog, standing in
    /// for the master pushing its just-written log records over the wire
    /// instead of waiting for each slave to pull on its own schedule.
    pub fn push_to_slaves(&self) -> Result<()> {
        let roles: Vec<Role> = self.replicas.iter().map(|r| r.lock().role).collect();
        for (node, role) in roles.into_iter().enumerate() {
            if role == Role::Slave {
                self.catch_up(node, false)?;
            }
        }
        Ok(())
    }

    /// Promotes `node` to `Master`, demoting every other node to `Slave`.
    /// Drains `catch_up(dry_run=false)` until it reports zero newly-applied
    /// records: the next in line must be caught up to zero lag before its
    /// role is flipped to master. A bounded number of rounds guards against
    /// a log that never quiesces.
    pub fn promote(&self, node: usize) -> Result<()> {
        const MAX_ROUNDS: usize = 64;
        for _ in 0..MAX_ROUNDS {
            if self.catch_up(node, false)? == 0 {
                break;
            }
        }
        if self.catch_up(node, true)? != 0 {
            return Err(MetaError::BackendUnavailable(
                "replica did not reach zero lag after catch-up".into(),
            ));
        }
        for (idx, replica) in self.replicas.iter().enumerate() {
            replica.lock().role = if idx == node {
                Role::Master
            } else {
                Role::Slave
            };
        }
        Ok(())
    }
}

/// One node's handle onto a [`ReplicatedCluster`]. Implements
/// [`MetadataBackend`] directly; a slave refuses every write with
/// [`MetaError::Backend`].
pub struct ReplicatedBackend {
    cluster: Arc<ReplicatedCluster>,
    node: usize,
    config: BackendConfig,
    page_capacity: usize,
}

impl ReplicatedBackend {
    pub fn new(cluster: Arc<ReplicatedCluster>, node: usize, config: BackendConfig) -> Self {
        Self {
            cluster,
            node,
            config,
            page_capacity: crate::types::DEFAULT_PAGE_CAPACITY,
        }
    }

    pub fn with_page_capacity(mut self, page_capacity: usize) -> Self {
        self.page_capacity = page_capacity;
        self
    }

    /// Pulls any TLogs this node's master produced since the last call
    /// and applies them locally. See [`ReplicatedCluster::catch_up`].
    pub fn catch_up(&self, dry_run: bool) -> Result<u64> {
        self.cluster.catch_up(self.node, dry_run)
    }

    /// Promotes this node to master. See [`ReplicatedCluster::promote`].
    pub fn promote_to_master(&self) -> Result<()> {
        self.cluster.promote(self.node)
    }

    fn role(&self) -> Role {
        self.cluster.replicas[self.node].lock().role
    }
}

impl MetadataBackend for ReplicatedBackend {
    fn get_page(&self, pa: PageAddress) -> Result<Option<Page>> {
        self.cluster.check_available()?;
        let replica = self.cluster.replicas[self.node].lock();
        match replica.pages.get(&pa.value()) {
            Some(bytes) => Ok(Some(Page::decode(pa, bytes, self.page_capacity)?)),
            None => Ok(None),
        }
    }

    fn put_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()> {
        let bytes = page.encode();
        self.cluster.append(
            self.node,
            LogRecord::Put {
                pa: page.address().value(),
                bytes,
                delta: used_clusters_delta,
            },
        )
    }

    fn discard_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()> {
        self.cluster.append(
            self.node,
            LogRecord::Discard {
                pa: page.address().value(),
                delta: used_clusters_delta,
            },
        )
    }

    fn get_cork_uuid(&self) -> Result<Option<Uuid>> {
        self.cluster.check_available()?;
        Ok(self.cluster.replicas[self.node].lock().cork_uuid)
    }

    fn set_cork_uuid(&self, uuid: Uuid, _barrier: bool) -> Result<()> {
        self.cluster.append(self.node, LogRecord::Cork(uuid))
    }

    fn get_scrub_id(&self) -> Result<Option<Uuid>> {
        self.cluster.check_available()?;
        Ok(self.cluster.replicas[self.node].lock().scrub_id)
    }

    fn set_scrub_id(&self, id: Uuid, _barrier: bool) -> Result<()> {
        self.cluster.append(self.node, LogRecord::ScrubId(id))
    }

    fn clear_all_keys(&self) -> Result<()> {
        if let Err(err) = (|| -> Result<()> {
            let mut replica = self.cluster.replicas[self.node].lock();
            if replica.role != Role::Master {
                return Err(MetaError::Backend("clear_all_keys requires master".into()));
            }
            replica.pages.clear();
            replica.cork_uuid = None;
            replica.scrub_id = None;
            replica.used_clusters = 0;
            Ok(())
        })() {
            tracing::warn!(error = %err, "clear_all_keys failed on replicated backend");
        }
        Ok(())
    }

    fn get_used_clusters(&self) -> Result<u64> {
        self.cluster.check_available()?;
        Ok(self.cluster.replicas[self.node].lock().used_clusters)
    }

    fn is_emancipated(&self) -> bool {
        true
    }

    fn for_each(&self, ca_max: crate::types::ClusterAddress, f: &mut ForEachFn<'_>) -> Result<()> {
        self.cluster.check_available()?;
        let replica = self.cluster.replicas[self.node].lock();
        let mut addrs: Vec<u64> = replica.pages.keys().copied().collect();
        addrs.sort_unstable();
        for raw in addrs {
            let bytes = &replica.pages[&raw];
            let pa = PageAddress::new_unchecked(raw);
            if pa.first_cluster(self.page_capacity).0 >= ca_max.0 {
                continue;
            }
            let page = Page::decode(pa, bytes, self.page_capacity)?;
            for (offset, clh) in page.entries().iter().enumerate() {
                if clh.is_null() {
                    continue;
                }
                let ca = crate::types::ClusterAddress::new(
                    pa.first_cluster(self.page_capacity).0 + offset as u64,
                );
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

    fn sync(&self) -> Result<()> {
        self.cluster.check_available()
    }

    fn replicate_scrub_to_slaves(&self) -> Result<()> {
        let apply = matches!(
            self.config,
            BackendConfig::Replicated {
                apply_relocations_to_slaves: true,
                ..
            }
        );
        if apply && self.role() == Role::Master {
            self.cluster.push_to_slaves()?;
        }
        Ok(())
    }
}

//! Embedded, single-writer, on-disk `MetadataBackend`. A log-structured
//! local KV: every mutation (page put/discard, cork/scrub-id advance) is
//! appended as one checksummed record to a single file and replayed into an
//! in-memory index on open — a "frame + CRC, replay on open" shape scaled
//! down to the handful of keys this backend actually needs.
//!
//! Bundling a page's bytes and its `used_clusters_delta` into a single
//! record gives "persist the page and update the counter in the same
//! atomic group" for free: either the whole record survived a crash (valid
//! CRC, full length) or it didn't, and a torn tail is simply dropped
//! during replay, exactly like [`crate::scanner::LocalTLogScanner`] drops a
//! torn TLog tail.

use super::MetadataBackend;
use crate::config::{BackendConfig, SyncMode};
use crate::error::{MetaError, Result};
use crate::page::Page;
use crate::primitives::checksum::{Checksum, Crc32Fast};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{ClusterAddress, PageAddress};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

const KIND_PAGE_PUT: u8 = 0;
const KIND_PAGE_DISCARD: u8 = 1;
const KIND_CORK_UUID: u8 = 2;
const KIND_SCRUB_ID: u8 = 3;
const RECORD_HEADER_LEN: usize = 1 + 8 + 4; // kind + key + payload_len
const RECORD_CRC_LEN: usize = 4;

struct Index {
    pages: FxHashMap<u64, u64>, // PageAddress raw -> file offset of the record
    cork_uuid: Option<Uuid>,
    scrub_id: Option<Uuid>,
    used_clusters: u64,
}

/// On-disk, single-writer `MetadataBackend`. Never freezeable, never has a
/// parent.
pub struct EmbeddedBackend {
    io: StdFileIo,
    path: PathBuf,
    append_offset: AtomicU64,
    index: Mutex<Index>,
    page_capacity: usize,
    sync_mode: SyncMode,
    delete_local_on_drop: AtomicBool,
}

impl EmbeddedBackend {
    pub fn open(path: impl AsRef<Path>, page_capacity: usize, sync_mode: SyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io = StdFileIo::open(&path)?;
        let len = io.len()?;
        let (index, append_offset) = replay(&io, len)?;
        Ok(Self {
            io,
            path,
            append_offset: AtomicU64::new(append_offset),
            index: Mutex::new(index),
            page_capacity,
            sync_mode,
            delete_local_on_drop: AtomicBool::new(false),
        })
    }

    fn append_record(&self, kind: u8, key: u64, payload: &[u8]) -> Result<u64> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + RECORD_CRC_LEN);
        buf.push(kind);
        buf.extend_from_slice(&key.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        let mut hasher = Crc32Fast::default();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_be_bytes());

        let offset = self.append_offset.fetch_add(buf.len() as u64, Ordering::AcqRel);
        self.io.write_at(offset, &buf)?;
        Ok(offset)
    }

    /// Honors `sync_mode`/`barrier` unless the `embedded-no-wal` feature is
    /// enabled, in which case every fsync is skipped. Surviving a killed
    /// writer process is the default; this feature opts out of it.
    fn maybe_sync(&self, barrier: bool) -> Result<()> {
        if cfg!(feature = "embedded-no-wal") {
            return Ok(());
        }
        if barrier || matches!(self.sync_mode, SyncMode::Full) {
            self.io.sync_all()?;
        }
        Ok(())
    }

    fn read_record_payload(&self, offset: u64) -> Result<(u8, u64, Vec<u8>)> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        self.io.read_at(offset, &mut header)?;
        let kind = header[0];
        let mut key_bytes = [0u8; 8];
        key_bytes.copy_from_slice(&header[1..9]);
        let key = u64::from_be_bytes(key_bytes);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[9..13]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; payload_len];
        self.io.read_at(offset + RECORD_HEADER_LEN as u64, &mut payload)?;
        Ok((kind, key, payload))
    }
}

impl Drop for EmbeddedBackend {
    fn drop(&mut self) {
        if self.delete_local_on_drop.load(Ordering::Acquire) {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), %err, "failed to remove embedded backend file on drop");
            }
        }
    }
}

impl MetadataBackend for EmbeddedBackend {
    fn get_page(&self, pa: PageAddress) -> Result<Option<Page>> {
        let offset = {
            let index = self.index.lock();
            match index.pages.get(&pa.value()) {
                Some(off) => *off,
                None => return Ok(None),
            }
        };
        let (kind, _key, payload) = self.read_record_payload(offset)?;
        if kind != KIND_PAGE_PUT {
            return Err(MetaError::Corruption(format!(
                "page index pointed at a non-page record for {pa}"
            )));
        }
        let page_bytes = &payload[4..];
        let page = Page::decode(pa, page_bytes, self.page_capacity)?;
        Ok(Some(page))
    }

    fn put_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()> {
        let mut payload = Vec::with_capacity(4 + page.size_bytes());
        payload.extend_from_slice(&used_clusters_delta.to_be_bytes());
        payload.extend_from_slice(&page.encode());
        let offset = self.append_record(KIND_PAGE_PUT, page.address().value(), &payload)?;
        self.maybe_sync(false)?;

        let mut index = self.index.lock();
        index.pages.insert(page.address().value(), offset);
        index.used_clusters = index.used_clusters.saturating_add_signed(used_clusters_delta as i64);
        debug!(page = %page.address(), delta = used_clusters_delta, "embedded backend put_page");
        Ok(())
    }

    fn discard_page(&self, page: &Page, used_clusters_delta: i32) -> Result<()> {
        let payload = used_clusters_delta.to_be_bytes();
        self.append_record(KIND_PAGE_DISCARD, page.address().value(), &payload)?;
        self.maybe_sync(false)?;

        let mut index = self.index.lock();
        // A missing key is not an error: the page may never have been put.
        index.pages.remove(&page.address().value());
        index.used_clusters = index.used_clusters.saturating_add_signed(used_clusters_delta as i64);
        Ok(())
    }

    fn get_cork_uuid(&self) -> Result<Option<Uuid>> {
        Ok(self.index.lock().cork_uuid)
    }

    fn set_cork_uuid(&self, uuid: Uuid, barrier: bool) -> Result<()> {
        self.append_record(KIND_CORK_UUID, 0, uuid.as_bytes())?;
        self.maybe_sync(barrier)?;
        self.index.lock().cork_uuid = Some(uuid);
        Ok(())
    }

    fn get_scrub_id(&self) -> Result<Option<Uuid>> {
        Ok(self.index.lock().scrub_id)
    }

    fn set_scrub_id(&self, id: Uuid, barrier: bool) -> Result<()> {
        self.append_record(KIND_SCRUB_ID, 0, id.as_bytes())?;
        self.maybe_sync(barrier)?;
        self.index.lock().scrub_id = Some(id);
        Ok(())
    }

    fn clear_all_keys(&self) -> Result<()> {
        self.io.truncate(0)?;
        self.append_offset.store(0, Ordering::Release);
        let mut index = self.index.lock();
        index.pages.clear();
        index.cork_uuid = None;
        index.scrub_id = None;
        index.used_clusters = 0;
        Ok(())
    }

    fn get_used_clusters(&self) -> Result<u64> {
        Ok(self.index.lock().used_clusters)
    }

    fn for_each(&self, ca_max: ClusterAddress, f: &mut super::ForEachFn<'_>) -> Result<()> {
        let mut addrs: Vec<u64> = self.index.lock().pages.keys().copied().collect();
        addrs.sort_unstable();
        for raw in addrs {
            let pa = PageAddress::new_unchecked(raw);
            if pa.first_cluster(self.page_capacity).0 >= ca_max.0 {
                continue;
            }
            if let Some(page) = self.get_page(pa)? {
                for (offset, entry) in page.entries().iter().enumerate() {
                    if entry.is_null() {
                        continue;
                    }
                    let ca = ClusterAddress::new(pa.first_cluster(self.page_capacity).0 + offset as u64);
                    if ca.0 < ca_max.0 {
                        f(ca, *entry);
                    }
                }
            }
        }
        Ok(())
    }

    fn get_config(&self) -> BackendConfig {
        BackendConfig::Embedded {
            path: self.path.clone(),
            page_capacity: self.page_capacity,
            sync: self.sync_mode,
        }
    }

    fn mark_delete_local_artifacts_on_drop(&self) {
        self.delete_local_on_drop.store(true, Ordering::Release);
    }

    fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}

/// Replays every record from the start of the file, rebuilding the
/// in-memory index. Stops at the first truncated or checksum-mismatched
/// record and treats everything from there on as unwritten, the same
/// tolerant-tail-trim policy [`crate::scanner::LocalTLogScanner`] applies
/// to TLogs.
fn replay(io: &StdFileIo, len: u64) -> Result<(Index, u64)> {
    let mut index = Index {
        pages: FxHashMap::default(),
        cork_uuid: None,
        scrub_id: None,
        used_clusters: 0,
    };
    let mut offset = 0u64;
    while offset + (RECORD_HEADER_LEN as u64) <= len {
        let mut header = [0u8; RECORD_HEADER_LEN];
        if io.read_at(offset, &mut header).is_err() {
            break;
        }
        let kind = header[0];
        let mut key_bytes = [0u8; 8];
        key_bytes.copy_from_slice(&header[1..9]);
        let key = u64::from_be_bytes(key_bytes);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[9..13]);
        let payload_len = u32::from_be_bytes(len_bytes) as u64;
        let record_len = RECORD_HEADER_LEN as u64 + payload_len + RECORD_CRC_LEN as u64;
        if offset + record_len > len {
            warn!(offset, "embedded backend log truncated mid-record, stopping replay");
            break;
        }
        let mut payload = vec![0u8; payload_len as usize];
        io.read_at(offset + RECORD_HEADER_LEN as u64, &mut payload)?;
        let mut crc_bytes = [0u8; 4];
        io.read_at(offset + RECORD_HEADER_LEN as u64 + payload_len, &mut crc_bytes)?;
        let expected_crc = u32::from_be_bytes(crc_bytes);

        let mut hasher = Crc32Fast::default();
        hasher.update(&header);
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            warn!(offset, "embedded backend log record crc mismatch, stopping replay");
            break;
        }

        match kind {
            KIND_PAGE_PUT => {
                let mut delta_bytes = [0u8; 4];
                delta_bytes.copy_from_slice(&payload[0..4]);
                let delta = i32::from_be_bytes(delta_bytes);
                index.pages.insert(key, offset);
                index.used_clusters = index.used_clusters.saturating_add_signed(delta as i64);
            }
            KIND_PAGE_DISCARD => {
                let mut delta_bytes = [0u8; 4];
                delta_bytes.copy_from_slice(&payload[0..4]);
                let delta = i32::from_be_bytes(delta_bytes);
                index.pages.remove(&key);
                index.used_clusters = index.used_clusters.saturating_add_signed(delta as i64);
            }
            KIND_CORK_UUID => {
                index.cork_uuid = Some(Uuid::from_slice(&payload).map_err(|e| {
                    MetaError::Corruption(format!("cork uuid record malformed: {e}"))
                })?);
            }
            KIND_SCRUB_ID => {
                index.scrub_id = Some(Uuid::from_slice(&payload).map_err(|e| {
                    MetaError::Corruption(format!("scrub id record malformed: {e}"))
                })?);
            }
            other => {
                warn!(kind = other, "embedded backend log unknown record kind, stopping replay");
                break;
            }
        }
        offset += record_len;
    }
    Ok((index, offset))
}

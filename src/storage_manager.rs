//! The storage-manager boundary (SPEC_FULL §6.2). The real single-node
//! storage manager (volume/page allocation, WAL, latch/lock manager, B+tree
//! physical ops) is an external collaborator out of this crate's scope; we
//! model the narrow interface the core depends on as the `StorageManager`
//! trait, and ship `MemStorageManager`, an in-memory reference
//! implementation sufficient to exercise every core contract in tests and
//! the demo shell. A real deployment would back the trait with an on-disk
//! engine instead.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::error::{CoreError, CoreResult};
use crate::page::PagePool;

pub type XctId = u64;
pub type StoreId = u64;

/// Record identifier assigned by the storage manager after a successful
/// `create_rec`/`append_rec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid {
    pub page_no: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// The narrow set of storage-manager operations the table/index manager and
/// the Session/Flusher depend on (SPEC_FULL §6.2). Error returns are opaque
/// status codes the core classifies as retryable (deadlock-like) or fatal
/// via `CoreError::Retryable`/other variants.
pub trait StorageManager: Send + Sync {
    fn begin_xct(&self) -> XctId;
    fn commit_xct(&self, xct: XctId) -> CoreResult<()>;
    fn abort_xct(&self, xct: XctId) -> CoreResult<()>;
    /// Commits `xct` and begins a new transaction inheriting its held
    /// locks, used by bulk loaders that commit periodically without
    /// dropping latches on the file they are loading.
    fn chain_xct(&self, xct: XctId) -> CoreResult<XctId>;

    fn create_file(&self, name: &str, record_width: usize) -> CoreResult<StoreId>;
    fn create_index(&self, name: &str) -> CoreResult<StoreId>;

    fn create_rec(&self, xct: XctId, file: StoreId, data: &[u8]) -> CoreResult<Rid>;
    fn append_rec(&self, xct: XctId, file: StoreId, data: &[u8]) -> CoreResult<Rid>;
    fn update_rec(&self, xct: XctId, rid: Rid, data: &[u8]) -> CoreResult<()>;
    fn destroy_rec(&self, xct: XctId, rid: Rid) -> CoreResult<()>;

    fn find_assoc(&self, xct: XctId, index: StoreId, key: &[u8]) -> CoreResult<Option<Rid>>;
    fn create_assoc(&self, xct: XctId, index: StoreId, key: &[u8], rid: Rid) -> CoreResult<()>;
    fn destroy_assoc(&self, xct: XctId, index: StoreId, key: &[u8], rid: Rid) -> CoreResult<()>;

    fn pin(&self, xct: XctId, rid: Rid, mode: LockMode) -> CoreResult<Vec<u8>>;
    fn unpin(&self, xct: XctId, rid: Rid) -> CoreResult<()>;

    fn scan_file_i(&self, xct: XctId, file: StoreId) -> CoreResult<Vec<(Rid, Vec<u8>)>>;
    fn scan_index_i(&self, xct: XctId, index: StoreId, lo: &[u8], hi: &[u8]) -> CoreResult<Vec<(Vec<u8>, Rid)>>;

    fn flushlog(&self) -> CoreResult<()>;
    fn last_sync_gsn(&self) -> u64;
    fn my_last_gsn(&self, xct: XctId) -> u64;
}

struct HeapStore {
    pool: PagePool,
    current_page: Mutex<Option<usize>>,
    deleted: Mutex<HashSet<Rid>>,
    record_width: usize,
}

impl HeapStore {
    fn new(record_width: usize) -> Self {
        // each slot carries a 4-byte logical-length prefix ahead of the
        // record_width-wide payload area.
        HeapStore {
            pool: PagePool::new(4 + record_width),
            current_page: Mutex::new(None),
            deleted: Mutex::new(HashSet::new()),
            record_width,
        }
    }

    fn insert(&self, data: &[u8]) -> CoreResult<Rid> {
        if data.len() > self.record_width {
            return Err(CoreError::OutOfRange);
        }
        let mut cur = self.current_page.lock().unwrap();
        let page_no = match *cur {
            Some(pn) if !self.pool.with_page(pn, |p| p.is_full()) => pn,
            _ => {
                let pn = self.pool.alloc();
                *cur = Some(pn);
                pn
            }
        };
        let mut packed = vec![0u8; 4 + self.record_width];
        packed[0..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
        packed[4..4 + data.len()].copy_from_slice(data);
        let slot = self.pool.with_page_mut(page_no, |p| p.append_tuple(&packed))?;
        Ok(Rid { page_no, slot })
    }

    fn read(&self, rid: Rid) -> CoreResult<Vec<u8>> {
        if self.deleted.lock().unwrap().contains(&rid) {
            return Err(CoreError::TupleNotFound);
        }
        self.pool.with_page(rid.page_no, |p| {
            let t = p.get_tuple(rid.slot)?;
            let bytes = t.bytes();
            let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
            Ok(bytes[4..4 + len].to_vec())
        })
    }

    fn update(&self, rid: Rid, data: &[u8]) -> CoreResult<()> {
        if data.len() > self.record_width {
            return Err(CoreError::OutOfRange);
        }
        if self.deleted.lock().unwrap().contains(&rid) {
            return Err(CoreError::TupleNotFound);
        }
        self.pool.with_page_mut(rid.page_no, |p| {
            let mut t = p.get_tuple_mut(rid.slot)?;
            let buf = t.bytes_mut();
            buf[0..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
            for b in buf[4..].iter_mut() {
                *b = 0;
            }
            buf[4..4 + data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    fn delete(&self, rid: Rid) -> CoreResult<()> {
        let mut del = self.deleted.lock().unwrap();
        if !del.insert(rid) {
            return Err(CoreError::TupleNotFound);
        }
        Ok(())
    }

    fn scan(&self) -> Vec<(Rid, Vec<u8>)> {
        let del = self.deleted.lock().unwrap();
        let mut out = Vec::new();
        for page_no in 0..self.pool.page_count() {
            self.pool.with_page(page_no, |p| {
                for (slot, t) in p.iter().enumerate() {
                    let rid = Rid { page_no, slot };
                    if del.contains(&rid) {
                        continue;
                    }
                    let bytes = t.bytes();
                    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
                    out.push((rid, bytes[4..4 + len].to_vec()));
                }
            });
        }
        out
    }
}

struct IndexStore {
    map: Mutex<BTreeMap<Vec<u8>, Vec<Rid>>>,
}

impl IndexStore {
    fn new() -> Self {
        IndexStore { map: Mutex::new(BTreeMap::new()) }
    }
}

enum Store {
    Heap(HeapStore),
    Index(IndexStore),
}

/// In-memory reference implementation of the `StorageManager` boundary.
/// Heap files are stored in `PagePool`-backed slabs; indexes are backed by
/// `BTreeMap`s standing in for physical B+tree stores.
pub struct MemStorageManager {
    stores: Mutex<HashMap<StoreId, Store>>,
    next_store_id: AtomicU64,
    next_xct: AtomicU64,
    next_gsn: AtomicU64,
    durable_gsn: AtomicU64,
    xct_gsn: Mutex<HashMap<XctId, u64>>,
    io_delay: AtomicBool,
}

impl Default for MemStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorageManager {
    pub fn new() -> Self {
        MemStorageManager {
            stores: Mutex::new(HashMap::new()),
            next_store_id: AtomicU64::new(1),
            next_xct: AtomicU64::new(1),
            next_gsn: AtomicU64::new(0),
            durable_gsn: AtomicU64::new(0),
            xct_gsn: Mutex::new(HashMap::new()),
            io_delay: AtomicBool::new(false),
        }
    }

    /// Enables/disables the synthetic I/O latency the shell's `IODELAY`
    /// command toggles (SPEC_FULL §6.1).
    pub fn set_io_delay(&self, enabled: bool) {
        self.io_delay.store(enabled, Ordering::Relaxed);
    }

    /// Sleeps a jittered amount to stand in for real disk latency when
    /// `IODELAY on` is active, rather than a fixed delay every caller would
    /// otherwise pile up on in lockstep.
    fn maybe_delay(&self) {
        if self.io_delay.load(Ordering::Relaxed) {
            let micros = rand::thread_rng().gen_range(100, 300);
            std::thread::sleep(Duration::from_micros(micros));
        }
    }

    fn with_heap<R>(&self, file: StoreId, f: impl FnOnce(&HeapStore) -> CoreResult<R>) -> CoreResult<R> {
        let stores = self.stores.lock().unwrap();
        match stores.get(&file) {
            Some(Store::Heap(h)) => f(h),
            Some(Store::Index(_)) => Err(CoreError::OpenScanError(format!("store {} is an index, not a heap", file))),
            None => Err(CoreError::OpenScanError(format!("no such store {}", file))),
        }
    }

    fn with_index<R>(&self, index: StoreId, f: impl FnOnce(&IndexStore) -> CoreResult<R>) -> CoreResult<R> {
        let stores = self.stores.lock().unwrap();
        match stores.get(&index) {
            Some(Store::Index(ix)) => f(ix),
            Some(Store::Heap(_)) => Err(CoreError::IndexNotFound(format!("store {} is a heap, not an index", index))),
            None => Err(CoreError::IndexNotFound(format!("no such store {}", index))),
        }
    }
}

impl StorageManager for MemStorageManager {
    fn begin_xct(&self) -> XctId {
        self.next_xct.fetch_add(1, Ordering::SeqCst)
    }

    fn commit_xct(&self, xct: XctId) -> CoreResult<()> {
        let gsn = self.next_gsn.fetch_add(1, Ordering::SeqCst) + 1;
        self.xct_gsn.lock().unwrap().insert(xct, gsn);
        Ok(())
    }

    fn abort_xct(&self, _xct: XctId) -> CoreResult<()> {
        Ok(())
    }

    fn chain_xct(&self, xct: XctId) -> CoreResult<XctId> {
        self.commit_xct(xct)?;
        Ok(self.begin_xct())
    }

    fn create_file(&self, _name: &str, record_width: usize) -> CoreResult<StoreId> {
        let id = self.next_store_id.fetch_add(1, Ordering::SeqCst);
        self.stores.lock().unwrap().insert(id, Store::Heap(HeapStore::new(record_width)));
        Ok(id)
    }

    fn create_index(&self, _name: &str) -> CoreResult<StoreId> {
        let id = self.next_store_id.fetch_add(1, Ordering::SeqCst);
        self.stores.lock().unwrap().insert(id, Store::Index(IndexStore::new()));
        Ok(id)
    }

    fn create_rec(&self, _xct: XctId, file: StoreId, data: &[u8]) -> CoreResult<Rid> {
        self.maybe_delay();
        self.with_heap(file, |h| h.insert(data))
    }

    fn append_rec(&self, xct: XctId, file: StoreId, data: &[u8]) -> CoreResult<Rid> {
        self.create_rec(xct, file, data)
    }

    fn update_rec(&self, _xct: XctId, rid: Rid, data: &[u8]) -> CoreResult<()> {
        self.maybe_delay();
        // rid does not carry its owning store id; find it by scanning
        // stores. The reference implementation only ever has a handful of
        // stores open at once so this is acceptable for tests.
        let stores = self.stores.lock().unwrap();
        for store in stores.values() {
            if let Store::Heap(h) = store {
                if h.pool.with_page(rid.page_no, |p| rid.slot < p.tuple_count()).unwrap_or(false) {
                    return h.update(rid, data);
                }
            }
        }
        Err(CoreError::NoCurrentTuple)
    }

    fn destroy_rec(&self, _xct: XctId, rid: Rid) -> CoreResult<()> {
        let stores = self.stores.lock().unwrap();
        for store in stores.values() {
            if let Store::Heap(h) = store {
                if h.pool.with_page(rid.page_no, |p| rid.slot < p.tuple_count()).unwrap_or(false) {
                    return h.delete(rid);
                }
            }
        }
        Err(CoreError::NoCurrentTuple)
    }

    fn find_assoc(&self, _xct: XctId, index: StoreId, key: &[u8]) -> CoreResult<Option<Rid>> {
        self.maybe_delay();
        self.with_index(index, |ix| Ok(ix.map.lock().unwrap().get(key).and_then(|v| v.first().copied())))
    }

    fn create_assoc(&self, _xct: XctId, index: StoreId, key: &[u8], rid: Rid) -> CoreResult<()> {
        self.with_index(index, |ix| {
            ix.map.lock().unwrap().entry(key.to_vec()).or_default().push(rid);
            Ok(())
        })
    }

    fn destroy_assoc(&self, _xct: XctId, index: StoreId, key: &[u8], rid: Rid) -> CoreResult<()> {
        self.with_index(index, |ix| {
            let mut map = ix.map.lock().unwrap();
            match map.get_mut(key) {
                Some(rids) => {
                    let before = rids.len();
                    rids.retain(|r| *r != rid);
                    if rids.is_empty() {
                        map.remove(key);
                    }
                    if rids.len() == before && before == 0 {
                        return Err(CoreError::InconsistentIndex("destroy_assoc: key not found".to_string()));
                    }
                    Ok(())
                }
                None => Err(CoreError::InconsistentIndex("destroy_assoc: key not found".to_string())),
            }
        })
    }

    fn pin(&self, _xct: XctId, rid: Rid, _mode: LockMode) -> CoreResult<Vec<u8>> {
        self.maybe_delay();
        let stores = self.stores.lock().unwrap();
        for store in stores.values() {
            if let Store::Heap(h) = store {
                if h.pool.with_page(rid.page_no, |p| rid.slot < p.tuple_count()).unwrap_or(false) {
                    return h.read(rid);
                }
            }
        }
        Err(CoreError::TupleNotFound)
    }

    fn unpin(&self, _xct: XctId, _rid: Rid) -> CoreResult<()> {
        Ok(())
    }

    fn scan_file_i(&self, _xct: XctId, file: StoreId) -> CoreResult<Vec<(Rid, Vec<u8>)>> {
        self.with_heap(file, |h| Ok(h.scan()))
    }

    fn scan_index_i(&self, _xct: XctId, index: StoreId, lo: &[u8], hi: &[u8]) -> CoreResult<Vec<(Vec<u8>, Rid)>> {
        self.with_index(index, |ix| {
            let map = ix.map.lock().unwrap();
            let mut out = Vec::new();
            for (k, rids) in map.range(lo.to_vec()..=hi.to_vec()) {
                for rid in rids {
                    out.push((k.clone(), *rid));
                }
            }
            Ok(out)
        })
    }

    fn flushlog(&self) -> CoreResult<()> {
        let target = self.next_gsn.load(Ordering::SeqCst);
        self.durable_gsn.fetch_max(target, Ordering::SeqCst);
        Ok(())
    }

    fn last_sync_gsn(&self) -> u64 {
        self.durable_gsn.load(Ordering::SeqCst)
    }

    fn my_last_gsn(&self, xct: XctId) -> u64 {
        *self.xct_gsn.lock().unwrap().get(&xct).unwrap_or(&0)
    }
}

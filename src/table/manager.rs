//! The table & index manager (SPEC_FULL §4.3): owns a table's schema and
//! composes the record codec with the `StorageManager` boundary to
//! implement `add`/`update`/`delete`/`index_probe`/`scan`/`bulk_load`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use log::{debug, warn};

use crate::bulk::loader::{parse_line, DEFAULT_DELIMITER};
use crate::codec::{format, format_key, load};
use crate::codec::row::Row;
use crate::error::{CoreError, CoreResult};
use crate::storage_manager::{LockMode, Rid, StorageManager, StoreId, XctId};
use crate::table::cache::TupleCache;
use crate::table::descriptor::TableDescriptor;

/// Owns a table's descriptor plus the physical store ids (one heap, one per
/// index) the `StorageManager` allocated for it.
pub struct TableManager {
    desc: Arc<TableDescriptor>,
    sm: Arc<dyn StorageManager>,
    heap_file: StoreId,
    index_stores: Vec<StoreId>,
    cache: TupleCache,
}

/// One item of a base-heap file scan.
pub struct ScanItem {
    pub rid: Rid,
    pub row: CoreResult<Row>,
}

/// One item of an index-range scan.
pub struct IndexScanItem {
    pub key: Vec<u8>,
    pub rid: Rid,
    /// Populated only when the scan was opened with `need_full_row`.
    pub row: Option<CoreResult<Row>>,
}

impl TableManager {
    /// Registers `desc`'s heap file and every one of its indexes with the
    /// storage manager, then wraps the (now immutable) descriptor in an
    /// `Arc` shared by every row the manager hands out.
    pub fn create(desc: TableDescriptor, sm: Arc<dyn StorageManager>) -> CoreResult<TableManager> {
        let heap_file = sm.create_file(&desc.name, desc.max_record_size())?;
        let mut index_stores = Vec::with_capacity(desc.indexes.len());
        for idx in &desc.indexes {
            let store_name = format!("{}.{}", desc.name, idx.name);
            index_stores.push(sm.create_index(&store_name)?);
        }
        let desc = Arc::new(desc);
        let cache = TupleCache::new(desc.clone());
        Ok(TableManager { desc, sm, heap_file, index_stores, cache })
    }

    pub fn desc(&self) -> &Arc<TableDescriptor> {
        &self.desc
    }

    pub fn cache(&self) -> &TupleCache {
        &self.cache
    }

    /// Borrows a blank row shell from this table's tuple cache.
    pub fn new_row(&self) -> Row {
        self.cache.borrow()
    }

    /// Returns a row to this table's tuple cache once its transaction is
    /// done with it.
    pub fn recycle_row(&self, row: Row) {
        self.cache.give_back(row);
    }

    /// `add_tuple` (SPEC_FULL §4.3): formats the row, creates the heap
    /// record, then inserts a (key, rid) assoc into every secondary index.
    /// On any storage-manager error the caller's transaction must abort;
    /// this manager does not roll back the partial index updates itself.
    pub fn add_tuple(&self, xct: XctId, row: &mut Row) -> CoreResult<()> {
        let buf = format(row)?;
        let rid = self.sm.create_rec(xct, self.heap_file, &buf)?;
        row.rid = Some(rid);
        for (idx, &store) in self.desc.indexes.iter().zip(self.index_stores.iter()) {
            let key = format_key(&self.desc, idx, row)?;
            self.sm.create_assoc(xct, store, &key, rid)?;
        }
        Ok(())
    }

    /// `update_tuple`: pins the record exclusively, reformats it, and
    /// overwrites it in place. Index keys are never touched here — schemas
    /// used by this crate disallow key updates (callers needing to change a
    /// key perform delete+insert).
    pub fn update_tuple(&self, xct: XctId, row: &Row) -> CoreResult<()> {
        let rid = row.rid.ok_or(CoreError::NoCurrentTuple)?;
        self.sm.pin(xct, rid, LockMode::Exclusive)?;
        let buf = format(row)?;
        self.sm.update_rec(xct, rid, &buf)?;
        self.sm.unpin(xct, rid)?;
        Ok(())
    }

    /// `delete_tuple`: destroys the heap record, then removes the matching
    /// assoc from every index. On success, clears `row.rid`.
    pub fn delete_tuple(&self, xct: XctId, row: &mut Row) -> CoreResult<()> {
        let rid = row.rid.ok_or(CoreError::NoCurrentTuple)?;
        self.sm.destroy_rec(xct, rid)?;
        for (idx, &store) in self.desc.indexes.iter().zip(self.index_stores.iter()) {
            let key = format_key(&self.desc, idx, row)?;
            self.sm.destroy_assoc(xct, store, &key, rid)?;
        }
        row.rid = None;
        Ok(())
    }

    /// `index_probe`: formats the key, finds the assoc, pins the heap
    /// record in `mode`, and loads it. `TupleNotFound` if the index has no
    /// such entry; `WrongDiskData` if `load` rejects the bytes.
    pub fn index_probe(&self, xct: XctId, index_pos: usize, row: &Row, mode: LockMode) -> CoreResult<Row> {
        let idx = self
            .desc
            .indexes
            .get(index_pos)
            .ok_or_else(|| CoreError::IndexNotFound(format!("no index at position {}", index_pos)))?;
        let store = self.index_stores[index_pos];
        let key = format_key(&self.desc, idx, row)?;
        let rid = self.sm.find_assoc(xct, store, &key)?.ok_or(CoreError::TupleNotFound)?;
        let bytes = self.sm.pin(xct, rid, mode)?;
        let mut loaded = load(&self.desc, &bytes)?;
        loaded.rid = Some(rid);
        Ok(loaded)
    }

    pub fn probe_primary(&self, xct: XctId, row: &Row, mode: LockMode) -> CoreResult<Row> {
        let pos = self
            .desc
            .primary_index_pos()
            .ok_or_else(|| CoreError::IndexNotFound(format!("table {} has no primary index", self.desc.name)))?;
        self.index_probe(xct, pos, row, mode)
    }

    /// `file_scan`: a finite, non-restartable sequence over every live
    /// heap record.
    pub fn file_scan(&self, xct: XctId) -> CoreResult<Vec<ScanItem>> {
        let raw = self.sm.scan_file_i(xct, self.heap_file)?;
        Ok(raw
            .into_iter()
            .map(|(rid, bytes)| {
                let row = load(&self.desc, &bytes).map(|mut r| {
                    r.rid = Some(rid);
                    r
                });
                ScanItem { rid, row }
            })
            .collect())
    }

    /// `index_scan`: an ordered range scan `[lo, hi]` over `index_pos`,
    /// optionally fetching and loading each matching heap record.
    pub fn index_scan(
        &self,
        xct: XctId,
        index_pos: usize,
        lo: &[u8],
        hi: &[u8],
        need_full_row: bool,
    ) -> CoreResult<Vec<IndexScanItem>> {
        let store = *self
            .index_stores
            .get(index_pos)
            .ok_or_else(|| CoreError::IndexNotFound(format!("no index at position {}", index_pos)))?;
        let raw = self.sm.scan_index_i(xct, store, lo, hi)?;
        let mut out = Vec::with_capacity(raw.len());
        for (key, rid) in raw {
            let row = if need_full_row {
                let loaded = self.sm.pin(xct, rid, LockMode::Shared).and_then(|bytes| {
                    let mut r = load(&self.desc, &bytes)?;
                    r.rid = Some(rid);
                    Ok(r)
                });
                Some(loaded)
            } else {
                None
            };
            out.push(IndexScanItem { key, rid, row });
        }
        Ok(out)
    }

    /// `bulk_load_index`: opens a file scan of the base heap, inserts a
    /// (key, rid) assoc into the already-created index store for each row,
    /// committing in groups of `group_size` and chaining to a fresh
    /// transaction after each commit so latches are dropped periodically.
    pub fn bulk_load_index(&self, index_pos: usize, group_size: usize) -> CoreResult<usize> {
        let idx = self
            .desc
            .indexes
            .get(index_pos)
            .ok_or_else(|| CoreError::IndexNotFound(format!("no index at position {}", index_pos)))?;
        let store = self.index_stores[index_pos];

        let mut xct = self.sm.begin_xct();
        let scanned = self.sm.scan_file_i(xct, self.heap_file)?;
        let mut loaded = 0usize;
        for (rid, bytes) in scanned {
            let mut row = load(&self.desc, &bytes)?;
            row.rid = Some(rid);
            let key = format_key(&self.desc, idx, &row)?;
            self.sm.create_assoc(xct, store, &key, rid)?;
            loaded += 1;
            if group_size > 0 && loaded % group_size == 0 {
                xct = self.sm.chain_xct(xct)?;
            }
        }
        self.sm.commit_xct(xct)?;
        debug!("bulk-loaded index {} with {} entries", idx.name, loaded);
        Ok(loaded)
    }

    /// `bulk_load_all_indexes`: sequentially bulk-loads each index in
    /// schema order, aborting the whole load on the first error.
    pub fn bulk_load_all_indexes(&self, group_size: usize) -> CoreResult<()> {
        for pos in 0..self.desc.indexes.len() {
            self.bulk_load_index(pos, group_size).map_err(|e| {
                CoreError::ErrorInIndexLoad(format!("index {}: {}", self.desc.indexes[pos].name, e))
            })?;
        }
        Ok(())
    }

    /// `load_from_file`: parses one line per tuple with the pipe-delimited
    /// parser of SPEC_FULL §6.3, appends to the heap in groups, commits
    /// periodically, then bulk-loads every index. Returns the row count.
    pub fn load_from_file(&self, path: &str, group_size: usize, line_limit: usize) -> CoreResult<usize> {
        let file = File::open(path).map_err(|e| CoreError::FileException(e.to_string()))?;
        let reader = BufReader::new(file);

        let mut xct = self.sm.begin_xct();
        let mut loaded = 0usize;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| CoreError::FileException(e.to_string()))?;
            if line.is_empty() {
                continue;
            }
            let mut row = parse_line(&line, &self.desc, DEFAULT_DELIMITER, line_limit).map_err(|e| {
                CoreError::WrongDiskData(format!("{} line {}: {}", path, lineno + 1, e))
            })?;
            let buf = format(&row)?;
            let rid = self.sm.append_rec(xct, self.heap_file, &buf)?;
            row.rid = Some(rid);
            loaded += 1;
            if group_size > 0 && loaded % group_size == 0 {
                xct = self.sm.chain_xct(xct)?;
            }
        }
        self.sm.commit_xct(xct)?;

        self.bulk_load_all_indexes(group_size)?;
        debug!("loaded {} rows into {} from {}", loaded, self.desc.name, path);
        Ok(loaded)
    }

    /// `check_all_indexes`: true iff every index maps every base-heap
    /// record's key to exactly that record's rid.
    pub fn check_all_indexes(&self) -> CoreResult<bool> {
        let xct = self.sm.begin_xct();
        let rows = self.sm.scan_file_i(xct, self.heap_file)?;
        for (idx_pos, idx) in self.desc.indexes.iter().enumerate() {
            let store = self.index_stores[idx_pos];
            for (rid, bytes) in &rows {
                let mut row = load(&self.desc, bytes)?;
                row.rid = Some(*rid);
                let key = format_key(&self.desc, idx, &row)?;
                match self.sm.find_assoc(xct, store, &key)? {
                    Some(found) if found == *rid => {}
                    Some(_other) => {
                        warn!("index {} maps key {} to a different rid than the heap record", idx.name, hex::encode(&key));
                        self.sm.abort_xct(xct).ok();
                        return Ok(false);
                    }
                    None => {
                        warn!("index {} is missing an entry for key {}", idx.name, hex::encode(&key));
                        self.sm.abort_xct(xct).ok();
                        return Ok(false);
                    }
                }
            }
        }
        self.sm.commit_xct(xct)?;
        Ok(true)
    }
}

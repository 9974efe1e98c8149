//! `Page` and `PagePool`: the fixed-size tuple slab at the bottom of the
//! tuple/page/record substrate (SPEC_FULL §4.1). A `Page` holds up to
//! `capacity` tuples of one fixed `tuple_size`, appended densely and never
//! reshuffled. A `PagePool` is a slab allocator handing out pages of one
//! tuple size, recycling freed pages through a singly-linked free list
//! threaded through each page's `next` slot.

use std::convert::TryInto;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// On-disk header layout: 6 machine words (pool pointer, tuple_size,
/// capacity, free_count, end_offset, next pointer), each serialized as a
/// little-endian `u64` (SPEC_FULL §6.3).
const HEADER_SLOTS: usize = 6;
const HEADER_BYTES: usize = HEADER_SLOTS * 8;

/// A non-owning (data pointer, size) view into a page's tuple area. Two
/// tuples of equal size are bitwise-copyable via `assign`.
pub struct Tuple<'a> {
    bytes: &'a [u8],
}

impl<'a> Tuple<'a> {
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A mutable non-owning view into a page's tuple area.
pub struct TupleMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> TupleMut<'a> {
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// Bitwise-copies `src` into this tuple slot. Both must be the same
    /// size (enforced by the page, which only ever hands out tuple_size
    /// slices).
    pub fn assign(&mut self, src: &[u8]) {
        debug_assert_eq!(self.bytes.len(), src.len());
        self.bytes.copy_from_slice(src);
    }
}

/// A fixed-size contiguous buffer carved into `capacity` slots of
/// `tuple_size` bytes each. Never `Clone`/`Copy` and never handed out by
/// value: pages live behind `PagePool` storage and are only ever accessed
/// through `&`/`&mut` borrows scoped to a pool method.
pub struct Page {
    pool_id: u64,
    tuple_size: usize,
    capacity: usize,
    free_count: usize,
    end_offset: usize,
    /// Free-list link (page number of the next free page), or `None`.
    /// Doubles as the serialized "next" header slot.
    next: Option<usize>,
    data: Vec<u8>,
}

impl Page {
    fn new(pool_id: u64, tuple_size: usize, capacity: usize) -> Page {
        Page {
            pool_id,
            tuple_size,
            capacity,
            free_count: capacity,
            end_offset: 0,
            next: None,
            data: vec![0u8; tuple_size * capacity],
        }
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tuple_count(&self) -> usize {
        self.capacity - self.free_count
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    fn invariant_check(&self) {
        debug_assert_eq!(self.end_offset, self.tuple_count() * self.tuple_size);
        debug_assert_eq!(self.free_count + self.tuple_count(), self.capacity);
    }

    /// Appends a zeroed tuple slot and returns a mutable handle to it.
    /// Fails with `OutOfRange` iff the page has no free slots.
    pub fn allocate_tuple(&mut self) -> CoreResult<TupleMut<'_>> {
        if self.free_count == 0 {
            return Err(CoreError::OutOfRange);
        }
        let start = self.end_offset;
        let end = start + self.tuple_size;
        self.data[start..end].iter_mut().for_each(|b| *b = 0);
        self.end_offset = end;
        self.free_count -= 1;
        self.invariant_check();
        Ok(TupleMut { bytes: &mut self.data[start..end] })
    }

    /// Allocates a slot and copies `bytes` into it in one step.
    pub fn append_tuple(&mut self, bytes: &[u8]) -> CoreResult<usize> {
        if bytes.len() != self.tuple_size {
            return Err(CoreError::WrongDiskData(format!(
                "tuple size mismatch: page expects {}, got {}",
                self.tuple_size,
                bytes.len()
            )));
        }
        let index = self.tuple_count();
        let mut slot = self.allocate_tuple()?;
        slot.assign(bytes);
        Ok(index)
    }

    pub fn get_tuple(&self, index: usize) -> CoreResult<Tuple<'_>> {
        if index >= self.tuple_count() {
            return Err(CoreError::OutOfRange);
        }
        let start = index * self.tuple_size;
        Ok(Tuple { bytes: &self.data[start..start + self.tuple_size] })
    }

    pub fn get_tuple_mut(&mut self, index: usize) -> CoreResult<TupleMut<'_>> {
        if index >= self.tuple_count() {
            return Err(CoreError::OutOfRange);
        }
        let start = index * self.tuple_size;
        let tuple_size = self.tuple_size;
        Ok(TupleMut { bytes: &mut self.data[start..start + tuple_size] })
    }

    /// Resets the page to empty, ready for reuse by its pool.
    pub fn clear(&mut self) {
        self.free_count = self.capacity;
        self.end_offset = 0;
        self.next = None;
        for b in self.data.iter_mut() {
            *b = 0;
        }
    }

    /// A finite, non-restartable iterator over the page's live tuples.
    pub fn iter(&self) -> impl Iterator<Item = Tuple<'_>> {
        let tuple_size = self.tuple_size;
        self.data[..self.end_offset]
            .chunks(tuple_size)
            .map(|bytes| Tuple { bytes })
    }

    /// Reads one full page (`page_size` bytes) from `file` into a freshly
    /// allocated page matching `tuple_size`/`capacity`. Returns `Ok(None)`
    /// on a clean EOF (no bytes read); `Err(FileException)` on a short or
    /// oversized read.
    pub fn fread_full_page(file: &mut File, page_size: usize) -> CoreResult<Option<Page>> {
        let mut buf = vec![0u8; page_size];
        let mut total = 0usize;
        loop {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => return Err(CoreError::FileException(e.to_string())),
            }
            if total == buf.len() {
                break;
            }
        }
        if total == 0 {
            return Ok(None);
        }
        if total != page_size {
            return Err(CoreError::FileException(format!(
                "short read: expected {} bytes, got {}",
                page_size, total
            )));
        }

        let pool_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let tuple_size = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
        let capacity = u64::from_le_bytes(buf[16..24].try_into().unwrap()) as usize;
        let free_count = u64::from_le_bytes(buf[24..32].try_into().unwrap()) as usize;
        let end_offset = u64::from_le_bytes(buf[32..40].try_into().unwrap()) as usize;
        // next-pointer slot (bytes 40..48) is ignored on read.

        if HEADER_BYTES + tuple_size * capacity > page_size {
            return Err(CoreError::FileException(
                "page header declares a tuple area larger than page_size".to_string(),
            ));
        }

        let mut data = vec![0u8; tuple_size * capacity];
        data.copy_from_slice(&buf[HEADER_BYTES..HEADER_BYTES + tuple_size * capacity]);

        Ok(Some(Page {
            pool_id,
            tuple_size,
            capacity,
            free_count,
            end_offset,
            next: None,
            data,
        }))
    }

    /// Writes exactly `page_size` bytes: header, tuple area, then zero
    /// padding for any unused tail.
    pub fn fwrite_full_page(&self, file: &mut File, page_size: usize) -> CoreResult<()> {
        let mut buf = vec![0u8; page_size];
        buf[0..8].copy_from_slice(&self.pool_id.to_le_bytes());
        buf[8..16].copy_from_slice(&(self.tuple_size as u64).to_le_bytes());
        buf[16..24].copy_from_slice(&(self.capacity as u64).to_le_bytes());
        buf[24..32].copy_from_slice(&(self.free_count as u64).to_le_bytes());
        buf[32..40].copy_from_slice(&(self.end_offset as u64).to_le_bytes());
        buf[40..48].copy_from_slice(&(self.next.unwrap_or(0) as u64).to_le_bytes());

        let tuple_area = self.tuple_size * self.capacity;
        if HEADER_BYTES + tuple_area > page_size {
            return Err(CoreError::FileException(
                "tuple area does not fit in page_size".to_string(),
            ));
        }
        buf[HEADER_BYTES..HEADER_BYTES + tuple_area].copy_from_slice(&self.data);

        file.write_all(&buf).map_err(|e| CoreError::FileException(e.to_string()))
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A slab allocator for pages of one fixed tuple size. Pages are addressed
/// by a stable `page_no` (an index into the pool's growable slab); freed
/// pages are threaded onto a free list via `Page::next` and recycled by the
/// next `alloc`.
pub struct PagePool {
    id: u64,
    tuple_size: usize,
    capacity: usize,
    page_size: usize,
    pages: Mutex<PoolInner>,
}

struct PoolInner {
    slab: Vec<Page>,
    free_head: Option<usize>,
}

const DEFAULT_PAGE_SIZE: usize = 4096;

impl PagePool {
    pub fn new(tuple_size: usize) -> PagePool {
        Self::with_page_size(tuple_size, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(tuple_size: usize, page_size: usize) -> PagePool {
        let capacity = ((page_size.saturating_sub(HEADER_BYTES)) / tuple_size).max(1);
        PagePool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            tuple_size,
            capacity,
            page_size,
            pages: Mutex::new(PoolInner { slab: Vec::new(), free_head: None }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn capacity_per_page(&self) -> usize {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates a page, reusing a freed one if available.
    pub fn alloc(&self) -> usize {
        let mut inner = self.pages.lock().unwrap();
        if let Some(pn) = inner.free_head {
            inner.free_head = inner.slab[pn].next;
            inner.slab[pn].clear();
            inner.slab[pn].pool_id = self.id;
            return pn;
        }
        let page = Page::new(self.id, self.tuple_size, self.capacity);
        inner.slab.push(page);
        inner.slab.len() - 1
    }

    /// Returns a page to the pool's free list.
    pub fn free(&self, page_no: usize) {
        let mut inner = self.pages.lock().unwrap();
        inner.slab[page_no].clear();
        inner.slab[page_no].next = inner.free_head;
        inner.free_head = Some(page_no);
    }

    pub fn with_page<R>(&self, page_no: usize, f: impl FnOnce(&Page) -> R) -> R {
        let inner = self.pages.lock().unwrap();
        f(&inner.slab[page_no])
    }

    pub fn with_page_mut<R>(&self, page_no: usize, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut inner = self.pages.lock().unwrap();
        f(&mut inner.slab[page_no])
    }

    /// Number of pages ever allocated (including currently-free ones still
    /// held in the slab).
    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().slab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn allocate_tuple_fails_when_full() {
        let pool = PagePool::with_page_size(8, HEADER_BYTES + 8 * 2);
        let pn = pool.alloc();
        pool.with_page_mut(pn, |p| {
            assert!(p.allocate_tuple().is_ok());
            assert!(p.allocate_tuple().is_ok());
            assert!(matches!(p.allocate_tuple(), Err(CoreError::OutOfRange)));
        });
    }

    #[test]
    fn append_and_iterate_tuples() {
        let pool = PagePool::with_page_size(4, HEADER_BYTES + 4 * 4);
        let pn = pool.alloc();
        pool.with_page_mut(pn, |p| {
            p.append_tuple(&[1, 2, 3, 4]).unwrap();
            p.append_tuple(&[5, 6, 7, 8]).unwrap();
        });
        pool.with_page(pn, |p| {
            let all: Vec<Vec<u8>> = p.iter().map(|t| t.bytes().to_vec()).collect();
            assert_eq!(all, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        });
    }

    #[test]
    fn free_and_realloc_recycles_page_no() {
        let pool = PagePool::with_page_size(4, HEADER_BYTES + 4 * 4);
        let pn = pool.alloc();
        pool.free(pn);
        let pn2 = pool.alloc();
        assert_eq!(pn, pn2);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn fwrite_then_fread_roundtrips() {
        let page_size = HEADER_BYTES + 4 * 4;
        let pool = PagePool::with_page_size(4, page_size);
        let pn = pool.alloc();
        pool.with_page_mut(pn, |p| {
            p.append_tuple(&[9, 9, 9, 9]).unwrap();
        });

        let mut file = tempfile().unwrap();
        pool.with_page(pn, |p| p.fwrite_full_page(&mut file, page_size).unwrap());

        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        let read_back = Page::fread_full_page(&mut file, page_size).unwrap().unwrap();
        assert_eq!(read_back.tuple_size(), 4);
        assert_eq!(read_back.tuple_count(), 1);
        assert_eq!(read_back.get_tuple(0).unwrap().bytes(), &[9, 9, 9, 9]);
    }

    #[test]
    fn fread_on_empty_file_returns_none() {
        let mut file = tempfile().unwrap();
        let result = Page::fread_full_page(&mut file, 64).unwrap();
        assert!(result.is_none());
    }
}

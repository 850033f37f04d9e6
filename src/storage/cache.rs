//! # Set-Associative Page Cache
//!
//! Two-level set-associative cache mapping file offsets to in-memory page
//! frames. The cache is partitioned into rows; each row starts with eight
//! items and carries its own reader/writer lock, so lookups in distinct rows
//! never contend. Frames come from the aligned buffer pool and are never
//! returned; eviction reuses them in place.
//!
//! ```text
//! PageCache
//! ├── Row 0: RwLock<{ items[8+], load_count }>
//! ├── Row 1: RwLock<{ items[8+], load_count }>
//! └── ...
//! ```
//!
//! Row selection hashes the page number with a fixed multiplier so adjacent
//! pages scatter across rows.
//!
//! ## Item States
//!
//! Each item is `{ frame, offset, load_time }`:
//!
//! - `frame = None`: the slot has no memory behind it yet
//! - `offset = 0`: the frame is allocated but maps no file page ("available")
//! - otherwise: the frame holds the page at `offset`
//!
//! ## Lookup Protocol
//!
//! 1. Read-lock the row and scan. On a hit, pin the frame and return; the
//!    pin is taken while the row lock is held, so the frame cannot be evicted
//!    underneath us.
//! 2. On a miss, write-lock the row and re-scan (another thread may have
//!    loaded the page in between).
//! 3. Claim an available slot, or allocate a frame into an empty slot, or
//!    evict the oldest unpinned entry. A dirty victim is written out when the
//!    store runs with autosave, and aborts the operation otherwise. If every
//!    entry is pinned the row grows by four items.
//! 4. Load or zero the frame, publish the mapping and return it pinned.
//!
//! ## Pin Discipline
//!
//! A page is resident exactly while its pin count is above zero. Pin counts
//! are atomic: readers pin and unpin under the shared database lock, and the
//! eviction scan reads them under the row write lock. A frame with pins may
//! be re-pinned without the row lock (the count can only be raised by someone
//! who already holds a pin); a frame at zero may only be pinned by a lookup
//! holding the row lock.
//!
//! `load_time` is a monotone per-row counter assigned on load, giving the
//! LRU approximation used by eviction. Fresh pages get `load_time = 0` so
//! they are preferred victims until reloaded.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::RwLock;

use crate::config::{CACHE_ROW_GROWTH, CACHE_WAYS, KB_PER_PAGE, PAGE_SIZE, ROW_HASH_MULTIPLIER};
use crate::error::{Error, Result};
use crate::storage::io::StoreFile;
use crate::storage::page::{self, PageBytes};
use crate::storage::pool::{BufferPool, FramePtr};

/// A pool frame plus its pin count. The dirty flag and file offset live in
/// the page bytes themselves (status byte and page_offset field).
pub(crate) struct Frame {
    data: FramePtr,
    pins: AtomicI32,
}

impl Frame {
    fn new(data: FramePtr) -> Self {
        Self {
            data,
            pins: AtomicI32::new(0),
        }
    }

    pub fn pin(&self) {
        let prev = self.pins.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev >= 0);
    }

    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned page");
    }

    pub fn pin_count(&self) -> i32 {
        self.pins.load(Ordering::Acquire)
    }

    fn reset_pins(&self) {
        self.pins.store(0, Ordering::Release);
    }

    fn publish_pinned(&self) {
        self.pins.store(1, Ordering::Release);
    }

    /// # Safety
    ///
    /// Caller must hold a pin or the row lock, and no `&mut` to the frame may
    /// be live.
    unsafe fn bytes(&self) -> &PageBytes {
        self.data.bytes()
    }

    /// # Safety
    ///
    /// Caller must have exclusive access to the frame's bytes: either the row
    /// write lock with the frame unpinned (load and eviction), or the
    /// database exclusive lock with a pin held (content mutation).
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self) -> &mut PageBytes {
        self.data.bytes_mut()
    }
}

struct CacheItem {
    frame: Option<Arc<Frame>>,
    offset: u32,
    load_time: u32,
}

impl CacheItem {
    fn empty() -> Self {
        Self {
            frame: None,
            offset: 0,
            load_time: 0,
        }
    }
}

struct RowState {
    items: Vec<CacheItem>,
    load_count: u32,
}

/// The page cache. The header page is not managed here; it is permanently
/// resident in the store.
pub struct PageCache {
    rows: Vec<RwLock<RowState>>,
    row_mask: u32,
    pool: BufferPool,
}

impl PageCache {
    /// Builds a cache of `cache_kb` kilobytes. The caller has already rounded
    /// the size to a power of two and checked the minimum.
    pub fn new(cache_kb: usize) -> Result<Self> {
        let row_count = cache_kb / (KB_PER_PAGE * CACHE_WAYS);
        debug_assert!(row_count.is_power_of_two());
        let rows = (0..row_count)
            .map(|_| {
                RwLock::new(RowState {
                    items: (0..CACHE_WAYS).map(|_| CacheItem::empty()).collect(),
                    load_count: 1,
                })
            })
            .collect();
        Ok(Self {
            rows,
            row_mask: row_count as u32 - 1,
            pool: BufferPool::new()?,
        })
    }

    fn row_of(&self, offset: u32) -> usize {
        let page_no = offset / PAGE_SIZE as u32;
        ((page_no.wrapping_mul(ROW_HASH_MULTIPLIER) >> 3) & self.row_mask) as usize
    }

    fn scan_hit(state: &RowState, offset: u32) -> Option<PageGuard> {
        for item in &state.items {
            match &item.frame {
                Some(frame) => {
                    if item.offset == offset {
                        // Safe to pin here: the row lock is held, so no
                        // eviction can be selecting this frame concurrently.
                        frame.pin();
                        return Some(PageGuard {
                            frame: Arc::clone(frame),
                        });
                    }
                }
                None => break,
            }
        }
        None
    }

    /// Maps `offset` to a pinned frame, loading the page from `io` when
    /// `existing` is set, or handing out a zeroed frame for a new page.
    pub(crate) fn lookup(
        &self,
        io: &StoreFile,
        autosave: bool,
        offset: u32,
        existing: bool,
    ) -> Result<PageGuard> {
        debug_assert!(offset != 0 && offset % PAGE_SIZE as u32 == 0);
        let row = &self.rows[self.row_of(offset)];

        {
            let state = row.read();
            if let Some(guard) = Self::scan_hit(&state, offset) {
                return Ok(guard);
            }
        }

        let mut state = row.write();
        // The page may have been loaded while we waited for the write lock.
        if let Some(guard) = Self::scan_hit(&state, offset) {
            return Ok(guard);
        }

        let idx = self.claim_slot(io, autosave, &mut state)?;
        let frame = Arc::clone(
            state.items[idx]
                .frame
                .as_ref()
                .expect("claimed slot always has a frame"),
        );

        // SAFETY: row write lock held, frame unpinned and unmapped; nobody
        // else can reach these bytes.
        let bytes = unsafe { frame.bytes_mut() };
        if existing {
            page::read_page(io, offset, bytes)?;
            state.items[idx].load_time = state.load_count;
            state.load_count += 1;
        } else {
            bytes.fill(0);
            page::prefix_mut(bytes).set_page_offset(offset);
            state.items[idx].load_time = 0;
        }
        state.items[idx].offset = offset;
        frame.publish_pinned();
        Ok(PageGuard { frame })
    }

    /// Finds a frame to hold a new mapping: an available slot, a fresh frame,
    /// the oldest unpinned entry, or a row extension, in that order.
    fn claim_slot(&self, io: &StoreFile, autosave: bool, state: &mut RowState) -> Result<usize> {
        if let Some(idx) = state
            .items
            .iter()
            .position(|it| it.frame.is_some() && it.offset == 0)
        {
            return Ok(idx);
        }

        if let Some(idx) = state.items.iter().position(|it| it.frame.is_none()) {
            if let Ok(ptr) = self.pool.alloc_frame() {
                state.items[idx].frame = Some(Arc::new(Frame::new(ptr)));
                return Ok(idx);
            }
            // Allocation failed; fall through and try to evict instead.
        }

        let mut victim = None;
        let mut min_age = state.load_count;
        for (idx, item) in state.items.iter().enumerate() {
            if let Some(frame) = &item.frame {
                if item.offset != 0 && item.load_time < min_age && frame.pin_count() == 0 {
                    min_age = item.load_time;
                    victim = Some(idx);
                }
            }
        }

        if let Some(idx) = victim {
            let frame = state.items[idx]
                .frame
                .as_ref()
                .expect("victim has a frame");
            // SAFETY: row write lock held and the victim is unpinned.
            let bytes = unsafe { frame.bytes_mut() };
            if page::prefix(bytes).is_dirty() {
                if autosave {
                    trace!(
                        "evicting dirty page {:#x}, writing back",
                        state.items[idx].offset
                    );
                    page::write_page(io, bytes)?;
                } else {
                    return Err(Error::Abort("must flush but autosave is off"));
                }
            }
            state.items[idx].offset = 0;
            return Ok(idx);
        }

        // Every entry is pinned; extend the row.
        let base = state.items.len();
        for _ in 0..CACHE_ROW_GROWTH {
            state.items.push(CacheItem::empty());
        }
        state.items[base].frame = Some(Arc::new(Frame::new(self.pool.alloc_frame()?)));
        Ok(base)
    }

    /// Writes out every dirty cached page. Called with the database lock held
    /// exclusively, so no reader can touch the frames concurrently.
    pub(crate) fn write_dirty(&self, io: &StoreFile) -> Result<usize> {
        let mut flushed = 0;
        for row in &self.rows {
            let state = row.read();
            for item in &state.items {
                let frame = match &item.frame {
                    Some(f) => f,
                    None => break,
                };
                if item.offset == 0 {
                    // Available frames hold no page; a failed load can leave
                    // arbitrary bytes behind in them.
                    continue;
                }
                debug_assert_eq!(frame.pin_count(), 0);
                // SAFETY: exclusive database lock; nothing else runs.
                let bytes = unsafe { frame.bytes_mut() };
                if page::prefix(bytes).is_dirty() {
                    page::write_page(io, bytes)?;
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    /// Drops every dirty mapping so the next lookup reloads the committed
    /// page from disk, and forces all pin counts back to zero. Called with
    /// the database lock held exclusively after a failed write path.
    pub(crate) fn invalidate_dirty(&self) {
        for row in &self.rows {
            let mut state = row.write();
            for item in &mut state.items {
                let frame = match &item.frame {
                    Some(f) => f,
                    None => continue,
                };
                if item.offset != 0 {
                    // SAFETY: exclusive database lock.
                    let bytes = unsafe { frame.bytes_mut() };
                    if page::prefix(bytes).is_dirty() {
                        // Clear the stale dirty bit too, or a later commit
                        // sweep would write the rolled-back bytes to disk.
                        page::prefix_mut(bytes).clear_dirty();
                        item.offset = 0;
                    }
                    frame.reset_pins();
                }
            }
        }
    }

    /// True when no cached frame is pinned; an idle store must satisfy this.
    pub(crate) fn all_unpinned(&self) -> bool {
        self.rows.iter().all(|row| {
            let state = row.read();
            state
                .items
                .iter()
                .all(|it| it.frame.as_ref().map_or(true, |f| f.pin_count() == 0))
        })
    }
}

/// A pinned page. The page stays resident for the guard's lifetime; the pin
/// is released on drop.
pub(crate) struct PageGuard {
    frame: Arc<Frame>,
}

impl PageGuard {
    /// The file offset of the pinned page.
    pub fn page_offset(&self) -> u32 {
        self.with(|p| page::prefix(p).page_offset())
    }

    /// Runs `f` over the page bytes.
    pub fn with<R>(&self, f: impl FnOnce(&PageBytes) -> R) -> R {
        // SAFETY: the pin keeps the frame mapped; mutation happens only under
        // the database exclusive lock, which excludes this reader.
        f(unsafe { self.frame.bytes() })
    }

    /// Runs `f` over the page bytes mutably and marks the page dirty.
    ///
    /// Callers hold the database exclusive lock; that is what makes the
    /// transient `&mut` below exclusive.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut PageBytes) -> R) -> R {
        // SAFETY: see above; only the single writer reaches this.
        let bytes = unsafe { self.frame.bytes_mut() };
        page::prefix_mut(bytes).set_dirty();
        f(bytes)
    }

    /// Takes an additional pin on the same page.
    pub fn clone_pin(&self) -> PageGuard {
        self.frame.pin();
        PageGuard {
            frame: Arc::clone(&self.frame),
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_CACHE_KB;
    use crate::storage::page::{init_data_page, prefix_mut, write_page};

    fn test_io() -> (tempfile::TempDir, StoreFile) {
        let dir = tempfile::tempdir().unwrap();
        let io = StoreFile::create(&dir.path().join("cache.db")).unwrap();
        (dir, io)
    }

    fn write_data_page(io: &StoreFile, offset: u32, tag: u8) {
        let mut bytes: Box<PageBytes> = Box::new([0u8; PAGE_SIZE]);
        init_data_page(&mut bytes, offset);
        bytes[100] = tag;
        prefix_mut(&mut bytes).set_dirty();
        write_page(io, &mut bytes).unwrap();
    }

    #[test]
    fn lookup_loads_and_caches() {
        let (_dir, io) = test_io();
        write_data_page(&io, PAGE_SIZE as u32, 0x5A);

        let cache = PageCache::new(MIN_CACHE_KB).unwrap();
        let guard = cache.lookup(&io, false, PAGE_SIZE as u32, true).unwrap();
        assert_eq!(guard.with(|p| p[100]), 0x5A);
        assert_eq!(guard.page_offset(), PAGE_SIZE as u32);
        drop(guard);
        assert!(cache.all_unpinned());

        // Second lookup hits the cached frame even after the file changes.
        write_data_page(&io, PAGE_SIZE as u32, 0x77);
        let guard = cache.lookup(&io, false, PAGE_SIZE as u32, true).unwrap();
        assert_eq!(guard.with(|p| p[100]), 0x5A);
    }

    #[test]
    fn new_page_comes_back_zeroed_and_pinned() {
        let (_dir, io) = test_io();
        let cache = PageCache::new(MIN_CACHE_KB).unwrap();

        let guard = cache.lookup(&io, false, 3 * PAGE_SIZE as u32, false).unwrap();
        assert_eq!(guard.page_offset(), 3 * PAGE_SIZE as u32);
        guard.with(|p| assert!(p[20..].iter().all(|&b| b == 0)));
        assert!(!cache.all_unpinned());
        drop(guard);
        assert!(cache.all_unpinned());
    }

    #[test]
    fn clone_pin_tracks_counts() {
        let (_dir, io) = test_io();
        let cache = PageCache::new(MIN_CACHE_KB).unwrap();

        let a = cache.lookup(&io, false, PAGE_SIZE as u32, false).unwrap();
        let b = a.clone_pin();
        drop(a);
        assert!(!cache.all_unpinned());
        drop(b);
        assert!(cache.all_unpinned());
    }

    #[test]
    fn dirty_eviction_without_autosave_aborts() {
        let (_dir, io) = test_io();
        let cache = PageCache::new(MIN_CACHE_KB).unwrap();

        // Fill the cache with dirty unpinned pages until a row overflows.
        let mut aborted = false;
        for i in 1..=64u32 {
            match cache.lookup(&io, false, i * PAGE_SIZE as u32, false) {
                Ok(guard) => {
                    guard.with_mut(|p| p[200] = i as u8);
                }
                Err(Error::Abort(_)) => {
                    aborted = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(aborted, "dirty eviction should abort without autosave");
    }

    #[test]
    fn dirty_eviction_with_autosave_writes_back() {
        let (_dir, io) = test_io();
        let cache = PageCache::new(MIN_CACHE_KB).unwrap();

        for i in 1..=64u32 {
            let guard = cache.lookup(&io, true, i * PAGE_SIZE as u32, false).unwrap();
            guard.with_mut(|p| {
                init_data_page(p, i * PAGE_SIZE as u32);
                p[200] = i as u8;
            });
        }

        // An early page was evicted and written; reload and check its tag.
        let guard = cache.lookup(&io, true, PAGE_SIZE as u32, true).unwrap();
        assert_eq!(guard.with(|p| p[200]), 1);
    }

    #[test]
    fn invalidate_dirty_drops_mappings() {
        let (_dir, io) = test_io();
        write_data_page(&io, PAGE_SIZE as u32, 0x11);

        let cache = PageCache::new(MIN_CACHE_KB).unwrap();
        {
            let guard = cache.lookup(&io, false, PAGE_SIZE as u32, true).unwrap();
            guard.with_mut(|p| p[100] = 0x22);
        }
        cache.invalidate_dirty();

        // The mapping was dropped, so the next lookup reloads from disk.
        let guard = cache.lookup(&io, false, PAGE_SIZE as u32, true).unwrap();
        assert_eq!(guard.with(|p| p[100]), 0x11);
    }
}

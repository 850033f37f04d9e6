//! # The Store
//!
//! `Store` ties the pieces together: the open file, the page cache, the
//! permanently resident header page with its shadow copy, and the
//! database-wide lock that serializes writers against readers.
//!
//! ## Locking
//!
//! One upgradable reader/writer lock guards every public operation. Reads
//! (`find`, the getters, cursor steps) take it shared and may run in
//! parallel; writes (`create_*`, `update_*`, `commit`) take it exclusive.
//! `delete` starts with an upgradable read to look up and validate, then
//! upgrades for the destructive part. Per-row cache locks below this one let
//! concurrent readers miss and load pages in distinct rows independently.
//!
//! ## Write-Path Failure
//!
//! Every write operation funnels through one catch site. On any error the
//! store rolls back before the lock is released: dirty cached pages are
//! invalidated so the next lookup rereads the committed bytes, pin counts
//! are cleared, and the header is restored from the shadow copy taken at the
//! last commit. A failed operation therefore leaves the database exactly as
//! the last commit left it.
//!
//! ## Header Page
//!
//! Page 0 never enters the cache rows. It lives in an aligned buffer inside
//! the store, is mutated only under the exclusive lock, and is written last
//! during commit so the on-disk header never points at pages that were not
//! written first.

mod ops;
mod verify;

use std::cell::UnsafeCell;
use std::path::Path;

use log::{debug, trace, warn};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::{
    DEFAULT_CACHE_KB, MAX_FILE_PAGES, MIN_CACHE_KB, PAGE_SIZE, SLOT_ARRAY_OFFSET,
};
use crate::error::{Error, Result};
use crate::node::{Key, NodeId, NodePin, NodeType};
use crate::storage::cache::{PageCache, PageGuard};
use crate::storage::io::StoreFile;
use crate::storage::page::{
    self, PageBytes, FILE_FLAG_64BIT, FILE_FLAG_BIG_ENDIAN, PAGE_KIND_DATA,
};
use crate::storage::pool::PageBuf;
use crate::tree::cursor::{Cursor, Order};
use crate::tree::{RootRef, SubTree};

/// Builder for opening or creating a store.
///
/// ```ignore
/// let store = Store::options()
///     .create(true)
///     .autosave(true)
///     .cache_kb(512)
///     .open("registry.hive")?;
/// ```
#[derive(Debug, Clone)]
pub struct StoreOptions {
    create: bool,
    read_only: bool,
    autosave: bool,
    cache_kb: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self {
            create: false,
            read_only: false,
            autosave: false,
            cache_kb: DEFAULT_CACHE_KB,
        }
    }

    /// Create the file, truncating any existing one. Incompatible with
    /// `read_only`.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Allow eviction to write dirty pages back between commits. Without it,
    /// running out of clean cache space aborts the running operation.
    pub fn autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    /// Cache size in kilobytes; rounded down to a power of two, minimum 64.
    pub fn cache_kb(mut self, cache_kb: usize) -> Self {
        self.cache_kb = cache_kb;
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Store> {
        Store::open_with(path.as_ref(), self)
    }
}

/// The header page buffer. Mutation is confined to the exclusive database
/// lock, which is what makes the raw accessors sound.
struct HeaderCell(Box<UnsafeCell<PageBuf>>);

impl HeaderCell {
    fn new() -> Self {
        Self(Box::new(UnsafeCell::new(PageBuf([0u8; PAGE_SIZE]))))
    }

    /// # Safety
    ///
    /// No `&mut` to the same cell may be live; callers hold at least the
    /// shared database lock.
    unsafe fn bytes(&self) -> &PageBytes {
        &(*self.0.get()).0
    }

    /// # Safety
    ///
    /// Callers hold the exclusive database lock (or sole ownership during
    /// open), making this the only live reference.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self) -> &mut PageBytes {
        &mut (*self.0.get()).0
    }
}

// SAFETY: access is serialized by the store's database lock as documented on
// the accessors.
unsafe impl Send for HeaderCell {}
unsafe impl Sync for HeaderCell {}

/// An embeddable single-file hierarchical key/value store.
pub struct Store {
    io: StoreFile,
    read_only: bool,
    autosave: bool,
    lock: RwLock<()>,
    cache: PageCache,
    header: HeaderCell,
    shadow: HeaderCell,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("read_only", &self.read_only)
            .field("autosave", &self.autosave)
            .finish_non_exhaustive()
    }
}

fn floor_pow2(x: usize) -> usize {
    if x == 0 {
        0
    } else {
        1usize << (usize::BITS - 1 - x.leading_zeros())
    }
}

impl Store {
    /// Starts building open options.
    pub fn options() -> StoreOptions {
        StoreOptions::new()
    }

    /// Opens an existing store read/write with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        StoreOptions::new().open(path)
    }

    fn open_with(path: &Path, opts: StoreOptions) -> Result<Store> {
        if opts.create && opts.read_only {
            return Err(Error::Param("create and read_only cannot be combined"));
        }
        let cache_kb = floor_pow2(opts.cache_kb);
        if cache_kb < MIN_CACHE_KB {
            return Err(Error::Param("cache size below the 64 KiB minimum"));
        }

        let io = if opts.create {
            StoreFile::create(path)?
        } else {
            StoreFile::open(path, opts.read_only)?
        };

        let store = Store {
            io,
            read_only: opts.read_only,
            autosave: opts.autosave,
            lock: RwLock::new(()),
            cache: PageCache::new(cache_kb)?,
            header: HeaderCell::new(),
            shadow: HeaderCell::new(),
        };

        if opts.create {
            store.with_header_mut(|p| {
                let f = page::header_fields_mut(p);
                f.set_page_count(1);
                f.set_page_size(PAGE_SIZE as u32);
            });
            store.commit(true)?;
            debug!("created store at {}", path.display());
        } else {
            // SAFETY: the store is not shared yet.
            let header = unsafe { store.header.bytes_mut() };
            page::read_page(&store.io, 0, header)?;
            let fields = page::header_fields(header);
            if fields.page_size() != PAGE_SIZE as u32 {
                return Err(Error::Corrupt("unexpected page size in header"));
            }
            if fields.flags() & (FILE_FLAG_64BIT | FILE_FLAG_BIG_ENDIAN) != 0 {
                return Err(Error::Corrupt("file format variant not supported"));
            }
            // SAFETY: still exclusively owned; the cells are distinct.
            unsafe { store.shadow.bytes_mut().copy_from_slice(store.header.bytes()) };
            debug!(
                "opened store at {} ({} pages)",
                path.display(),
                fields.page_count()
            );
        }
        Ok(store)
    }

    /// Closes the store without committing. Uncommitted changes are lost,
    /// matching what dropping the store does.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Writes every dirty page, then the header, optionally flushes to disk,
    /// and takes the shadow snapshot rollback restores from.
    ///
    /// Failures here are surfaced without rollback; the dirty bits of
    /// unwritten pages survive, so a later commit retries them.
    pub fn commit(&self, flush: bool) -> Result<()> {
        let _guard = self.lock.write();
        let flushed = self.cache.write_dirty(&self.io)?;
        // SAFETY: exclusive lock held.
        let header = unsafe { self.header.bytes_mut() };
        page::write_page(&self.io, header)?;
        if flush {
            self.io.sync()?;
        }
        // SAFETY: exclusive lock held; the cells are distinct.
        unsafe { self.shadow.bytes_mut().copy_from_slice(self.header.bytes()) };
        debug!("commit: {flushed} data pages written");
        Ok(())
    }

    /// True when no cached page is pinned. An idle store always satisfies
    /// this; a failure indicates a leaked pin.
    pub fn cache_consistent(&self) -> bool {
        self.cache.all_unpinned()
    }

    /// Starts an in-order cursor over `tree` entries.
    pub fn cursor(&self, tree: SubTree, order: Order) -> Cursor<'_> {
        Cursor::new(self, tree, order)
    }

    // ---- internal plumbing ----

    pub(crate) fn shared_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::InvOper("store is opened read-only"));
        }
        Ok(())
    }

    /// Runs a mutating operation under the exclusive lock; on any error the
    /// store is rolled back to the last committed state before returning.
    pub(crate) fn write_op<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.lock.write();
        match f() {
            Ok(v) => Ok(v),
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    pub(crate) fn read_op<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.lock.read();
        f()
    }

    /// Restores the last committed view: dirty cache mappings are dropped,
    /// pins are cleared and the header is rewound to the shadow copy.
    pub(crate) fn rollback(&self) {
        warn!("rolling back to last committed state");
        self.cache.invalidate_dirty();
        // SAFETY: the failing writer holds the exclusive lock; every page
        // guard of the failed operation has already been dropped.
        unsafe { self.header.bytes_mut().copy_from_slice(self.shadow.bytes()) };
    }

    pub(crate) fn with_header<R>(&self, f: impl FnOnce(&PageBytes) -> R) -> R {
        // SAFETY: header writes happen only under the exclusive lock, which
        // excludes everyone reaching this.
        f(unsafe { self.header.bytes() })
    }

    pub(crate) fn with_header_mut<R>(&self, f: impl FnOnce(&mut PageBytes) -> R) -> R {
        // SAFETY: callers hold the exclusive lock (or sole ownership during
        // open).
        let bytes = unsafe { self.header.bytes_mut() };
        page::prefix_mut(bytes).set_dirty();
        f(bytes)
    }

    /// Pins an existing page through the cache.
    pub(crate) fn pin_page(&self, page_off: u32) -> Result<PageGuard> {
        self.cache.lookup(&self.io, self.autosave, page_off, true)
    }

    /// Resolves a node reference to a pinned node. When `near` already pins
    /// the node's page the pin count is raised instead of going through the
    /// cache row.
    pub(crate) fn pin_node(&self, node_ref: u32, near: Option<&PageGuard>) -> Result<NodePin> {
        let page_off = node_ref & !(PAGE_SIZE as u32 - 1);
        let slot = (node_ref & (PAGE_SIZE as u32 - 1)) as u16;
        if page_off == 0 || (slot as usize) < SLOT_ARRAY_OFFSET {
            return Err(Error::Corrupt("invalid node reference"));
        }
        let guard = match near {
            Some(g) if g.page_offset() == page_off => g.clone_pin(),
            _ => self.pin_page(page_off)?,
        };
        Ok(NodePin::new(guard, slot))
    }

    /// Pins the node a public id names. The implicit root has no node.
    pub(crate) fn pin_existing(&self, id: NodeId) -> Result<NodePin> {
        if id.is_root() {
            return Err(Error::Param("the hierarchy root has no node record"));
        }
        self.pin_node(id.0, None)
    }

    /// Appends a fresh data page to the file and returns it pinned.
    pub(crate) fn create_page(&self) -> Result<PageGuard> {
        let count = self.with_header(|p| page::header_fields(p).page_count());
        if count >= MAX_FILE_PAGES {
            return Err(Error::InvOper("maximum file size exceeded"));
        }
        let offset = count * PAGE_SIZE as u32;
        let guard = self.cache.lookup(&self.io, self.autosave, offset, false)?;
        guard.with_mut(|p| page::init_data_page(p, offset));
        self.with_header_mut(|p| page::header_fields_mut(p).set_page_count(count + 1));
        trace!("created data page {count} at {offset:#x}");
        Ok(guard)
    }

    /// Allocates and initializes a node: header, name, empty child links.
    /// Placement prefers `hint`'s page, then the page-pool bucket for the
    /// node's depth, then a fresh page.
    pub(crate) fn create_node(
        &self,
        hint: Option<&PageGuard>,
        key: &Key<'_>,
        var_len: usize,
        ty: NodeType,
        level: u32,
    ) -> Result<NodePin> {
        let size = crate::node::total_size(key.name().len(), ty, var_len);
        let mut bucket = if level > 127 { 254 } else { level as usize * 2 };
        if ty != NodeType::Key {
            bucket += 1;
        }
        let guard = self.page_for_alloc(hint, size, bucket)?;
        let slot = guard.with_mut(|p| page::alloc_node(p, size))?;
        let pin = NodePin::new(guard, slot);
        pin.init_new(ty, key.name())?;
        Ok(pin)
    }

    fn page_for_alloc(
        &self,
        hint: Option<&PageGuard>,
        size: usize,
        bucket: usize,
    ) -> Result<PageGuard> {
        if let Some(hint) = hint {
            let usable = hint.with(|p| {
                page::prefix(p).kind() == PAGE_KIND_DATA && page::free_space(p) >= size
            });
            if usable {
                return Ok(hint.clone_pin());
            }
        }

        let page_no = self.with_header(|p| page::header_fields(p).page_pool(bucket));
        if page_no != 0 {
            let guard = self.pin_page(page_no * PAGE_SIZE as u32)?;
            if guard.with(page::free_space) >= size {
                return Ok(guard);
            }
        }

        let guard = self.create_page()?;
        if guard.with(page::free_space) < size {
            return Err(Error::Internal("not enough free space in page"));
        }
        let page_no = guard.page_offset() / PAGE_SIZE as u32;
        self.with_header_mut(|p| page::header_fields_mut(p).set_page_pool(bucket, page_no));
        Ok(guard)
    }

    /// Validates `parent` and names the tree the operation works on.
    pub(crate) fn tree_root_ref(&self, parent: NodeId, tree: SubTree) -> Result<RootRef> {
        if parent.is_root() {
            return match tree {
                SubTree::Keys => Ok(RootRef::HeaderChildren),
                SubTree::Values => Err(Error::Param("the hierarchy root holds no values")),
            };
        }
        let node = self.pin_node(parent.0, None)?;
        node.require_type(NodeType::Key)?;
        Ok(RootRef::Node { key: parent.0, tree })
    }

    /// The root offset of the selected subtree, for cursor positioning.
    pub(crate) fn resolve_tree_root(&self, parent: NodeId, tree: SubTree) -> Result<u32> {
        let root = self.tree_root_ref(parent, tree)?;
        crate::tree::root_get(self, &root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_rounding() {
        assert_eq!(floor_pow2(64), 64);
        assert_eq!(floor_pow2(100), 64);
        assert_eq!(floor_pow2(256), 256);
        assert_eq!(floor_pow2(1000), 512);
        assert_eq!(floor_pow2(0), 0);
    }

    #[test]
    fn conflicting_open_flags_rejected() {
        let err = Store::options()
            .create(true)
            .read_only(true)
            .open("/nonexistent")
            .unwrap_err();
        assert!(matches!(err, Error::Param(_)));
    }

    #[test]
    fn tiny_cache_rejected() {
        let err = Store::options().cache_kb(32).open("/nonexistent").unwrap_err();
        assert!(matches!(err, Error::Param(_)));
    }
}

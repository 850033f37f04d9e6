//! Aligned page-frame pool.
//!
//! The cache draws its page frames from this pool. Frames are carved out of
//! 64 KiB blocks whose start addresses are aligned to the page size, so every
//! frame sits on a 4096-byte boundary. Frames are never returned to the pool
//! individually; eviction reuses them in place, and the memory is released
//! only when the pool itself is dropped.
//!
//! Allocation is serialized by an internal mutex so that several readers can
//! demand new frames concurrently.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::config::{FRAMES_PER_BLOCK, PAGE_SIZE};
use crate::error::{Error, Result};

/// One page-sized, page-aligned buffer.
#[repr(C, align(4096))]
pub struct PageBuf(pub [u8; PAGE_SIZE]);

const _: () = assert!(std::mem::size_of::<PageBuf>() == PAGE_SIZE);
const _: () = assert!(std::mem::align_of::<PageBuf>() == PAGE_SIZE);

/// Raw handle to a pool frame. The pointee stays valid until the owning
/// `BufferPool` is dropped; the pool never frees frames while alive.
#[derive(Clone, Copy)]
pub(crate) struct FramePtr(NonNull<PageBuf>);

impl FramePtr {
    /// # Safety
    ///
    /// The owning pool must still be alive and no `&mut` reference to the
    /// same frame may exist for the lifetime of the returned borrow.
    pub(crate) unsafe fn bytes<'a>(self) -> &'a [u8; PAGE_SIZE] {
        &self.0.as_ref().0
    }

    /// # Safety
    ///
    /// The owning pool must still be alive and the caller must hold whatever
    /// lock makes this frame's bytes exclusively theirs (the database
    /// exclusive lock for node content, or the row lock during load and
    /// eviction). No other reference to the frame may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut<'a>(self) -> &'a mut [u8; PAGE_SIZE] {
        &mut (*self.0.as_ptr()).0
    }
}

// SAFETY: FramePtr is a plain address; all access goes through the unsafe
// accessors above whose contracts forbid data races.
unsafe impl Send for FramePtr {}
unsafe impl Sync for FramePtr {}

struct PoolInner {
    blocks: Vec<NonNull<PageBuf>>,
    next_frame: usize,
}

/// Pool of page-aligned frames backed by large blocks.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    fn block_layout() -> Layout {
        // Infallible: size and alignment are compile-time constants.
        Layout::array::<PageBuf>(FRAMES_PER_BLOCK).expect("block layout")
    }

    fn alloc_block() -> Result<NonNull<PageBuf>> {
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(Self::block_layout()) };
        NonNull::new(ptr as *mut PageBuf).ok_or(Error::NoMem("buffer pool block allocation failed"))
    }

    /// Creates the pool with one block already allocated.
    pub fn new() -> Result<Self> {
        let first = Self::alloc_block()?;
        Ok(Self {
            inner: Mutex::new(PoolInner {
                blocks: vec![first],
                next_frame: 0,
            }),
        })
    }

    /// Hands out the next unused frame, allocating a fresh block when the
    /// current one is exhausted.
    pub(crate) fn alloc_frame(&self) -> Result<FramePtr> {
        let mut inner = self.inner.lock();
        if inner.next_frame >= FRAMES_PER_BLOCK {
            let block = Self::alloc_block()?;
            inner.blocks.push(block);
            inner.next_frame = 0;
        }
        let block = *inner.blocks.last().expect("pool holds at least one block");
        let frame = inner.next_frame;
        inner.next_frame += 1;
        // SAFETY: frame < FRAMES_PER_BLOCK, within the block allocation.
        Ok(FramePtr(unsafe { NonNull::new_unchecked(block.as_ptr().add(frame)) }))
    }

    /// Number of blocks currently backing the pool.
    #[cfg(test)]
    fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for block in inner.blocks.drain(..) {
            // SAFETY: every block was allocated with `block_layout` and is
            // freed exactly once here.
            unsafe { dealloc(block.as_ptr() as *mut u8, Self::block_layout()) };
        }
    }
}

// SAFETY: the block list is guarded by the mutex; frames are raw memory whose
// access rules are enforced by FramePtr's unsafe contracts.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_page_aligned_and_distinct() {
        let pool = BufferPool::new().unwrap();
        let mut seen = Vec::new();
        for _ in 0..FRAMES_PER_BLOCK * 3 {
            let frame = pool.alloc_frame().unwrap();
            let addr = unsafe { frame.bytes().as_ptr() } as usize;
            assert_eq!(addr % PAGE_SIZE, 0);
            assert!(!seen.contains(&addr));
            seen.push(addr);
        }
        assert_eq!(pool.block_count(), 3);
    }

    #[test]
    fn frames_start_zeroed() {
        let pool = BufferPool::new().unwrap();
        let frame = pool.alloc_frame().unwrap();
        let bytes = unsafe { frame.bytes() };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn frame_bytes_survive_later_allocations() {
        let pool = BufferPool::new().unwrap();
        let first = pool.alloc_frame().unwrap();
        unsafe { first.bytes_mut()[0] = 0xA5 };
        for _ in 0..FRAMES_PER_BLOCK * 2 {
            pool.alloc_frame().unwrap();
        }
        assert_eq!(unsafe { first.bytes()[0] }, 0xA5);
    }
}

//! # Storage Layer
//!
//! The foundations the tree engine sits on:
//!
//! - `pool`: page-aligned frame allocation in large blocks
//! - `io`: positional file reads and writes plus flush
//! - `page`: the on-disk page format, checksums and the slotted in-page
//!   allocator with compaction
//! - `cache`: the set-associative page cache with per-row locks, pin counts
//!   and eviction
//!
//! All node access flows through the cache: an operation resolves a node
//! reference to a page offset, pins the page, works on the bytes through the
//! pin, and releases it. The header page (page 0) is the one exception; it is
//! permanently resident in the store and shadow-copied for rollback.

pub mod cache;
pub mod io;
pub mod page;
pub mod pool;

pub use cache::PageCache;
pub use io::StoreFile;
pub use page::PageBytes;
pub use pool::BufferPool;

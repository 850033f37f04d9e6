//! # Configuration Constants
//!
//! This module centralizes the layout and sizing constants for the store,
//! grouping interdependent values together. Constants that depend on each
//! other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_COMMON_HDR (20 bytes, shared by header and data pages)
//!       │
//!       ├─> SLOT_ARRAY_OFFSET (26 bytes, data pages: common + top/freelist/count)
//!       │
//!       ├─> KB_PER_PAGE (derived: PAGE_SIZE / 1024)
//!       │
//!       └─> MAX_FILE_PAGES (derived: 2 GiB limit of 32-bit offsets)
//!
//! BLOCK_SIZE (64 KiB)
//!       │
//!       └─> FRAMES_PER_BLOCK (derived: BLOCK_SIZE / PAGE_SIZE)
//!
//! CACHE_WAYS (8)
//!       │
//!       └─> MIN_CACHE_KB (64; at least two rows of eight pages)
//! ```
//!
//! ## Critical Invariants
//!
//! These are enforced by compile-time assertions below:
//!
//! 1. `PAGE_SIZE` is a power of two (offset masking relies on it)
//! 2. `BLOCK_SIZE` is a whole multiple of `PAGE_SIZE`
//! 3. The minimum cache holds at least two rows

// ============================================================================
// PAGE LAYOUT
// These define the fundamental page structure used throughout the store
// ============================================================================

/// Size of each page in bytes. This is the unit of I/O and caching, and the
/// alignment of every buffer-pool frame.
pub const PAGE_SIZE: usize = 4096;

/// Size of the prefix shared by the header page and data pages: checksum,
/// pin word, page offset, pad, status, kind and reserved bytes.
pub const PAGE_COMMON_HDR: usize = 20;

/// Byte offset of the slot index array in a data page. The common prefix is
/// followed by `top`, `slot_freelist` and `slot_count` (2 bytes each).
pub const SLOT_ARRAY_OFFSET: usize = 26;

/// Pages a 32-bit offset file can address before the 2 GiB boundary.
pub const MAX_FILE_PAGES: u32 = (0x8000_0000u64 / PAGE_SIZE as u64 - 1) as u32;

/// Kilobytes per page, used to translate cache sizes into frame counts.
pub const KB_PER_PAGE: usize = PAGE_SIZE / 1024;

const _: () = assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");

// ============================================================================
// BUFFER POOL
// ============================================================================

/// Size of one buffer-pool block. Frames are carved out of these blocks and
/// are never returned individually.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Page frames per buffer-pool block.
pub const FRAMES_PER_BLOCK: usize = BLOCK_SIZE / PAGE_SIZE;

const _: () = assert!(
    BLOCK_SIZE % PAGE_SIZE == 0,
    "BLOCK_SIZE must be a whole number of pages"
);

// ============================================================================
// PAGE CACHE
// ============================================================================

/// Associativity of one cache row.
pub const CACHE_WAYS: usize = 8;

/// Items added to a row when eviction finds no victim.
pub const CACHE_ROW_GROWTH: usize = 4;

/// Smallest accepted cache size in kilobytes.
pub const MIN_CACHE_KB: usize = 64;

/// Default cache size used by `StoreOptions` when none is given.
pub const DEFAULT_CACHE_KB: usize = 256;

/// Row-mixing multiplier for page offsets (L'Ecuyer 1999). Chosen so that
/// adjacent page offsets scatter across rows.
pub const ROW_HASH_MULTIPLIER: u32 = 1_597_334_677;

const _: () = assert!(
    MIN_CACHE_KB / (KB_PER_PAGE * CACHE_WAYS) >= 2,
    "minimum cache must hold at least two rows"
);

// ============================================================================
// TREES AND NODES
// ============================================================================

/// Upper bound on AVL tree height. A tree of this height holds more than
/// 10^10 nodes, so hitting the bound indicates corruption.
pub const MAX_TREE_HEIGHT: usize = 64;

/// Longest accepted node name in bytes.
pub const MAX_KEY_LEN: usize = 240;

/// Largest stored string payload in bytes, including the trailing NUL.
pub const MAX_STRING_LEN: usize = 250;

/// Largest stored binary payload in bytes.
pub const MAX_BINARY_LEN: usize = 250;

/// Entries in the header's page-pool table: two buckets (key, value) for each
/// of 128 depth levels. Depths of 128 and beyond collapse into the last pair.
pub const PAGE_POOL_SLOTS: usize = 256;

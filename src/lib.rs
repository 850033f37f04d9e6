//! # hivestore - Embeddable Hierarchical Key/Value Store
//!
//! A single-file persistent tree of keys in the style of the Windows
//! registry. Every key holds an ordered set of child keys and an ordered set
//! of typed values: int32, int64, double, short strings, short binaries, and
//! cross-references called links. Both sets are AVL trees whose nodes live
//! inside fixed 4096-byte pages; a set-associative page cache with eviction
//! mediates all file I/O.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hivestore::{Key, NodeId, Store, SubTree};
//!
//! let store = Store::options()
//!     .create(true)
//!     .cache_kb(256)
//!     .open("settings.hive")?;
//!
//! let app = store.create_key(NodeId::ROOT, &Key::new(b"app"))?;
//! store.create_string(app, &Key::new(b"theme"), "dark")?;
//! store.create_int32(app, &Key::new(b"retries"), 3)?;
//! store.commit(true)?;
//!
//! let theme = store.find(app, &Key::new(b"theme"), SubTree::Values)?;
//! assert_eq!(store.get_string(theme)?, "dark");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Public API (Store / Cursor)        │
//! ├──────────────────────────────────────┤
//! │   Concurrency (upgradable RwLock,    │
//! │   commit / rollback, shadow header)  │
//! ├──────────────────────────────────────┤
//! │   AVL Operator + In-Order Cursor     │
//! ├──────────────────────────────────────┤
//! │   Node Model (slotted records)       │
//! ├──────────────────────────────────────┤
//! │   Page Cache (set-associative,       │
//! │   pins, eviction) + Buffer Pool      │
//! ├──────────────────────────────────────┤
//! │   Positional File I/O                │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Changes accumulate in cached pages and reach the file at `commit` (or
//! when autosave eviction writes a dirty page early). Any failure on a write
//! path rolls the store back to the last committed state. There are no
//! multi-operation transactions and a single writer is assumed at any
//! instant; readers run in parallel under the shared lock.
//!
//! ## Module Overview
//!
//! - [`storage`]: buffer pool, positional I/O, page format, page cache
//! - [`node`]: node variants, name ordering, pinned node access
//! - [`tree`]: AVL search/insert/delete and the in-order cursor
//! - [`store`]: the public surface, locking, commit and rollback

pub mod config;
pub mod error;
pub mod node;
pub mod storage;
pub mod store;
pub mod tree;

pub use error::{Error, Result};
pub use node::{Key, NodeId, NodeType, Value};
pub use store::{Store, StoreOptions};
pub use tree::cursor::{Cursor, Order};
pub use tree::SubTree;

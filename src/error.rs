//! Error types for the store.
//!
//! Every public operation either completes and returns `Ok`, or returns one
//! of the variants below and leaves the database in its last committed state.
//! Deeply nested failures on the write path bubble up through `Result` to a
//! single catch site in the store, which runs rollback before the database
//! lock is released.

use std::io;

use thiserror::Error;

/// Result type for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A supplied argument is invalid.
    #[error("invalid parameter: {0}")]
    Param(&'static str),

    /// The operation expected a different node type.
    #[error("node type mismatch")]
    Mismatch,

    /// Memory allocation failed.
    #[error("out of memory: {0}")]
    NoMem(&'static str),

    /// The named node was not found.
    #[error("node not found")]
    NotFound,

    /// A node with the given name already exists.
    #[error("node with specified name already exists")]
    Exists,

    /// I/O error while reading or writing the file.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Data file corruption detected.
    #[error("data file corruption detected: {0}")]
    Corrupt(&'static str),

    /// The operation is not valid for the current state, for example
    /// deleting a key that still has children or values.
    #[error("invalid operation: {0}")]
    InvOper(&'static str),

    /// An internal invariant was broken.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// The operation was aborted, for example when a dirty page must be
    /// evicted but the store was opened without autosave.
    #[error("operation aborted: {0}")]
    Abort(&'static str),
}

impl Error {
    /// Returns true for errors that indicate on-disk or in-memory corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::Internal(_))
    }

    /// Returns true when the error only reports an absent node.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

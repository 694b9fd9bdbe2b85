//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by storage backends and file helpers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A file that was expected to exist is missing.
    #[error("file not found: {}", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to grow a store through truncation.
    #[error("cannot truncate to {requested} bytes, store holds only {size}")]
    TruncateBeyondEnd {
        /// The requested length.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// The backend was opened read-only.
    #[error("storage is read-only: {description}")]
    ReadOnly {
        /// Which backend rejected the write.
        description: String,
    },
}

//! Storage backend trait definition.

use crate::error::StorageResult;
use std::fmt;

/// An append-only byte store.
///
/// The engine writes every file it owns through this trait: record store
/// data files, the bootstrap log and WAL segments. Bytes, once appended,
/// are never rewritten in place. The only destructive operation is
/// [`truncate`](Self::truncate), used to cut away a torn tail left behind
/// by a crash.
///
/// # Invariants
///
/// - `append` returns the offset at which the slice starts
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, every appended byte survives process termination
/// - implementations are `Send + Sync`; readers may share a backend with
///   the single writer
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// when the range is not fully inside the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the backend is read-only.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Returns the number of bytes in the store.
    ///
    /// This is the offset the next `append` will write at.
    fn len(&self) -> u64;

    /// Returns `true` when nothing has been appended yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every appended byte durable, including file length metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS reports a failed sync.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the store down to `new_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TruncateBeyondEnd`](crate::StorageError::TruncateBeyondEnd)
    /// when `new_len` exceeds the current length.
    fn truncate(&mut self, new_len: u64) -> StorageResult<()>;

    /// A human readable name for logs and error messages.
    fn describe(&self) -> String;
}

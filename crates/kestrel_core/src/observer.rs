//! Hooks for observing durable storage events.
//!
//! The engine calls an injected [`StorageObserver`] at each durable state
//! transition. Every method has an empty default so implementors only
//! override what they care about. Observers are called on the writer's
//! thread (or the purge worker for removals) and must not block.

use crate::bootstrap::BootstrapRecord;
use crate::compaction::CompactionResult;
use crate::offset_index::OffsetIndexDescriptor;
use crate::types::{CatalogVersion, FileLocation};
use std::path::Path;

/// Receives storage events.
pub trait StorageObserver: Send + Sync + std::fmt::Debug {
    /// A record store sealed a new descriptor.
    fn record_store_flushed(&self, file: &str, descriptor: &OffsetIndexDescriptor) {
        let _ = (file, descriptor);
    }

    /// A catalog or collection header was written.
    fn header_written(&self, file: &str, version: CatalogVersion, location: FileLocation) {
        let _ = (file, version, location);
    }

    /// A bootstrap record was committed.
    fn bootstrap_appended(&self, record: &BootstrapRecord) {
        let _ = record;
    }

    /// A file was rewritten into a new generation.
    fn compaction_finished(&self, result: &CompactionResult) {
        let _ = result;
    }

    /// A superseded file was deleted.
    fn obsolete_file_removed(&self, path: &Path, version: CatalogVersion) {
        let _ = (path, version);
    }

    /// The bootstrap log was trimmed; `first` is the oldest retained record.
    fn bootstrap_trimmed(&self, first: &BootstrapRecord) {
        let _ = first;
    }

    /// A new WAL segment was started.
    fn wal_rotated(&self, index: u32) {
        let _ = index;
    }
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StorageObserver for NoopObserver {}

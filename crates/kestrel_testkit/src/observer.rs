//! An observer that records every storage event.

use kestrel_core::{
    BootstrapRecord, CatalogVersion, CompactionResult, FileLocation, OffsetIndexDescriptor,
    StorageObserver,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// One observed event.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    /// A record store sealed a descriptor.
    Flushed {
        /// File name.
        file: String,
        /// Version of the descriptor.
        version: CatalogVersion,
    },
    /// A header record was written.
    HeaderWritten {
        /// File name.
        file: String,
        /// Header version.
        version: CatalogVersion,
    },
    /// A bootstrap record was committed.
    BootstrapAppended(BootstrapRecord),
    /// A compaction finished.
    Compacted {
        /// Source file.
        source: String,
        /// Version of the copy.
        version: CatalogVersion,
    },
    /// A superseded file was deleted.
    FileRemoved {
        /// Deleted path.
        path: PathBuf,
        /// Version it was retired at.
        version: CatalogVersion,
    },
    /// The bootstrap log was trimmed.
    BootstrapTrimmed(BootstrapRecord),
    /// A WAL segment was started.
    WalRotated(u32),
}

/// Collects [`StorageEvent`]s in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<StorageEvent>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<StorageEvent> {
        self.events.lock().clone()
    }

    /// Forgets the recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Committed bootstrap records, oldest first.
    #[must_use]
    pub fn bootstrap_records(&self) -> Vec<BootstrapRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                StorageEvent::BootstrapAppended(record) => Some(*record),
                _ => None,
            })
            .collect()
    }

    /// Paths deleted by the maintainer.
    #[must_use]
    pub fn removed_files(&self) -> Vec<PathBuf> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                StorageEvent::FileRemoved { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of compactions.
    #[must_use]
    pub fn compaction_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, StorageEvent::Compacted { .. }))
            .count()
    }

    fn push(&self, event: StorageEvent) {
        self.events.lock().push(event);
    }
}

impl StorageObserver for RecordingObserver {
    fn record_store_flushed(&self, file: &str, descriptor: &OffsetIndexDescriptor) {
        self.push(StorageEvent::Flushed {
            file: file.to_string(),
            version: descriptor.version,
        });
    }

    fn header_written(&self, file: &str, version: CatalogVersion, _location: FileLocation) {
        self.push(StorageEvent::HeaderWritten {
            file: file.to_string(),
            version,
        });
    }

    fn bootstrap_appended(&self, record: &BootstrapRecord) {
        self.push(StorageEvent::BootstrapAppended(*record));
    }

    fn compaction_finished(&self, result: &CompactionResult) {
        self.push(StorageEvent::Compacted {
            source: result.source.clone(),
            version: result.version,
        });
    }

    fn obsolete_file_removed(&self, path: &Path, version: CatalogVersion) {
        self.push(StorageEvent::FileRemoved {
            path: path.to_path_buf(),
            version,
        });
    }

    fn bootstrap_trimmed(&self, first: &BootstrapRecord) {
        self.push(StorageEvent::BootstrapTrimmed(*first));
    }

    fn wal_rotated(&self, index: u32) {
        self.push(StorageEvent::WalRotated(index));
    }
}

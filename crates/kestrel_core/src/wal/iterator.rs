//! Streaming replay over WAL segments.

use super::record::WalEntry;
use crate::error::CoreResult;
use crate::record::RecordScanner;
use crate::types::CatalogVersion;
use kestrel_storage::{FileBackend, StorageBackend};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Iterator over the transactions newer than a catalog version.
///
/// Segments are read one at a time, oldest first. Only one segment's
/// entries are buffered at any moment.
///
/// ```ignore
/// for entry in wal.committed_from(header.version)? {
///     let entry = entry?;
///     apply(entry.version, &entry.payload)?;
/// }
/// ```
#[derive(Debug)]
pub struct WalReplay {
    after: CatalogVersion,
    segments: VecDeque<(u32, PathBuf)>,
    require_checksum: bool,
    buffer: VecDeque<WalEntry>,
    failed: bool,
}

impl WalReplay {
    pub(crate) fn new(
        after: CatalogVersion,
        segments: Vec<(u32, PathBuf)>,
        require_checksum: bool,
    ) -> Self {
        Self {
            after,
            require_checksum,
            segments: segments.into(),
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    fn load_next_segment(&mut self) -> CoreResult<bool> {
        let Some((index, path)) = self.segments.pop_front() else {
            return Ok(false);
        };
        let backend = FileBackend::open_read_only(&path)?;
        let source = backend.describe();
        for item in RecordScanner::full(&backend).require_checksum(self.require_checksum) {
            let (location, record) = item?;
            let entry = WalEntry::from_record(&source, index, location, record)?;
            if entry.version > self.after {
                self.buffer.push_back(entry);
            }
        }
        Ok(true)
    }
}

impl Iterator for WalReplay {
    type Item = CoreResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            match self.load_next_segment() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

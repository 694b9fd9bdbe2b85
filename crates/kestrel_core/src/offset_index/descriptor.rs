//! Immutable summaries of a record store.

use crate::types::{CatalogVersion, FileLocation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of a record store as of one flush.
///
/// Produced once per effective flush and never modified afterwards. It is
/// everything needed to reopen the store: where the newest index chunk is,
/// the key dictionary, and the accounting that drives compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetIndexDescriptor {
    /// Catalog version of the flush that produced this descriptor.
    pub version: CatalogVersion,
    /// Location of the newest index chunk; `None` for a store never flushed.
    pub index_location: Option<FileLocation>,
    /// Key dictionary of the store's parts.
    pub key_dictionary: BTreeMap<i32, String>,
    /// Number of live records.
    pub living_record_count: u64,
    /// Bytes occupied by live records.
    pub living_record_size: u64,
    /// Bytes of every data record ever appended, live or superseded.
    pub written_record_size: u64,
    /// Length of the file right after the flush.
    pub file_size: u64,
    /// Size of the largest live record.
    pub max_record_size: u32,
}

impl OffsetIndexDescriptor {
    /// Descriptor of a store that has never been flushed.
    #[must_use]
    pub fn empty(version: CatalogVersion) -> Self {
        Self {
            version,
            index_location: None,
            key_dictionary: BTreeMap::new(),
            living_record_count: 0,
            living_record_size: 0,
            written_record_size: 0,
            file_size: 0,
            max_record_size: 0,
        }
    }

    /// Fraction of data bytes that still belong to live records.
    ///
    /// Index chunks and header records are bookkeeping and do not count
    /// either way. A store without data reports 1.0.
    #[must_use]
    pub fn active_record_share(&self) -> f64 {
        if self.written_record_size == 0 {
            1.0
        } else {
            self.living_record_size as f64 / self.written_record_size as f64
        }
    }
}

/// Result of a full checksum scan of one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileStatistics {
    /// Records found in the file.
    pub record_count: u64,
    /// Data records, live or superseded.
    pub data_records: u64,
    /// Index chunks.
    pub index_chunks: u64,
    /// Header records.
    pub root_records: u64,
    /// Length of the file.
    pub file_size: u64,
    /// Live records according to the index.
    pub living_records: u64,
    /// Live share according to the index.
    pub active_record_share: f64,
    /// Whether the scan ended at an incomplete record.
    pub torn_tail: bool,
}

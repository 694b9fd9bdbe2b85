//! WAL entries.

use crate::error::{CoreError, CoreResult};
use crate::record::{RecordControl, StorageRecord};
use crate::types::{CatalogVersion, FileLocation};

/// One committed transaction as stored in a WAL segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Catalog version of the transaction.
    pub version: CatalogVersion,
    /// Segment holding the entry.
    pub file_index: u32,
    /// Location inside the segment.
    pub location: FileLocation,
    /// Opaque mutation blob.
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Frames a transaction blob as a storage record.
    pub(crate) fn to_record(version: CatalogVersion, payload: Vec<u8>) -> StorageRecord {
        StorageRecord::new(RecordControl::CLOSES_TRANSACTION, version.as_u64(), payload)
    }

    /// Unwraps a storage record read from segment `file_index`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptedRecord`] if the record does not close
    /// a transaction.
    pub(crate) fn from_record(
        source: &str,
        file_index: u32,
        location: FileLocation,
        record: StorageRecord,
    ) -> CoreResult<Self> {
        if !record.control.contains(RecordControl::CLOSES_TRANSACTION) {
            return Err(CoreError::corrupted(
                source,
                Some(location),
                "WAL record does not close a transaction",
            ));
        }
        Ok(Self {
            version: CatalogVersion::new(record.generation),
            file_index,
            location,
            payload: record.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let record = WalEntry::to_record(CatalogVersion::new(4), b"tx".to_vec());
        let location = FileLocation::new(0, 19);
        let entry = WalEntry::from_record("test", 2, location, record).unwrap();
        assert_eq!(entry.version, CatalogVersion::new(4));
        assert_eq!(entry.file_index, 2);
        assert_eq!(entry.payload, b"tx");
    }

    #[test]
    fn rejects_foreign_records() {
        let record = StorageRecord::new(RecordControl::ROOT, 1, Vec::new());
        assert!(WalEntry::from_record("test", 0, FileLocation::new(0, 17), record).is_err());
    }
}

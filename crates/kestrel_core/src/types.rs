//! Core type definitions for Kestrel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one durable, consistent catalog snapshot.
///
/// Catalog versions only grow. Version 0 is the warm-up version: the catalog
/// is being bulk loaded by a single writer and no historical readers exist.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CatalogVersion(pub u64);

impl CatalogVersion {
    /// The warm-up version.
    pub const WARM_UP: Self = Self(0);

    /// Creates a catalog version.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the raw version value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CatalogVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{}", self.0)
    }
}

/// A byte range inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileLocation {
    /// Offset of the first byte.
    pub start: u64,
    /// Length in bytes.
    pub length: u32,
}

impl FileLocation {
    /// Creates a location.
    #[must_use]
    pub const fn new(start: u64, length: u32) -> Self {
        Self { start, length }
    }

    /// Offset one past the last byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length as u64
    }

    /// Returns `true` if the two ranges share at least one byte.
    #[must_use]
    pub const fn overlaps(&self, other: &FileLocation) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}+{}", self.start, self.length)
    }
}

/// Address of a storage part inside one record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// On-disk record type id.
    pub record_type: u8,
    /// Primary key, unique within the record type.
    pub primary_key: i64,
}

impl RecordKey {
    /// Creates a record key.
    #[must_use]
    pub const fn new(record_type: u8, primary_key: i64) -> Self {
        Self {
            record_type,
            primary_key,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.record_type, self.primary_key)
    }
}

/// Lifecycle state of a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatalogState {
    /// Bulk loading at version 0: single writer, no WAL, immediate reclamation.
    WarmingUp,
    /// Transactional: versioned, WAL-backed, deferred reclamation.
    Alive,
}

impl fmt::Display for CatalogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WarmingUp => f.write_str("WARMING_UP"),
            Self::Alive => f.write_str("ALIVE"),
        }
    }
}

/// Milliseconds since the Unix epoch, as stored in bootstrap records.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_version_ordering() {
        let v1 = CatalogVersion::new(1);
        assert!(CatalogVersion::WARM_UP < v1);
        assert_eq!(v1.next().as_u64(), 2);
        assert_eq!(format!("{v1}"), "v:1");
    }

    #[test]
    fn file_location_overlap() {
        let a = FileLocation::new(0, 10);
        let b = FileLocation::new(10, 5);
        let c = FileLocation::new(9, 2);
        assert_eq!(a.end(), 10);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn record_key_ordering_groups_types() {
        let a = RecordKey::new(16, 100);
        let b = RecordKey::new(17, -5);
        assert!(a < b);
        assert_eq!(a.to_string(), "16:100");
    }

    #[test]
    fn state_display() {
        assert_eq!(CatalogState::WarmingUp.to_string(), "WARMING_UP");
        assert_eq!(CatalogState::Alive.to_string(), "ALIVE");
    }
}

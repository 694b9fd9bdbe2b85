//! Error types for Kestrel core.

use crate::types::{CatalogVersion, FileLocation};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// What a temporal lookup asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalTarget {
    /// A wall-clock moment in milliseconds since the epoch.
    Moment(i64),
    /// A catalog version.
    Version(CatalogVersion),
}

impl std::fmt::Display for TemporalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Moment(millis) => write!(f, "moment {millis}ms"),
            Self::Version(version) => write!(f, "version {version}"),
        }
    }
}

/// Errors that can occur in Kestrel core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] kestrel_storage::StorageError),

    /// Payload codec error.
    #[error("codec error: {0}")]
    Codec(#[from] kestrel_codec::CodecError),

    /// Unexpected I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record is truncated or structurally invalid.
    #[error("corrupted record in {file} at {location:?}: {message}")]
    CorruptedRecord {
        /// File the record was read from.
        file: String,
        /// Location of the record, if known.
        location: Option<FileLocation>,
        /// Description of the damage.
        message: String,
    },

    /// A record's CRC32C does not match its contents.
    #[error("checksum mismatch in {file} at {location}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// File the record was read from.
        file: String,
        /// Location of the record.
        location: FileLocation,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// No durable snapshot exists for the requested point in time.
    #[error("temporal data not available for {requested}")]
    TemporalDataNotAvailable {
        /// What was requested.
        requested: TemporalTarget,
    },

    /// The stored protocol version is newer than this engine understands.
    #[error("unsupported storage protocol version {found} (engine supports up to {supported})")]
    UnsupportedProtocolVersion {
        /// Version found on disk.
        found: u32,
        /// Newest version this engine reads.
        supported: u32,
    },

    /// The header on disk belongs to a different catalog.
    #[error("catalog identity mismatch: expected `{expected}`, found `{found}`")]
    CatalogIdentityMismatch {
        /// Catalog name that was opened.
        expected: String,
        /// Catalog name stored in the header.
        found: String,
    },

    /// Invalid file format or naming.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// An internal invariant does not hold. Indicates an engine bug.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// What went wrong.
        message: String,
    },

    /// A part that must exist is missing.
    #[error("record {record_type}:{primary_key} not found")]
    RecordNotFound {
        /// Record type id.
        record_type: u8,
        /// Primary key.
        primary_key: i64,
    },

    /// An entity collection does not exist.
    #[error("entity collection not found: {entity_type}")]
    CollectionNotFound {
        /// Entity type name.
        entity_type: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Another handle holds the catalog directory lock.
    #[error("catalog locked: another handle has exclusive access")]
    CatalogLocked,

    /// A header migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The store or catalog was closed.
    #[error("storage is closed")]
    Closed,
}

impl CoreError {
    /// Creates a corrupted record error.
    pub fn corrupted(
        file: impl Into<String>,
        location: Option<FileLocation>,
        message: impl Into<String>,
    ) -> Self {
        Self::CorruptedRecord {
            file: file.into(),
            location,
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Returns `true` for checksum and truncation damage.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptedRecord { .. } | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_error_mentions_target() {
        let err = CoreError::TemporalDataNotAvailable {
            requested: TemporalTarget::Moment(42),
        };
        assert_eq!(err.to_string(), "temporal data not available for moment 42ms");
    }

    #[test]
    fn corruption_classification() {
        assert!(CoreError::corrupted("a.entity", None, "short").is_corruption());
        assert!(!CoreError::invariant("bug").is_corruption());
    }
}

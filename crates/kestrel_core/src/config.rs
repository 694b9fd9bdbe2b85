//! Storage configuration.

use crate::error::{CoreError, CoreResult};

/// Options shared by every persistence service of one catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageOptions {
    /// Whether records carry and verify CRC32C checksums.
    pub compute_crc32c: bool,

    /// Whether flushes fsync the data files they touched.
    pub sync_writes: bool,

    /// Compaction becomes possible once the live share of a file drops
    /// below this fraction.
    pub min_active_record_share: f64,

    /// Files smaller than this are never compacted.
    pub file_size_compaction_threshold: u64,

    /// Retain every superseded generation until the bootstrap log is trimmed.
    pub time_travel_enabled: bool,

    /// WAL segments rotate once they grow past this size.
    pub max_wal_file_size: u64,

    /// Largest payload a single record may carry.
    pub max_record_size: u32,

    /// Staged payloads held in memory beyond this are spilled to the data
    /// file before the next flush.
    pub max_trapped_bytes: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            compute_crc32c: true,
            sync_writes: true,
            min_active_record_share: 0.5,
            file_size_compaction_threshold: 100 * 1024 * 1024, // 100 MB
            time_travel_enabled: false,
            max_wal_file_size: 16 * 1024 * 1024, // 16 MB
            max_record_size: 16 * 1024 * 1024,   // 16 MB
            max_trapped_bytes: 8 * 1024 * 1024,  // 8 MB
        }
    }
}

impl StorageOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether checksums are computed and verified.
    #[must_use]
    pub const fn compute_crc32c(mut self, value: bool) -> Self {
        self.compute_crc32c = value;
        self
    }

    /// Sets whether flushes fsync.
    #[must_use]
    pub const fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Sets the live-share compaction trigger.
    #[must_use]
    pub const fn min_active_record_share(mut self, share: f64) -> Self {
        self.min_active_record_share = share;
        self
    }

    /// Sets the minimal file size considered for compaction.
    #[must_use]
    pub const fn file_size_compaction_threshold(mut self, bytes: u64) -> Self {
        self.file_size_compaction_threshold = bytes;
        self
    }

    /// Enables or disables time-travel retention.
    #[must_use]
    pub const fn time_travel_enabled(mut self, value: bool) -> Self {
        self.time_travel_enabled = value;
        self
    }

    /// Sets the WAL rotation size.
    #[must_use]
    pub const fn max_wal_file_size(mut self, bytes: u64) -> Self {
        self.max_wal_file_size = bytes;
        self
    }

    /// Sets the largest accepted record payload.
    #[must_use]
    pub const fn max_record_size(mut self, bytes: u32) -> Self {
        self.max_record_size = bytes;
        self
    }

    /// Sets the in-memory staging limit.
    #[must_use]
    pub const fn max_trapped_bytes(mut self, bytes: usize) -> Self {
        self.max_trapped_bytes = bytes;
        self
    }

    /// Checks the options for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] describing the first bad value.
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.min_active_record_share > 0.0 && self.min_active_record_share <= 1.0) {
            return Err(CoreError::invalid_operation(format!(
                "min_active_record_share must be in (0, 1], got {}",
                self.min_active_record_share
            )));
        }
        if self.max_wal_file_size == 0 {
            return Err(CoreError::invalid_operation("max_wal_file_size must be positive"));
        }
        if self.max_record_size == 0 {
            return Err(CoreError::invalid_operation("max_record_size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = StorageOptions::default();
        assert!(options.compute_crc32c);
        assert!(options.sync_writes);
        assert!(!options.time_travel_enabled);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let options = StorageOptions::new()
            .time_travel_enabled(true)
            .min_active_record_share(0.3)
            .file_size_compaction_threshold(1024);

        assert!(options.time_travel_enabled);
        assert_eq!(options.file_size_compaction_threshold, 1024);
        assert!((options.min_active_record_share - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_share_rejected() {
        assert!(StorageOptions::new()
            .min_active_record_share(0.0)
            .validate()
            .is_err());
        assert!(StorageOptions::new()
            .min_active_record_share(1.5)
            .validate()
            .is_err());
        assert!(StorageOptions::new().max_wal_file_size(0).validate().is_err());
    }
}

//! The bootstrap log: the durable recovery root of a catalog.
//!
//! `{catalog}.boot` is a sequence of fixed-size storage records. Each one
//! points at the header that is authoritative for a catalog version.
//! Appending a record is the commit point of that version: every data file
//! and WAL write it depends on must already be durable.
//!
//! Fixed sizing gives positional addressing (`offset = index * 53`) and
//! binary search over versions and timestamps.
//!
//! Payload layout (36 bytes, little endian):
//!
//! ```text
//! storage_protocol_version: i32
//! catalog_version:          i64
//! catalog_file_index:       i32
//! timestamp_millis:         i64
//! header_start:             i64   (-1 when the header location is absent)
//! header_length:            i32
//! ```

use crate::error::{CoreError, CoreResult, TemporalTarget};
use crate::record::{read_u32, read_u64, RecordControl, StorageRecord};
use crate::types::{CatalogVersion, FileLocation};
use kestrel_storage::{remove_file_if_exists, replace_file, FileBackend, StorageBackend};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Payload bytes of one bootstrap record.
pub const BOOTSTRAP_PAYLOAD_SIZE: usize = 36;

/// Encoded bytes of one bootstrap record, framing included.
pub const BOOTSTRAP_RECORD_SIZE: usize = StorageRecord::HEADER_SIZE + BOOTSTRAP_PAYLOAD_SIZE;

const COPY_BATCH_RECORDS: u64 = 4096;

/// One durable version pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapRecord {
    /// Protocol version the header was written with.
    pub storage_protocol_version: u32,
    /// Catalog version the header belongs to.
    pub catalog_version: CatalogVersion,
    /// Generation of the catalog file holding the header.
    pub catalog_file_index: u32,
    /// Wall-clock time of the commit.
    pub timestamp_millis: i64,
    /// Location of the header inside the catalog file.
    pub header_location: Option<FileLocation>,
}

impl BootstrapRecord {
    /// Encodes the full framed record.
    ///
    /// # Errors
    ///
    /// Fails if a field does not fit its on-disk width.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let too_wide = |field: &str| CoreError::invalid_operation(format!("{field} too large"));
        let protocol = i32::try_from(self.storage_protocol_version)
            .map_err(|_| too_wide("storage protocol version"))?;
        let version = i64::try_from(self.catalog_version.as_u64())
            .map_err(|_| too_wide("catalog version"))?;
        let file_index =
            i32::try_from(self.catalog_file_index).map_err(|_| too_wide("catalog file index"))?;

        let mut payload = Vec::with_capacity(BOOTSTRAP_PAYLOAD_SIZE);
        payload.extend_from_slice(&protocol.to_le_bytes());
        payload.extend_from_slice(&version.to_le_bytes());
        payload.extend_from_slice(&file_index.to_le_bytes());
        payload.extend_from_slice(&self.timestamp_millis.to_le_bytes());
        match self.header_location {
            Some(location) => {
                let start =
                    i64::try_from(location.start).map_err(|_| too_wide("header offset"))?;
                let length =
                    i32::try_from(location.length).map_err(|_| too_wide("header length"))?;
                payload.extend_from_slice(&start.to_le_bytes());
                payload.extend_from_slice(&length.to_le_bytes());
            }
            None => {
                payload.extend_from_slice(&(-1i64).to_le_bytes());
                payload.extend_from_slice(&0i32.to_le_bytes());
            }
        }
        StorageRecord::new(RecordControl::NONE, self.catalog_version.as_u64(), payload).encode(true)
    }

    /// Decodes a framed record; `index` only feeds error messages.
    ///
    /// # Errors
    ///
    /// Fails on checksum mismatch or malformed fields.
    pub fn decode(data: &[u8], source: &str, index: u64) -> CoreResult<Self> {
        let location = FileLocation::new(
            index * BOOTSTRAP_RECORD_SIZE as u64,
            BOOTSTRAP_RECORD_SIZE as u32,
        );
        let record = StorageRecord::decode(data, source, location, true)?;
        let payload = &record.payload;
        if payload.len() != BOOTSTRAP_PAYLOAD_SIZE {
            return Err(CoreError::corrupted(
                source,
                Some(location),
                format!("bootstrap payload has {} bytes", payload.len()),
            ));
        }
        let protocol = read_u32(payload, 0) as i32;
        let version = read_u64(payload, 4) as i64;
        let file_index = read_u32(payload, 12) as i32;
        let timestamp_millis = read_u64(payload, 16) as i64;
        let header_start = read_u64(payload, 24) as i64;
        let header_length = read_u32(payload, 32) as i32;

        if protocol < 0 || version < 0 || file_index < 0 || header_length < 0 {
            return Err(CoreError::corrupted(
                source,
                Some(location),
                "negative field in bootstrap record",
            ));
        }
        let header_location = (header_start >= 0)
            .then(|| FileLocation::new(header_start as u64, header_length as u32));

        Ok(Self {
            storage_protocol_version: protocol as u32,
            catalog_version: CatalogVersion::new(version as u64),
            catalog_file_index: file_index as u32,
            timestamp_millis,
            header_location,
        })
    }
}

/// Append-only log of [`BootstrapRecord`]s.
#[derive(Debug)]
pub struct BootstrapLog {
    path: PathBuf,
    backend: Box<dyn StorageBackend>,
    record_count: u64,
    last: BootstrapRecord,
}

impl BootstrapLog {
    /// Creates a new log holding `first` as its only record.
    ///
    /// # Errors
    ///
    /// Fails if the file already exists or cannot be written.
    pub fn create(path: &Path, first: BootstrapRecord) -> CoreResult<Self> {
        let mut backend = FileBackend::create_new(path)?;
        backend.append(&first.encode()?)?;
        backend.sync()?;
        info!(path = %path.display(), version = %first.catalog_version, "created bootstrap log");
        Ok(Self {
            path: path.to_path_buf(),
            backend: Box::new(backend),
            record_count: 1,
            last: first,
        })
    }

    /// Opens an existing log for appending.
    ///
    /// A partial trailing record is cut away. If the newest whole record
    /// fails its checksum it is treated as a crash-time write: it is cut
    /// away too and the previous record becomes authoritative. Any further
    /// damage fails the open.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, empty or damaged beyond the newest
    /// record.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_backend(path, Box::new(FileBackend::open_existing(path)?))
    }

    /// Opens a log over an existing backend, with the same recovery as
    /// [`open`](Self::open). `path` is where [`trim`](Self::trim) stages
    /// and replaces the file.
    ///
    /// # Errors
    ///
    /// Fails if the backend is empty or damaged beyond the newest record.
    pub fn open_backend(path: &Path, mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let (record_count, last) = recover(backend.as_ref())?;
        let valid_len = record_count * BOOTSTRAP_RECORD_SIZE as u64;
        if backend.len() > valid_len {
            warn!(
                path = %path.display(),
                discarded = backend.len() - valid_len,
                "discarding incomplete bootstrap tail"
            );
            backend.truncate(valid_len)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            backend,
            record_count,
            last,
        })
    }

    /// Opens a log for inspection only; nothing is truncated.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_read_only(path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open_read_only(path)?;
        let (record_count, last) = recover(&backend)?;
        Ok(Self {
            path: path.to_path_buf(),
            backend: Box::new(backend),
            record_count,
            last,
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of valid records.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// The authoritative (newest valid) record.
    #[must_use]
    pub fn last_record(&self) -> BootstrapRecord {
        self.last
    }

    /// Appends a record and fsyncs it.
    ///
    /// Several records may share a catalog version (warm-up flushes,
    /// go-live, protocol upgrades); the newest one wins.
    ///
    /// A failed append or sync is cut back off the log, so a record is
    /// either acknowledged or gone.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] if the version goes
    /// backwards, or an I/O error.
    pub fn append(&mut self, record: BootstrapRecord) -> CoreResult<()> {
        if record.catalog_version < self.last.catalog_version {
            return Err(CoreError::invariant(format!(
                "bootstrap record for {} after {}",
                record.catalog_version, self.last.catalog_version
            )));
        }
        let bytes = record.encode()?;
        let valid_len = self.record_count * BOOTSTRAP_RECORD_SIZE as u64;
        if self.backend.len() != valid_len {
            // an earlier rollback failed
            self.backend.truncate(valid_len)?;
        }
        let written = self
            .backend
            .append(&bytes)
            .and_then(|_| self.backend.sync());
        if let Err(err) = written {
            if self.backend.len() > valid_len {
                if let Err(rollback) = self.backend.truncate(valid_len) {
                    warn!(
                        path = %self.path.display(),
                        error = %rollback,
                        "failed to cut back unacknowledged bootstrap record"
                    );
                }
            }
            return Err(err.into());
        }
        self.record_count += 1;
        self.last = record;
        debug!(
            version = %record.catalog_version,
            file_index = record.catalog_file_index,
            "appended bootstrap record"
        );
        Ok(())
    }

    /// Reads the record at `index`.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range or the record is damaged.
    pub fn record_at(&self, index: u64) -> CoreResult<BootstrapRecord> {
        if index >= self.record_count {
            return Err(CoreError::invalid_operation(format!(
                "bootstrap index {index} out of range ({} records)",
                self.record_count
            )));
        }
        read_record(self.backend.as_ref(), index)
    }

    /// Reads every record, oldest first.
    ///
    /// # Errors
    ///
    /// Fails on the first damaged record.
    pub fn records(&self) -> CoreResult<Vec<BootstrapRecord>> {
        (0..self.record_count)
            .map(|i| read_record(self.backend.as_ref(), i))
            .collect()
    }

    /// The newest record committed at or before `millis`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TemporalDataNotAvailable`] if `millis` precedes
    /// the oldest retained record.
    pub fn version_at_moment(&self, millis: i64) -> CoreResult<BootstrapRecord> {
        let index = self.last_index_where(|r| r.timestamp_millis <= millis)?;
        match index {
            Some(i) => self.record_at(i),
            None => Err(CoreError::TemporalDataNotAvailable {
                requested: TemporalTarget::Moment(millis),
            }),
        }
    }

    /// The newest record for the greatest catalog version `<= version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TemporalDataNotAvailable`] if `version` precedes
    /// the oldest retained record.
    pub fn version_at(&self, version: CatalogVersion) -> CoreResult<BootstrapRecord> {
        let index = self.last_index_where(|r| r.catalog_version <= version)?;
        match index {
            Some(i) => self.record_at(i),
            None => Err(CoreError::TemporalDataNotAvailable {
                requested: TemporalTarget::Version(version),
            }),
        }
    }

    /// Binary search for the last record satisfying a monotone predicate.
    fn last_index_where(
        &self,
        predicate: impl Fn(&BootstrapRecord) -> bool,
    ) -> CoreResult<Option<u64>> {
        let (mut low, mut high) = (0u64, self.record_count);
        while low < high {
            let mid = low + (high - low) / 2;
            if predicate(&read_record(self.backend.as_ref(), mid)?) {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low.checked_sub(1))
    }

    /// Drops every record older than the one that answers
    /// `version_at(min_version)`.
    ///
    /// The surviving tail is copied to `{catalog}.boot.tmp`, fsynced and
    /// renamed over the log. Returns the oldest retained record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TemporalDataNotAvailable`] if nothing is old
    /// enough to anchor `min_version`, or an I/O error. On failure the
    /// original log stays in place.
    pub fn trim(&mut self, min_version: CatalogVersion) -> CoreResult<BootstrapRecord> {
        let Some(first_kept) = self.last_index_where(|r| r.catalog_version <= min_version)? else {
            return Err(CoreError::TemporalDataNotAvailable {
                requested: TemporalTarget::Version(min_version),
            });
        };
        // Keep every record of the anchoring version, not just the newest.
        let anchor = self.record_at(first_kept)?;
        let first_kept = self
            .last_index_where(|r| r.catalog_version < anchor.catalog_version)?
            .map_or(0, |i| i + 1);
        if first_kept == 0 {
            return self.record_at(0);
        }

        let staged = self.path.with_extension("boot.tmp");
        remove_file_if_exists(&staged)?;
        {
            let mut copy = FileBackend::create_new(&staged)?;
            let mut index = first_kept;
            while index < self.record_count {
                let batch = COPY_BATCH_RECORDS.min(self.record_count - index);
                let bytes = self.backend.read_at(
                    index * BOOTSTRAP_RECORD_SIZE as u64,
                    (batch as usize) * BOOTSTRAP_RECORD_SIZE,
                )?;
                copy.append(&bytes)?;
                index += batch;
            }
            copy.sync()?;
        }
        replace_file(&staged, &self.path)?;

        self.backend = Box::new(FileBackend::open_existing(&self.path)?);
        self.record_count -= first_kept;
        let first = read_record(self.backend.as_ref(), 0)?;
        info!(
            path = %self.path.display(),
            dropped = first_kept,
            first_version = %first.catalog_version,
            "trimmed bootstrap log"
        );
        Ok(first)
    }
}

fn read_record(backend: &dyn StorageBackend, index: u64) -> CoreResult<BootstrapRecord> {
    let bytes = backend.read_at(index * BOOTSTRAP_RECORD_SIZE as u64, BOOTSTRAP_RECORD_SIZE)?;
    BootstrapRecord::decode(&bytes, &backend.describe(), index)
}

fn recover(backend: &dyn StorageBackend) -> CoreResult<(u64, BootstrapRecord)> {
    let whole = backend.len() / BOOTSTRAP_RECORD_SIZE as u64;
    if whole == 0 {
        return Err(CoreError::corrupted(
            backend.describe(),
            None,
            "bootstrap log holds no complete record",
        ));
    }
    match read_record(backend, whole - 1) {
        Ok(last) => Ok((whole, last)),
        Err(err) if err.is_corruption() && whole > 1 => {
            warn!(file = %backend.describe(), error = %err, "newest bootstrap record damaged, falling back");
            let previous = read_record(backend, whole - 2)?;
            Ok((whole - 1, previous))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn record(version: u64, timestamp: i64) -> BootstrapRecord {
        BootstrapRecord {
            storage_protocol_version: 2,
            catalog_version: CatalogVersion::new(version),
            catalog_file_index: 0,
            timestamp_millis: timestamp,
            header_location: Some(FileLocation::new(version * 100, 40)),
        }
    }

    fn log_with(path: &Path, versions: &[u64]) -> BootstrapLog {
        let mut log = BootstrapLog::create(path, record(versions[0], versions[0] as i64 * 10)).unwrap();
        for v in &versions[1..] {
            log.append(record(*v, *v as i64 * 10)).unwrap();
        }
        log
    }

    #[test]
    fn record_has_fixed_size() {
        assert_eq!(BOOTSTRAP_RECORD_SIZE, 53);
        let bytes = record(1, 5).encode().unwrap();
        assert_eq!(bytes.len(), BOOTSTRAP_RECORD_SIZE);
        assert_eq!(BootstrapRecord::decode(&bytes, "t", 0).unwrap(), record(1, 5));
    }

    #[test]
    fn absent_header_location_roundtrips() {
        let mut warm_up = record(0, 1);
        warm_up.header_location = None;
        let bytes = warm_up.encode().unwrap();
        assert_eq!(BootstrapRecord::decode(&bytes, "t", 0).unwrap().header_location, None);
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("products.boot");
        log_with(&path, &[0, 1, 2]);

        let log = BootstrapLog::open(&path).unwrap();
        assert_eq!(log.record_count(), 3);
        assert_eq!(log.last_record().catalog_version, CatalogVersion::new(2));
        assert_eq!(log.records().unwrap().len(), 3);
    }

    #[test]
    fn version_going_backwards_rejected() {
        let dir = tempdir().unwrap();
        let mut log = log_with(&dir.path().join("c.boot"), &[0, 5]);
        assert!(matches!(
            log.append(record(4, 0)),
            Err(CoreError::InvariantViolation { .. })
        ));
        log.append(record(5, 60)).unwrap();
    }

    #[test]
    fn lookups_by_version_and_moment() {
        let dir = tempdir().unwrap();
        let log = log_with(&dir.path().join("c.boot"), &[0, 2, 4, 6]);

        assert_eq!(log.version_at(CatalogVersion::new(5)).unwrap().catalog_version.as_u64(), 4);
        assert_eq!(log.version_at(CatalogVersion::new(6)).unwrap().catalog_version.as_u64(), 6);
        assert_eq!(log.version_at(CatalogVersion::new(100)).unwrap().catalog_version.as_u64(), 6);
        assert_eq!(log.version_at_moment(25).unwrap().catalog_version.as_u64(), 2);
        assert_eq!(log.version_at_moment(0).unwrap().catalog_version.as_u64(), 0);
    }

    #[test]
    fn moment_before_first_record_is_unavailable() {
        let dir = tempdir().unwrap();
        let log = log_with(&dir.path().join("c.boot"), &[3, 4]);
        assert!(matches!(
            log.version_at_moment(1),
            Err(CoreError::TemporalDataNotAvailable { .. })
        ));
        assert!(matches!(
            log.version_at(CatalogVersion::new(2)),
            Err(CoreError::TemporalDataNotAvailable { .. })
        ));
    }

    #[test]
    fn partial_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.boot");
        log_with(&path, &[0, 1]);
        let partial = record(2, 20).encode().unwrap();
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&partial[..30])
            .unwrap();

        let log = BootstrapLog::open(&path).unwrap();
        assert_eq!(log.record_count(), 2);
        assert_eq!(log.last_record().catalog_version.as_u64(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * 53);
    }

    #[test]
    fn damaged_newest_record_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.boot");
        log_with(&path, &[0, 1, 2]);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut log = BootstrapLog::open(&path).unwrap();
        assert_eq!(log.last_record().catalog_version.as_u64(), 1);
        log.append(record(2, 99)).unwrap();
        assert_eq!(BootstrapLog::open(&path).unwrap().record_count(), 3);
    }

    #[test]
    fn damage_beyond_newest_record_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.boot");
        log_with(&path, &[0, 1, 2]);
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 3] ^= 0xFF;
        bytes[len - 3 - 53] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(BootstrapLog::open(&path).is_err());
    }

    #[test]
    fn empty_log_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.boot");
        std::fs::write(&path, b"").unwrap();
        assert!(BootstrapLog::open(&path).is_err());
        assert!(BootstrapLog::open(&dir.path().join("missing.boot")).is_err());
    }

    #[test]
    fn trim_keeps_anchor_and_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.boot");
        let mut log = log_with(&path, &[0, 0, 1, 2, 3]);

        let first = log.trim(CatalogVersion::new(2)).unwrap();
        assert_eq!(first.catalog_version.as_u64(), 2);
        assert_eq!(log.record_count(), 2);
        assert!(!path.with_extension("boot.tmp").exists());

        log.append(record(4, 40)).unwrap();
        let reopened = BootstrapLog::open(&path).unwrap();
        assert_eq!(reopened.record_count(), 3);
        assert!(reopened.version_at(CatalogVersion::new(1)).is_err());
    }

    #[test]
    fn trim_below_first_record_is_noop() {
        let dir = tempdir().unwrap();
        let mut log = log_with(&dir.path().join("c.boot"), &[0, 0, 1]);
        let first = log.trim(CatalogVersion::new(0)).unwrap();
        assert_eq!(first.catalog_version.as_u64(), 0);
        assert_eq!(log.record_count(), 3);
    }
}

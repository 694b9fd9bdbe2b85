//! WAL segment writer.

use super::iterator::WalReplay;
use super::record::WalEntry;
use crate::config::StorageOptions;
use crate::dir::{parse_wal_file_name, wal_file_name};
use crate::error::{CoreError, CoreResult};
use crate::header::WalFileReference;
use crate::observer::StorageObserver;
use crate::record::{append_record, RecordScanner, StorageRecord};
use crate::types::{CatalogVersion, FileLocation};
use kestrel_storage::{remove_file_if_exists, sync_directory, FileBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// WAL knobs, derived from [`StorageOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalOptions {
    /// Size after which a new segment is started.
    pub max_file_size: u64,
    /// Whether records are checksummed.
    pub compute_crc32c: bool,
    /// Whether every append is fsynced.
    pub sync_writes: bool,
}

impl From<&StorageOptions> for WalOptions {
    fn from(options: &StorageOptions) -> Self {
        Self {
            max_file_size: options.max_wal_file_size,
            compute_crc32c: options.compute_crc32c,
            sync_writes: options.sync_writes,
        }
    }
}

/// What a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Segment index.
    pub index: u32,
    /// Oldest transaction version, if any.
    pub first_version: Option<CatalogVersion>,
    /// Newest transaction version, if any.
    pub last_version: Option<CatalogVersion>,
    /// Number of transactions.
    pub entries: u64,
    /// Segment size in bytes.
    pub size: u64,
}

impl SegmentSummary {
    fn empty(index: u32) -> Self {
        Self {
            index,
            first_version: None,
            last_version: None,
            entries: 0,
            size: 0,
        }
    }

    fn record(&mut self, version: CatalogVersion, end: u64) {
        self.first_version.get_or_insert(version);
        self.last_version = Some(version);
        self.entries += 1;
        self.size = end;
    }
}

/// Called when the bootstrap log drops its oldest records.
pub trait WalPurgeCallback: Send + Sync {
    /// Drops WAL data that no header at or after `first_retained` can
    /// replay. Returns the number of removed segments.
    ///
    /// # Errors
    ///
    /// Fails if a segment cannot be deleted.
    fn purge_up_to(&self, first_retained: CatalogVersion) -> CoreResult<usize>;
}

#[derive(Debug)]
struct WalState {
    active: FileBackend,
    active_index: u32,
    segments: BTreeMap<u32, SegmentSummary>,
    last_location: Option<FileLocation>,
}

/// The WAL of one catalog.
#[derive(Debug)]
pub struct CatalogWal {
    dir: PathBuf,
    catalog_name: String,
    options: WalOptions,
    observer: Arc<dyn StorageObserver>,
    state: Mutex<WalState>,
}

impl CatalogWal {
    /// Opens the catalog's WAL, creating segment 0 if there is none.
    ///
    /// Every segment is scanned. A torn record at the end of the newest
    /// segment is cut away.
    ///
    /// # Errors
    ///
    /// Fails if a segment is damaged or cannot be read.
    pub fn open(
        dir: &Path,
        catalog_name: &str,
        options: WalOptions,
        observer: Arc<dyn StorageObserver>,
    ) -> CoreResult<Self> {
        let mut indexes = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| parse_wal_file_name(catalog_name, name))
            {
                indexes.push(index);
            }
        }
        indexes.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut last_location = None;
        let newest = indexes.last().copied();
        for &index in &indexes {
            let path = dir.join(wal_file_name(catalog_name, index));
            let mut backend = FileBackend::open_existing(&path)?;
            let (summary, last, valid_end) = scan_segment(&backend, index, options.compute_crc32c)?;
            if valid_end < backend.len() {
                if Some(index) != newest {
                    return Err(CoreError::corrupted(
                        backend.describe(),
                        None,
                        format!("sealed WAL segment is torn at {valid_end}"),
                    ));
                }
                warn!(path = %path.display(), discarded = backend.len() - valid_end, "discarding torn WAL tail");
                backend.truncate(valid_end)?;
            }
            if last.is_some() {
                last_location = last;
            }
            segments.insert(index, summary);
        }

        let active_index = newest.unwrap_or(0);
        let active_path = dir.join(wal_file_name(catalog_name, active_index));
        let active = if newest.is_some() {
            FileBackend::open_existing(&active_path)?
        } else {
            let created = FileBackend::create_new(&active_path)?;
            sync_directory(dir)?;
            segments.insert(0, SegmentSummary::empty(0));
            info!(path = %active_path.display(), "created WAL segment");
            created
        };
        // The last location only belongs to the active segment.
        if segments.get(&active_index).is_some_and(|s| s.entries == 0) {
            last_location = None;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            catalog_name: catalog_name.to_string(),
            options,
            observer,
            state: Mutex::new(WalState {
                active,
                active_index,
                segments,
                last_location,
            }),
        })
    }

    /// Reference to the end of the log.
    #[must_use]
    pub fn reference(&self) -> WalFileReference {
        let state = self.state.lock();
        WalFileReference {
            catalog_name: self.catalog_name.clone(),
            file_index: state.active_index,
            last_location: state.last_location,
        }
    }

    /// Newest transaction version in the log.
    #[must_use]
    pub fn last_version(&self) -> Option<CatalogVersion> {
        self.state
            .lock()
            .segments
            .values()
            .rev()
            .find_map(|s| s.last_version)
    }

    /// Summaries of all segments, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentSummary> {
        self.state.lock().segments.values().copied().collect()
    }

    /// Checks that a reference from a header points at data this log holds.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptedRecord`] if the segment is missing or
    /// shorter than the referenced location.
    pub fn validate_reference(&self, reference: &WalFileReference) -> CoreResult<()> {
        let state = self.state.lock();
        let file = wal_file_name(&reference.catalog_name, reference.file_index);
        let Some(segment) = state.segments.get(&reference.file_index) else {
            return Err(CoreError::corrupted(file, None, "referenced WAL segment is missing"));
        };
        if let Some(location) = reference.last_location {
            if location.end() > segment.size {
                return Err(CoreError::corrupted(
                    file,
                    Some(location),
                    format!("WAL segment holds only {} bytes", segment.size),
                ));
            }
        }
        Ok(())
    }

    /// Appends one transaction and returns the new end reference.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] if `version` is older than
    /// the last appended transaction, or an I/O error.
    pub fn append(&self, version: CatalogVersion, payload: Vec<u8>) -> CoreResult<WalFileReference> {
        let mut state = self.state.lock();
        let newest = state.segments.values().rev().find_map(|s| s.last_version);
        if let Some(newest) = newest {
            if version < newest {
                return Err(CoreError::invariant(format!(
                    "WAL append at {version} after {newest}"
                )));
            }
        }

        let record = WalEntry::to_record(version, payload);
        let encoded = StorageRecord::encoded_len(record.payload.len()) as u64;
        if !state.active.is_empty() && state.active.len() + encoded > self.options.max_file_size {
            self.rotate(&mut state)?;
        }

        let location = append_record(&mut state.active, &record, self.options.compute_crc32c)?;
        if self.options.sync_writes {
            state.active.sync()?;
        }
        let index = state.active_index;
        state
            .segments
            .entry(index)
            .or_insert_with(|| SegmentSummary::empty(index))
            .record(version, location.end());
        state.last_location = Some(location);
        debug!(version = %version, file_index = index, location = %location, "appended WAL entry");

        Ok(WalFileReference {
            catalog_name: self.catalog_name.clone(),
            file_index: index,
            last_location: Some(location),
        })
    }

    fn rotate(&self, state: &mut WalState) -> CoreResult<()> {
        state.active.sync()?;
        let next = state.active_index + 1;
        let path = self.dir.join(wal_file_name(&self.catalog_name, next));
        state.active = FileBackend::create_new(&path)?;
        sync_directory(&self.dir)?;
        state.active_index = next;
        state.last_location = None;
        state.segments.insert(next, SegmentSummary::empty(next));
        info!(path = %path.display(), "rotated WAL segment");
        self.observer.wal_rotated(next);
        Ok(())
    }

    /// Fsyncs the active segment.
    ///
    /// # Errors
    ///
    /// Fails if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.state.lock().active.sync()?;
        Ok(())
    }

    /// Replays every transaction newer than `version`, oldest first.
    ///
    /// # Errors
    ///
    /// Fails only if the directory listing is unavailable; read errors are
    /// reported by the iterator.
    pub fn committed_from(&self, version: CatalogVersion) -> CoreResult<WalReplay> {
        let state = self.state.lock();
        let segments = state
            .segments
            .values()
            .filter(|s| s.last_version.is_some_and(|last| last > version))
            .map(|s| (s.index, self.dir.join(wal_file_name(&self.catalog_name, s.index))))
            .collect();
        Ok(WalReplay::new(version, segments, self.options.compute_crc32c))
    }

    /// Deletes sealed segments whose transactions are all at or below
    /// `version`. The active segment is kept.
    ///
    /// # Errors
    ///
    /// Fails if a segment cannot be deleted; segments deleted before the
    /// failure stay deleted.
    pub fn purge_files_up_to(&self, version: CatalogVersion) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let doomed: Vec<u32> = state
            .segments
            .values()
            .filter(|s| s.index != state.active_index)
            .filter(|s| s.last_version.is_none_or(|last| last <= version))
            .map(|s| s.index)
            .collect();
        for index in &doomed {
            let path = self.dir.join(wal_file_name(&self.catalog_name, *index));
            remove_file_if_exists(&path)?;
            state.segments.remove(index);
            info!(path = %path.display(), "purged WAL segment");
        }
        if !doomed.is_empty() {
            sync_directory(&self.dir)?;
        }
        Ok(doomed.len())
    }
}

impl WalPurgeCallback for CatalogWal {
    fn purge_up_to(&self, first_retained: CatalogVersion) -> CoreResult<usize> {
        self.purge_files_up_to(first_retained)
    }
}

fn scan_segment(
    backend: &FileBackend,
    index: u32,
    require_checksum: bool,
) -> CoreResult<(SegmentSummary, Option<FileLocation>, u64)> {
    let source = backend.describe();
    let mut summary = SegmentSummary::empty(index);
    let mut last = None;
    let mut scanner = RecordScanner::full(backend).require_checksum(require_checksum);
    for item in scanner.by_ref() {
        let (location, record) = item?;
        let entry = WalEntry::from_record(&source, index, location, record)?;
        summary.record(entry.version, location.end());
        last = Some(location);
    }
    let valid_end = scanner.valid_end();
    summary.size = valid_end;
    Ok((summary, last, valid_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use tempfile::tempdir;

    fn options(max_file_size: u64) -> WalOptions {
        WalOptions {
            max_file_size,
            compute_crc32c: true,
            sync_writes: false,
        }
    }

    fn open(dir: &Path, max: u64) -> CatalogWal {
        CatalogWal::open(dir, "shop", options(max), Arc::new(NoopObserver)).unwrap()
    }

    fn v(n: u64) -> CatalogVersion {
        CatalogVersion::new(n)
    }

    #[test]
    fn creates_empty_first_segment() {
        let temp = tempdir().unwrap();
        let wal = open(temp.path(), 1024);
        assert!(temp.path().join("shop_0.wal").exists());
        let reference = wal.reference();
        assert_eq!(reference.file_index, 0);
        assert_eq!(reference.last_location, None);
        assert_eq!(wal.last_version(), None);
    }

    #[test]
    fn replays_after_version() {
        let temp = tempdir().unwrap();
        let wal = open(temp.path(), 1024);
        for n in 1..=5 {
            wal.append(v(n), vec![n as u8; 8]).unwrap();
        }
        let versions: Vec<u64> = wal
            .committed_from(v(2))
            .unwrap()
            .map(|e| e.unwrap().version.as_u64())
            .collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[test]
    fn rotates_and_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let wal = open(temp.path(), 64);
            for n in 1..=6 {
                wal.append(v(n), vec![0; 20]).unwrap();
            }
            assert!(wal.segments().len() > 1);
            wal.sync().unwrap();
        }
        let wal = open(temp.path(), 64);
        assert_eq!(wal.last_version(), Some(v(6)));
        let reference = wal.reference();
        assert_eq!(reference.file_index, wal.segments().last().unwrap().index);
        assert!(reference.last_location.is_some());
        wal.validate_reference(&reference).unwrap();
        assert_eq!(wal.committed_from(v(0)).unwrap().count(), 6);
    }

    #[test]
    fn append_must_not_go_back() {
        let temp = tempdir().unwrap();
        let wal = open(temp.path(), 1024);
        wal.append(v(3), b"a".to_vec()).unwrap();
        wal.append(v(3), b"b".to_vec()).unwrap();
        assert!(matches!(
            wal.append(v(2), b"c".to_vec()),
            Err(CoreError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let temp = tempdir().unwrap();
        {
            let wal = open(temp.path(), 1024);
            wal.append(v(1), vec![1; 10]).unwrap();
            wal.append(v(2), vec![2; 10]).unwrap();
        }
        let path = temp.path().join("shop_0.wal");
        let len = fs::metadata(&path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();
        drop(file);

        let wal = open(temp.path(), 1024);
        assert_eq!(wal.last_version(), Some(v(1)));
        assert_eq!(fs::metadata(&path).unwrap().len(), 27);
    }

    #[test]
    fn purge_keeps_active_and_needed_segments() {
        let temp = tempdir().unwrap();
        // Two 37-byte entries fit in one segment.
        let wal = open(temp.path(), 80);
        for n in 1..=6 {
            wal.append(v(n), vec![0; 20]).unwrap();
        }
        let before = wal.segments();
        assert_eq!(before.len(), 3);
        let purged = wal.purge_up_to(v(4)).unwrap();
        assert_eq!(purged, 2);
        assert!(!temp.path().join("shop_0.wal").exists());
        assert!(!temp.path().join("shop_1.wal").exists());
        let versions: Vec<u64> = wal
            .committed_from(v(4))
            .unwrap()
            .map(|e| e.unwrap().version.as_u64())
            .collect();
        assert_eq!(versions, vec![5, 6]);
    }

    #[test]
    fn reference_validation_detects_short_segment() {
        let temp = tempdir().unwrap();
        let wal = open(temp.path(), 1024);
        let reference = WalFileReference {
            catalog_name: "shop".into(),
            file_index: 0,
            last_location: Some(FileLocation::new(0, 40)),
        };
        assert!(wal.validate_reference(&reference).is_err());
        let missing = WalFileReference {
            file_index: 9,
            last_location: None,
            ..reference
        };
        assert!(wal.validate_reference(&missing).is_err());
    }
}

//! The versioned record store.

use super::chunk::IndexChunk;
use super::descriptor::{FileStatistics, OffsetIndexDescriptor};
use crate::config::StorageOptions;
use crate::error::{CoreError, CoreResult};
use crate::record::{append_record, read_u64, RecordControl, RecordScanner, StorageRecord};
use crate::types::{CatalogVersion, FileLocation, RecordKey};
use kestrel_codec::KeyCompressor;
use kestrel_storage::StorageBackend;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bytes in front of every data payload: record type (1) + primary key (8).
pub const KEY_PREFIX_SIZE: usize = 9;

/// Knobs of a single record store, derived from [`StorageOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStoreOptions {
    /// Whether records are checksummed.
    pub compute_crc32c: bool,
    /// Whether flushes fsync.
    pub sync_writes: bool,
    /// Largest accepted part payload.
    pub max_record_size: u32,
    /// Trapped payload bytes that trigger an early spill.
    pub max_trapped_bytes: usize,
}

impl From<&StorageOptions> for RecordStoreOptions {
    fn from(options: &StorageOptions) -> Self {
        Self {
            compute_crc32c: options.compute_crc32c,
            sync_writes: options.sync_writes,
            max_record_size: options.max_record_size,
            max_trapped_bytes: options.max_trapped_bytes,
        }
    }
}

impl Default for RecordStoreOptions {
    fn default() -> Self {
        Self::from(&StorageOptions::default())
    }
}

#[derive(Debug, Clone)]
enum Staged {
    /// Payload still held in memory.
    Trapped(Arc<Vec<u8>>),
    /// Payload appended to the file but not yet indexed.
    Written(FileLocation),
    Removed,
}

#[derive(Debug)]
struct PendingChanges {
    version: CatalogVersion,
    entries: HashMap<RecordKey, Staged>,
    trapped_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    superseded_at: CatalogVersion,
    previous: Option<FileLocation>,
}

#[derive(Debug)]
struct StoreState {
    backend: Box<dyn StorageBackend>,
    committed: HashMap<RecordKey, FileLocation>,
    history: HashMap<RecordKey, Vec<HistoryEntry>>,
    // No reader at or below this version remains.
    history_floor: CatalogVersion,
    type_counts: HashMap<u8, u64>,
    pending: Option<PendingChanges>,
    descriptor: OffsetIndexDescriptor,
    keys: KeyCompressor,
    closed: bool,
}

/// An append-only data file with a versioned in-memory key index.
///
/// All methods take `&self`; readers share a read lock while the single
/// writer stages and flushes under the write lock. See the
/// [module documentation](super) for the write path and recovery rules.
#[derive(Debug)]
pub struct RecordStore {
    name: String,
    options: RecordStoreOptions,
    read_only: bool,
    state: RwLock<StoreState>,
}

impl RecordStore {
    /// Creates a store over an empty backend.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the backend already holds
    /// data.
    pub fn create(
        backend: Box<dyn StorageBackend>,
        version: CatalogVersion,
        options: RecordStoreOptions,
    ) -> CoreResult<Self> {
        if !backend.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "cannot create record store over non-empty {}",
                backend.describe()
            )));
        }
        let name = backend.describe();
        Ok(Self::from_parts(
            name,
            backend,
            OffsetIndexDescriptor::empty(version),
            HashMap::new(),
            KeyCompressor::new(),
            options,
            false,
        ))
    }

    /// Reopens a store for writing.
    ///
    /// Everything past `committed_end` was written after the last durable
    /// catalog version and is cut away before the index is rebuilt.
    ///
    /// # Errors
    ///
    /// Fails if the file is shorter than `committed_end` or the index chain
    /// is damaged.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        descriptor: OffsetIndexDescriptor,
        committed_end: u64,
        options: RecordStoreOptions,
    ) -> CoreResult<Self> {
        let name = backend.describe();
        let len = backend.len();
        if len < committed_end {
            return Err(CoreError::corrupted(
                name,
                None,
                format!("file holds {len} bytes but {committed_end} were committed"),
            ));
        }
        if len > committed_end {
            warn!(file = %name, discarded = len - committed_end, "truncating uncommitted tail");
            backend.truncate(committed_end)?;
        }
        let committed = load_index_chain(backend.as_ref(), &descriptor, options.compute_crc32c)?;
        let keys = KeyCompressor::from_dictionary(descriptor.key_dictionary.clone())?;
        debug!(file = %name, records = committed.len(), version = %descriptor.version, "opened record store");
        Ok(Self::from_parts(
            name, backend, descriptor, committed, keys, options, false,
        ))
    }

    /// Opens a historical view of a store that will never be written.
    ///
    /// Nothing is truncated, so newer data in the same file stays intact.
    ///
    /// # Errors
    ///
    /// Fails if the index chain is damaged.
    pub fn open_read_only(
        backend: Box<dyn StorageBackend>,
        descriptor: OffsetIndexDescriptor,
        options: RecordStoreOptions,
    ) -> CoreResult<Self> {
        let name = backend.describe();
        let committed = load_index_chain(backend.as_ref(), &descriptor, options.compute_crc32c)?;
        let keys = KeyCompressor::from_dictionary(descriptor.key_dictionary.clone())?;
        Ok(Self::from_parts(
            name, backend, descriptor, committed, keys, options, true,
        ))
    }

    fn from_parts(
        name: String,
        backend: Box<dyn StorageBackend>,
        descriptor: OffsetIndexDescriptor,
        committed: HashMap<RecordKey, FileLocation>,
        keys: KeyCompressor,
        options: RecordStoreOptions,
        read_only: bool,
    ) -> Self {
        let mut type_counts = HashMap::new();
        for key in committed.keys() {
            *type_counts.entry(key.record_type).or_insert(0) += 1;
        }
        Self {
            name,
            options,
            read_only,
            state: RwLock::new(StoreState {
                backend,
                committed,
                history: HashMap::new(),
                history_floor: CatalogVersion::WARM_UP,
                type_counts,
                pending: None,
                descriptor,
                keys,
                closed: false,
            }),
        }
    }

    /// Name of the underlying file, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor of the latest flush.
    #[must_use]
    pub fn descriptor(&self) -> OffsetIndexDescriptor {
        self.state.read().descriptor.clone()
    }

    /// Current length of the file.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.state.read().backend.len()
    }

    /// Returns `true` if changes are staged.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.state
            .read()
            .pending
            .as_ref()
            .is_some_and(|p| !p.entries.is_empty())
    }

    /// Returns `true` if this store was opened as a historical view.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Runs `f` with the store's key dictionary.
    ///
    /// New keys become durable with the next effective flush.
    pub fn with_keys<R>(&self, f: impl FnOnce(&mut KeyCompressor) -> R) -> R {
        f(&mut self.state.write().keys)
    }

    /// Reads the payload visible at `version` for `key`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if the record is damaged.
    pub fn get(&self, version: CatalogVersion, key: RecordKey) -> CoreResult<Option<Vec<u8>>> {
        let state = self.state.read();
        state.ensure_open()?;
        match state.resolve(key, version) {
            Resolved::Absent => Ok(None),
            Resolved::Trapped(payload) => Ok(Some(payload.as_ref().clone())),
            Resolved::Located(location) => {
                read_data_record(
                    state.backend.as_ref(),
                    key,
                    location,
                    &self.name,
                    self.options.compute_crc32c,
                ).map(Some)
            }
        }
    }

    /// Returns `true` if `key` exists at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`close`](Self::close).
    pub fn contains(&self, version: CatalogVersion, key: RecordKey) -> CoreResult<bool> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(!matches!(state.resolve(key, version), Resolved::Absent))
    }

    /// Stages `payload` under `key` for `version`.
    ///
    /// The value becomes visible to readers at `version` or later right
    /// away, and durable with the next [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// Fails if the payload is too large, the store is read-only or closed,
    /// or `version` is not the single open version.
    pub fn put(&self, version: CatalogVersion, key: RecordKey, payload: Vec<u8>) -> CoreResult<()> {
        if payload.len() > self.options.max_record_size as usize {
            return Err(CoreError::invalid_operation(format!(
                "record {key} of {} bytes exceeds limit of {}",
                payload.len(),
                self.options.max_record_size
            )));
        }
        let mut state = self.state.write();
        self.ensure_writable(&state)?;
        let len = payload.len();
        let pending = state.pending_for(version)?;
        if let Some(Staged::Trapped(old)) = pending
            .entries
            .insert(key, Staged::Trapped(Arc::new(payload)))
        {
            pending.trapped_bytes -= old.len();
        }
        pending.trapped_bytes += len;

        if pending.trapped_bytes > self.options.max_trapped_bytes {
            state.spill(&self.options)?;
        }
        Ok(())
    }

    /// Stages the removal of `key` at `version`.
    ///
    /// Returns `false` and stages nothing when the key does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the store is read-only or closed, or `version` is not the
    /// single open version.
    pub fn remove(&self, version: CatalogVersion, key: RecordKey) -> CoreResult<bool> {
        let mut state = self.state.write();
        self.ensure_writable(&state)?;
        if matches!(state.resolve(key, version), Resolved::Absent) {
            return Ok(false);
        }
        let existed_before = state.committed.contains_key(&key);
        let pending = state.pending_for(version)?;
        let replaced = if existed_before {
            pending.entries.insert(key, Staged::Removed)
        } else {
            pending.entries.remove(&key)
        };
        if let Some(Staged::Trapped(old)) = replaced {
            pending.trapped_bytes -= old.len();
        }
        Ok(true)
    }

    /// Number of records visible at `version`, optionally of one type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`close`](Self::close).
    pub fn count(&self, version: CatalogVersion, record_type: Option<u8>) -> CoreResult<u64> {
        let state = self.state.read();
        state.ensure_open()?;
        let matches = |key: &RecordKey| record_type.is_none_or(|t| t == key.record_type);

        let mut count = match record_type {
            Some(t) => state.type_counts.get(&t).copied().unwrap_or(0) as i64,
            None => state.committed.len() as i64,
        };
        for (key, entries) in &state.history {
            if !matches(key) {
                continue;
            }
            if let Some(entry) = entries.iter().find(|e| e.superseded_at > version) {
                let then = i64::from(entry.previous.is_some());
                let now = i64::from(state.committed.contains_key(key));
                count += then - now;
            }
        }
        if let Some(pending) = state.pending.as_ref().filter(|p| version >= p.version) {
            for (key, staged) in &pending.entries {
                if !matches(key) {
                    continue;
                }
                let before = i64::from(state.committed.contains_key(key));
                let after = i64::from(!matches!(staged, Staged::Removed));
                count += after - before;
            }
        }
        Ok(count.max(0) as u64)
    }

    /// Primary keys of one record type visible at `version`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`close`](Self::close).
    pub fn primary_keys(&self, version: CatalogVersion, record_type: u8) -> CoreResult<Vec<i64>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state
            .candidate_keys()
            .into_iter()
            .filter(|key| key.record_type == record_type)
            .filter(|key| !matches!(state.resolve(*key, version), Resolved::Absent))
            .map(|key| key.primary_key)
            .collect())
    }

    /// Appends every trapped payload to the file without committing it.
    ///
    /// Frees the memory held by staged payloads. The records stay invisible
    /// to recovery until the next flush indexes them. Returns the number of
    /// bytes written.
    ///
    /// # Errors
    ///
    /// Fails if an append fails; already spilled records stay staged.
    pub fn flush_trapped(&self) -> CoreResult<u64> {
        let mut state = self.state.write();
        self.ensure_writable(&state)?;
        state.spill(&self.options)
    }

    /// Seals every staged change into a new descriptor.
    ///
    /// Appends the trapped payloads and one index chunk, fsyncs, then makes
    /// the changes the committed state. Without staged changes this is a
    /// no-op returning the previous descriptor.
    ///
    /// # Errors
    ///
    /// Fails if `version` precedes the staged or flushed version, or if any
    /// write fails. On failure the committed state is unchanged.
    pub fn flush(&self, version: CatalogVersion) -> CoreResult<OffsetIndexDescriptor> {
        let mut state = self.state.write();
        self.ensure_writable(&state)?;
        if version < state.descriptor.version {
            return Err(CoreError::invariant(format!(
                "flush at {version} precedes last flush at {} in {}",
                state.descriptor.version, self.name
            )));
        }
        let nothing_staged = state.pending.as_ref().is_none_or(|p| p.entries.is_empty());
        if nothing_staged && !state.keys.is_dirty() {
            state.pending = None;
            return Ok(state.descriptor.clone());
        }
        if let Some(pending) = &state.pending {
            if pending.version > version {
                return Err(CoreError::invariant(format!(
                    "flush at {version} would seal changes staged for {}",
                    pending.version
                )));
            }
        }

        state.spill(&self.options)?;
        let entries: Vec<(RecordKey, Staged)> = state
            .pending
            .as_ref()
            .map(|p| p.entries.iter().map(|(k, s)| (*k, s.clone())).collect())
            .unwrap_or_default();

        let mut chunk = IndexChunk {
            previous: state.descriptor.index_location,
            version,
            upserts: Vec::new(),
            removals: Vec::new(),
        };
        for (key, staged) in &entries {
            match staged {
                Staged::Written(location) => chunk.upserts.push((*key, *location)),
                Staged::Removed => chunk.removals.push(*key),
                Staged::Trapped(_) => {
                    return Err(CoreError::invariant("trapped payload survived spill"))
                }
            }
        }
        chunk.upserts.sort_by_key(|(key, _)| *key);
        chunk.removals.sort();

        let record = StorageRecord::new(RecordControl::INDEX, version.as_u64(), chunk.encode());
        let index_location =
            append_record(state.backend.as_mut(), &record, self.options.compute_crc32c)?;
        if self.options.sync_writes {
            state.backend.sync()?;
        }

        state.pending = None;
        for (key, staged) in entries {
            let next = match staged {
                Staged::Written(location) => Some(location),
                _ => None,
            };
            state.apply(key, next, version);
        }

        let dictionary = state.keys.snapshot();
        let max_record_size = state
            .committed
            .values()
            .map(|location| location.length)
            .max()
            .unwrap_or(0);
        let descriptor = OffsetIndexDescriptor {
            version,
            index_location: Some(index_location),
            key_dictionary: dictionary,
            living_record_count: state.committed.len() as u64,
            living_record_size: state.descriptor.living_record_size,
            written_record_size: state.descriptor.written_record_size,
            file_size: state.backend.len(),
            max_record_size,
        };
        state.descriptor = descriptor.clone();
        debug!(
            file = %self.name,
            version = %version,
            records = descriptor.living_record_count,
            share = descriptor.active_record_share(),
            "flushed record store"
        );
        Ok(descriptor)
    }

    /// Drops the bookkeeping of superseded locations no reader at `version`
    /// or later can reach.
    pub fn purge(&self, version: CatalogVersion) {
        let mut state = self.state.write();
        state.history_floor = state.history_floor.max(version);
        state.history.retain(|_, entries| {
            entries.retain(|e| e.superseded_at > version);
            !entries.is_empty()
        });
    }

    /// Writes the records live at `version` into an empty `target`.
    ///
    /// Records are copied byte for byte, followed by a single index chunk
    /// with no predecessor. The returned descriptor describes the copy,
    /// whose active share is exactly 1.0. Only the target is written; the
    /// read lock is released between records so the writer is not blocked
    /// for the duration of the copy.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not empty, changes staged at or below `version`
    /// are not flushed yet, or any read or write fails.
    pub fn copy_snapshot_to(
        &self,
        target: &mut dyn StorageBackend,
        version: CatalogVersion,
    ) -> CoreResult<OffsetIndexDescriptor> {
        if !target.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "snapshot target {} is not empty",
                target.describe()
            )));
        }
        let (live, dictionary) = {
            let state = self.state.read();
            state.ensure_open()?;
            let unflushed = state
                .pending
                .as_ref()
                .is_some_and(|p| !p.entries.is_empty() && p.version <= version);
            if unflushed {
                return Err(CoreError::invalid_operation(format!(
                    "cannot snapshot {} at {version} with unflushed changes",
                    self.name
                )));
            }
            let mut live: Vec<(RecordKey, FileLocation)> = state
                .candidate_keys()
                .into_iter()
                .filter_map(|key| state.resolve_committed(key, version).map(|loc| (key, loc)))
                .collect();
            live.sort_by_key(|(_, location)| location.start);
            (live, state.descriptor.key_dictionary.clone())
        };

        let mut upserts = Vec::with_capacity(live.len());
        let mut living_size = 0u64;
        let mut max_record_size = 0u32;
        for (key, location) in live {
            let bytes = {
                let state = self.state.read();
                state.ensure_open()?;
                state.backend.read_at(location.start, location.length as usize)?
            };
            let start = target.append(&bytes)?;
            upserts.push((key, FileLocation::new(start, location.length)));
            living_size += u64::from(location.length);
            max_record_size = max_record_size.max(location.length);
        }

        let chunk = IndexChunk {
            previous: None,
            version,
            upserts,
            removals: Vec::new(),
        };
        let count = chunk.upserts.len() as u64;
        let record = StorageRecord::new(RecordControl::INDEX, version.as_u64(), chunk.encode());
        let index_location = append_record(target, &record, self.options.compute_crc32c)?;
        target.sync()?;

        Ok(OffsetIndexDescriptor {
            version,
            index_location: Some(index_location),
            key_dictionary: dictionary,
            living_record_count: count,
            living_record_size: living_size,
            written_record_size: living_size,
            file_size: target.len(),
            max_record_size,
        })
    }

    /// Appends a header record that is addressed by location, not by key.
    ///
    /// # Errors
    ///
    /// Fails if the store is read-only or closed, or the write fails.
    pub fn write_root(&self, version: CatalogVersion, payload: Vec<u8>) -> CoreResult<FileLocation> {
        let mut state = self.state.write();
        self.ensure_writable(&state)?;
        let record = StorageRecord::new(RecordControl::ROOT, version.as_u64(), payload);
        let location = append_record(state.backend.as_mut(), &record, self.options.compute_crc32c)?;
        if self.options.sync_writes {
            state.backend.sync()?;
        }
        Ok(location)
    }

    /// Reads a header record written by [`write_root`](Self::write_root).
    ///
    /// # Errors
    ///
    /// Fails if the location does not hold an intact header record.
    pub fn read_root(&self, location: FileLocation) -> CoreResult<Vec<u8>> {
        let state = self.state.read();
        state.ensure_open()?;
        read_root_record(state.backend.as_ref(), location, self.options.compute_crc32c)
    }

    /// Scans the whole file, verifying every checksum, and cross-checks the
    /// live index against what was found.
    ///
    /// # Errors
    ///
    /// Fails on the first damaged record that is not a torn tail, or if a
    /// live key points at something other than its data record.
    pub fn verify_contents(&self) -> CoreResult<FileStatistics> {
        let state = self.state.read();
        state.ensure_open()?;
        let backend = state.backend.as_ref();
        let mut stats = FileStatistics {
            file_size: backend.len(),
            living_records: state.committed.len() as u64,
            active_record_share: state.descriptor.active_record_share(),
            ..FileStatistics::default()
        };
        let mut data_starts = BTreeSet::new();
        let mut scanner = RecordScanner::full(backend).require_checksum(self.options.compute_crc32c);
        for item in scanner.by_ref() {
            let (location, record) = item?;
            stats.record_count += 1;
            if record.control.contains(RecordControl::INDEX) {
                stats.index_chunks += 1;
            } else if record.control.contains(RecordControl::ROOT) {
                stats.root_records += 1;
            } else {
                stats.data_records += 1;
                data_starts.insert(location.start);
            }
        }
        stats.torn_tail = scanner.hit_torn_tail();

        for (key, location) in &state.committed {
            if !data_starts.contains(&location.start) {
                return Err(CoreError::corrupted(
                    self.name.clone(),
                    Some(*location),
                    format!("index entry {key} does not point at a data record"),
                ));
            }
        }
        Ok(stats)
    }

    /// Closes the store. Staged changes are discarded.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.pending.as_ref().is_some_and(|p| !p.entries.is_empty()) {
            warn!(file = %self.name, "closing record store with unflushed changes");
        }
        state.pending = None;
        state.history.clear();
        state.closed = true;
    }

    fn ensure_writable(&self, state: &StoreState) -> CoreResult<()> {
        state.ensure_open()?;
        if self.read_only {
            return Err(CoreError::invalid_operation(format!(
                "record store {} is a read-only historical view",
                self.name
            )));
        }
        Ok(())
    }
}

enum Resolved {
    Absent,
    Trapped(Arc<Vec<u8>>),
    Located(FileLocation),
}

impl StoreState {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed {
            Err(CoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn pending_for(&mut self, version: CatalogVersion) -> CoreResult<&mut PendingChanges> {
        if version < self.descriptor.version {
            return Err(CoreError::invariant(format!(
                "write at {version} precedes last flush at {}",
                self.descriptor.version
            )));
        }
        let pending = self.pending.get_or_insert_with(|| PendingChanges {
            version,
            entries: HashMap::new(),
            trapped_bytes: 0,
        });
        if pending.entries.is_empty() {
            pending.version = version;
        }
        if pending.version != version {
            return Err(CoreError::invariant(format!(
                "write at {version} while changes for {} are still staged",
                pending.version
            )));
        }
        Ok(pending)
    }

    fn resolve(&self, key: RecordKey, version: CatalogVersion) -> Resolved {
        if let Some(pending) = self.pending.as_ref().filter(|p| version >= p.version) {
            match pending.entries.get(&key) {
                Some(Staged::Trapped(payload)) => return Resolved::Trapped(Arc::clone(payload)),
                Some(Staged::Written(location)) => return Resolved::Located(*location),
                Some(Staged::Removed) => return Resolved::Absent,
                None => {}
            }
        }
        match self.resolve_committed(key, version) {
            Some(location) => Resolved::Located(location),
            None => Resolved::Absent,
        }
    }

    fn resolve_committed(&self, key: RecordKey, version: CatalogVersion) -> Option<FileLocation> {
        if let Some(entries) = self.history.get(&key) {
            if let Some(entry) = entries.iter().find(|e| e.superseded_at > version) {
                return entry.previous;
            }
        }
        self.committed.get(&key).copied()
    }

    fn candidate_keys(&self) -> BTreeSet<RecordKey> {
        let mut keys: BTreeSet<RecordKey> = self.committed.keys().copied().collect();
        keys.extend(self.history.keys().copied());
        if let Some(pending) = &self.pending {
            keys.extend(pending.entries.keys().copied());
        }
        keys
    }

    fn spill(&mut self, options: &RecordStoreOptions) -> CoreResult<u64> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(0);
        };
        let mut trapped: Vec<(RecordKey, Arc<Vec<u8>>)> = pending
            .entries
            .iter()
            .filter_map(|(key, staged)| match staged {
                Staged::Trapped(payload) => Some((*key, Arc::clone(payload))),
                _ => None,
            })
            .collect();
        trapped.sort_by_key(|(key, _)| *key);

        let mut written = 0u64;
        for (key, payload) in trapped {
            let mut body = Vec::with_capacity(KEY_PREFIX_SIZE + payload.len());
            body.push(key.record_type);
            body.extend_from_slice(&key.primary_key.to_le_bytes());
            body.extend_from_slice(&payload);
            let record = StorageRecord::new(RecordControl::NONE, pending.version.as_u64(), body);
            let location = append_record(self.backend.as_mut(), &record, options.compute_crc32c)?;
            pending.entries.insert(key, Staged::Written(location));
            pending.trapped_bytes -= payload.len();
            self.descriptor.written_record_size += u64::from(location.length);
            written += u64::from(location.length);
        }
        Ok(written)
    }

    fn apply(&mut self, key: RecordKey, next: Option<FileLocation>, version: CatalogVersion) {
        let previous = match next {
            Some(location) => self.committed.insert(key, location),
            None => self.committed.remove(&key),
        };
        if previous == next {
            return;
        }
        if let Some(old) = previous {
            self.descriptor.living_record_size -= u64::from(old.length);
        }
        if let Some(new) = next {
            self.descriptor.living_record_size += u64::from(new.length);
        }
        match (previous.is_some(), next.is_some()) {
            (false, true) => *self.type_counts.entry(key.record_type).or_insert(0) += 1,
            (true, false) => {
                if let Some(count) = self.type_counts.get_mut(&key.record_type) {
                    *count = count.saturating_sub(1);
                }
            }
            _ => {}
        }
        if version <= self.history_floor {
            return;
        }
        let entries = self.history.entry(key).or_default();
        // readers below `version` already resolve through the first entry
        if entries.last().is_some_and(|e| e.superseded_at == version) {
            return;
        }
        entries.push(HistoryEntry {
            superseded_at: version,
            previous,
        });
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.history.values().map(Vec::len).sum()
    }
}

fn load_index_chain(
    backend: &dyn StorageBackend,
    descriptor: &OffsetIndexDescriptor,
    require_checksum: bool,
) -> CoreResult<HashMap<RecordKey, FileLocation>> {
    let name = backend.describe();
    let mut seen: HashMap<RecordKey, Option<FileLocation>> = HashMap::new();
    let mut cursor = descriptor.index_location;
    while let Some(location) = cursor {
        let record = StorageRecord::read(backend, location, require_checksum)?;
        if !record.control.contains(RecordControl::INDEX) {
            return Err(CoreError::corrupted(
                name,
                Some(location),
                "expected an index chunk",
            ));
        }
        let chunk = IndexChunk::decode(&record.payload, &name)?;
        for (key, target) in &chunk.upserts {
            seen.entry(*key).or_insert(Some(*target));
        }
        for key in &chunk.removals {
            seen.entry(*key).or_insert(None);
        }
        cursor = match chunk.previous {
            Some(previous) if previous.start >= location.start => {
                return Err(CoreError::corrupted(
                    name,
                    Some(location),
                    "index chunk links forward",
                ));
            }
            other => other,
        };
    }
    Ok(seen
        .into_iter()
        .filter_map(|(key, location)| location.map(|l| (key, l)))
        .collect())
}

fn read_data_record(
    backend: &dyn StorageBackend,
    key: RecordKey,
    location: FileLocation,
    name: &str,
    require_checksum: bool,
) -> CoreResult<Vec<u8>> {
    let record = StorageRecord::read(backend, location, require_checksum)?;
    if record.payload.len() < KEY_PREFIX_SIZE
        || record.control.contains(RecordControl::INDEX)
        || record.control.contains(RecordControl::ROOT)
    {
        return Err(CoreError::corrupted(
            name,
            Some(location),
            format!("location of {key} does not hold a data record"),
        ));
    }
    let stored = RecordKey::new(record.payload[0], read_u64(&record.payload, 1) as i64);
    if stored != key {
        return Err(CoreError::corrupted(
            name,
            Some(location),
            format!("expected record {key}, found {stored}"),
        ));
    }
    let mut payload = record.payload;
    payload.drain(..KEY_PREFIX_SIZE);
    Ok(payload)
}

/// Reads a header record from any backend.
///
/// `require_checksum` refuses records written without a checksum.
///
/// # Errors
///
/// Fails if the record is damaged or is not a header record.
pub fn read_root_record(
    backend: &dyn StorageBackend,
    location: FileLocation,
    require_checksum: bool,
) -> CoreResult<Vec<u8>> {
    let record = StorageRecord::read(backend, location, require_checksum)?;
    if !record.control.contains(RecordControl::ROOT) {
        return Err(CoreError::corrupted(
            backend.describe(),
            Some(location),
            "expected a header record",
        ));
    }
    Ok(record.payload)
}

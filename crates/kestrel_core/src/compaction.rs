//! Record store compaction.
//!
//! A record store only ever appends, so superseded and removed records stay
//! in the file as dead weight. Once the live share of a file drops below
//! [`CompactionPolicy::min_active_record_share`] and the file is larger than
//! [`CompactionPolicy::file_size_compaction_threshold`], the live records
//! are copied into a fresh file with the next generation index.
//!
//! ## Invariants
//!
//! - Compaction **MUST NOT** change logical state: the records live at the
//!   compacted version are exactly the records live in the copy
//! - The copy's active share is 1.0, never lower than the source's
//! - The source is only read; retiring it is the caller's job

use crate::config::StorageOptions;
use crate::error::{CoreError, CoreResult};
use crate::offset_index::{OffsetIndexDescriptor, RecordStore};
use crate::types::CatalogVersion;
use kestrel_storage::StorageBackend;
use tracing::info;

/// When a file is worth compacting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPolicy {
    /// Files whose live share is below this are candidates.
    pub min_active_record_share: f64,
    /// Files at or below this size are never compacted.
    pub file_size_compaction_threshold: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::from(&StorageOptions::default())
    }
}

impl From<&StorageOptions> for CompactionPolicy {
    fn from(options: &StorageOptions) -> Self {
        Self {
            min_active_record_share: options.min_active_record_share,
            file_size_compaction_threshold: options.file_size_compaction_threshold,
        }
    }
}

impl CompactionPolicy {
    /// A policy that compacts every file with any dead weight.
    #[must_use]
    pub fn always() -> Self {
        Self {
            min_active_record_share: 1.0,
            file_size_compaction_threshold: 0,
        }
    }

    /// Returns `true` if the file described by `descriptor` should be
    /// rewritten.
    #[must_use]
    pub fn should_compact(&self, descriptor: &OffsetIndexDescriptor) -> bool {
        descriptor.active_record_share() < self.min_active_record_share
            && descriptor.file_size > self.file_size_compaction_threshold
    }
}

/// Statistics of one compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    /// File that was compacted.
    pub source: String,
    /// File that received the live records.
    pub target: String,
    /// Version the copy was taken at.
    pub version: CatalogVersion,
    /// Live records in the source.
    pub input_records: u64,
    /// Records in the copy.
    pub output_records: u64,
    /// Size of the source file.
    pub input_bytes: u64,
    /// Size of the copy.
    pub output_bytes: u64,
    /// Live share of the source.
    pub share_before: f64,
    /// Live share of the copy.
    pub share_after: f64,
}

impl CompactionResult {
    /// Bytes the copy saves over the source.
    #[must_use]
    pub fn bytes_reclaimed(&self) -> u64 {
        self.input_bytes.saturating_sub(self.output_bytes)
    }
}

/// Copies the live records of a record store into a new file.
///
/// ## Example
///
/// ```ignore
/// let compactor = Compactor::new(CompactionPolicy::from(&options));
/// if compactor.policy().should_compact(&store.descriptor()) {
///     let (descriptor, stats) = compactor.compact(&store, version, &mut target)?;
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Compactor {
    policy: CompactionPolicy,
}

impl Compactor {
    /// Creates a compactor with the given policy.
    #[must_use]
    pub fn new(policy: CompactionPolicy) -> Self {
        Self { policy }
    }

    /// The policy deciding eligibility.
    #[must_use]
    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Returns `true` if `store` is eligible right now.
    #[must_use]
    pub fn is_eligible(&self, store: &RecordStore) -> bool {
        self.policy.should_compact(&store.descriptor())
    }

    /// Copies the records of `source` live at `version` into the empty
    /// `target` and returns the copy's descriptor.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not empty, changes at `version` are not flushed,
    /// any I/O fails, or the copy does not hold as many records as the source.
    pub fn compact(
        &self,
        source: &RecordStore,
        version: CatalogVersion,
        target: &mut dyn StorageBackend,
    ) -> CoreResult<(OffsetIndexDescriptor, CompactionResult)> {
        let before = source.descriptor();
        let input_records = source.count(version, None)?;
        let input_bytes = source.file_size();

        let descriptor = source.copy_snapshot_to(target, version)?;
        if descriptor.living_record_count != input_records {
            return Err(CoreError::invariant(format!(
                "compaction of {} copied {} of {} records",
                source.name(),
                descriptor.living_record_count,
                input_records
            )));
        }

        let result = CompactionResult {
            source: source.name().to_string(),
            target: target.describe(),
            version,
            input_records,
            output_records: descriptor.living_record_count,
            input_bytes,
            output_bytes: descriptor.file_size,
            share_before: before.active_record_share(),
            share_after: descriptor.active_record_share(),
        };
        info!(
            source = %result.source,
            target = %result.target,
            version = %version,
            records = result.output_records,
            reclaimed = result.bytes_reclaimed(),
            share = result.share_after,
            "compacted record store"
        );
        Ok((descriptor, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset_index::RecordStoreOptions;
    use crate::types::RecordKey;
    use kestrel_storage::InMemoryBackend;

    fn v(n: u64) -> CatalogVersion {
        CatalogVersion::new(n)
    }

    fn key(pk: i64) -> RecordKey {
        RecordKey::new(16, pk)
    }

    fn sparse_store() -> RecordStore {
        let store = RecordStore::create(
            Box::new(InMemoryBackend::new()),
            v(0),
            RecordStoreOptions::default(),
        )
        .unwrap();
        for pk in 0..100 {
            store.put(v(1), key(pk), vec![pk as u8; 64]).unwrap();
        }
        store.flush(v(1)).unwrap();
        for pk in 0..90 {
            assert!(store.remove(v(2), key(pk)).unwrap());
        }
        store.flush(v(2)).unwrap();
        store
    }

    #[test]
    fn policy_needs_both_conditions() {
        let store = sparse_store();
        let descriptor = store.descriptor();
        assert!(descriptor.active_record_share() < 0.2);

        let policy = CompactionPolicy {
            min_active_record_share: 0.5,
            file_size_compaction_threshold: 1024,
        };
        assert!(policy.should_compact(&descriptor));

        let large_threshold = CompactionPolicy {
            file_size_compaction_threshold: descriptor.file_size,
            ..policy
        };
        assert!(!large_threshold.should_compact(&descriptor));

        let low_share = CompactionPolicy {
            min_active_record_share: 0.05,
            ..policy
        };
        assert!(!low_share.should_compact(&descriptor));
    }

    #[test]
    fn compaction_preserves_live_records() {
        let store = sparse_store();
        let target = InMemoryBackend::new();
        let mut writer = target.share();
        let (descriptor, result) = Compactor::new(CompactionPolicy::always())
            .compact(&store, v(2), &mut writer)
            .unwrap();

        assert_eq!(result.input_records, 10);
        assert_eq!(result.output_records, 10);
        assert!(result.bytes_reclaimed() > 0);
        assert!(result.share_after >= result.share_before);
        assert!((result.share_after - 1.0).abs() < f64::EPSILON);

        let end = target.bytes().len() as u64;
        let copy = RecordStore::open(
            Box::new(target),
            descriptor,
            end,
            RecordStoreOptions::default(),
        )
        .unwrap();
        for pk in 0..100 {
            assert_eq!(
                copy.get(v(2), key(pk)).unwrap(),
                store.get(v(2), key(pk)).unwrap(),
                "pk {pk}"
            );
        }
    }

    #[test]
    fn compaction_rejects_unflushed_version() {
        let store = sparse_store();
        store.put(v(3), key(500), vec![1]).unwrap();
        let mut target = InMemoryBackend::new();
        assert!(Compactor::default().compact(&store, v(3), &mut target).is_err());
        assert!(target.is_empty());
    }
}

//! Point-in-time copies of a catalog directory.
//!
//! A backup holds the records live at the durable catalog version and
//! nothing else: every file is written the way compaction writes it, so the
//! copy starts with an active share of 1.0 and a bootstrap log of a single
//! record. File generations keep their indexes, which lets the copy be
//! opened with [`CatalogPersistence::load`](crate::CatalogPersistence::load)
//! under the same catalog name.
//!
//! ## Layout
//!
//! ```text
//! {catalog}.boot                   one record
//! {catalog}_{n}.catalog            catalog records + header
//! {type}_{typePK}_{n}.entity       collection records + header
//! {catalog}_0.wal                  empty, only for alive catalogs
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let summary = catalog.backup_to(Path::new("/backups/products-2024-06-01"))?;
//! println!("{} records at {}", summary.record_count, summary.version);
//! ```

use crate::bootstrap::{BootstrapLog, BootstrapRecord};
use crate::config::StorageOptions;
use crate::dir::CatalogDir;
use crate::error::{CoreError, CoreResult};
use crate::header::{CatalogHeader, CollectionFileReference, CURRENT_STORAGE_PROTOCOL_VERSION};
use crate::observer::NoopObserver;
use crate::offset_index::{OffsetIndexDescriptor, RecordStore, RecordStoreOptions};
use crate::persistence::{EntityCollectionPersistence, StoragePartPersistence};
use crate::types::{now_millis, CatalogVersion};
use crate::wal::{CatalogWal, WalOptions};
use kestrel_storage::{remove_file_if_exists, FileBackend, StorageBackend};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// What a finished backup contains.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    /// Directory the backup was written to.
    pub path: PathBuf,
    /// Name of the copied catalog.
    pub catalog_name: String,
    /// Catalog version the copy reflects.
    pub version: CatalogVersion,
    /// When the copy was committed (milliseconds since the epoch).
    pub timestamp_millis: i64,
    /// Live records copied, over all files.
    pub record_count: u64,
    /// Bytes written, over all files.
    pub bytes_written: u64,
    /// Every file of the backup except the bootstrap log.
    pub files: Vec<PathBuf>,
}

/// The durable state a backup is cut from.
pub(crate) struct BackupSource<'a> {
    pub(crate) header: CatalogHeader,
    pub(crate) catalog: Arc<StoragePartPersistence>,
    pub(crate) collections: Vec<Arc<EntityCollectionPersistence>>,
    pub(crate) options: &'a StorageOptions,
}

struct CopiedFile {
    descriptor: OffsetIndexDescriptor,
    store: RecordStore,
}

/// Writes a backup of `source` into `target`.
///
/// The caller must hold the catalog's writer lock so the source files do
/// not change generation while they are copied.
pub(crate) fn write_backup(source: &BackupSource<'_>, target: &Path) -> CoreResult<BackupSummary> {
    let name = source.header.catalog_name.as_str();
    let version = source.header.version;
    let dir = CatalogDir::open(target, name, true)?;
    if dir.has_bootstrap() {
        return Err(CoreError::invalid_operation(format!(
            "{} already holds catalog `{name}`",
            target.display()
        )));
    }
    let store_options = RecordStoreOptions::from(source.options);
    let mut summary = BackupSummary {
        path: target.to_path_buf(),
        catalog_name: name.to_string(),
        version,
        timestamp_millis: 0,
        record_count: 0,
        bytes_written: 0,
        files: Vec::new(),
    };

    let mut references = BTreeMap::new();
    for collection in &source.collections {
        let mut header = collection.header();
        let path = dir.entity_file_path(
            &header.entity_type,
            header.entity_type_primary_key,
            header.file_index,
        );
        let copied = copy_store(collection.parts(), &path, version, store_options)?;
        header.version = version;
        header.record_count = copied.descriptor.living_record_count;
        header.active_record_share = copied.descriptor.active_record_share();
        header.descriptor = copied.descriptor;
        let header_location = copied.store.write_root(version, header.encode()?)?;
        summary.record_count += header.record_count;
        summary.bytes_written += copied.store.file_size();
        copied.store.close();
        debug!(path = %path.display(), records = header.record_count, "copied entity collection");

        references.insert(
            header.entity_type.clone(),
            CollectionFileReference {
                entity_type: header.entity_type,
                entity_type_primary_key: header.entity_type_primary_key,
                file_index: header.file_index,
                header_location,
            },
        );
        summary.files.push(path);
    }

    let mut header = source.header.clone();
    let catalog_path = dir.catalog_file_path(header.catalog_file_index);
    let copied = copy_store(&source.catalog, &catalog_path, version, store_options)?;
    if header.wal.is_some() {
        let wal = CatalogWal::open(
            dir.path(),
            name,
            WalOptions::from(source.options),
            Arc::new(NoopObserver),
        )?;
        let reference = wal.reference();
        summary.files.push(dir.file_path(&reference.file_name()));
        header.wal = Some(reference);
    }
    header.storage_protocol_version = CURRENT_STORAGE_PROTOCOL_VERSION;
    header.collections = references;
    header.active_record_share = copied.descriptor.active_record_share();
    header.descriptor = copied.descriptor;
    let header_location = copied.store.write_root(version, header.encode()?)?;
    summary.record_count += header.descriptor.living_record_count;
    summary.bytes_written += copied.store.file_size();
    copied.store.close();
    summary.files.push(catalog_path);
    dir.sync()?;

    let record = BootstrapRecord {
        storage_protocol_version: CURRENT_STORAGE_PROTOCOL_VERSION,
        catalog_version: version,
        catalog_file_index: header.catalog_file_index,
        timestamp_millis: now_millis(),
        header_location: Some(header_location),
    };
    BootstrapLog::create(&dir.bootstrap_path(), record)?;
    summary.timestamp_millis = record.timestamp_millis;

    info!(
        catalog = name,
        version = %version,
        target = %target.display(),
        records = summary.record_count,
        bytes = summary.bytes_written,
        "wrote backup"
    );
    Ok(summary)
}

fn copy_store(
    source: &StoragePartPersistence,
    path: &Path,
    version: CatalogVersion,
    options: RecordStoreOptions,
) -> CoreResult<CopiedFile> {
    remove_file_if_exists(path)?;
    let mut backend = FileBackend::create_new(path)?;
    let descriptor = source.store().copy_snapshot_to(&mut backend, version)?;
    let end = backend.len();
    let store = RecordStore::open(Box::new(backend), descriptor.clone(), end, options)?;
    Ok(CopiedFile { descriptor, store })
}

#[cfg(test)]
mod tests {
    use crate::config::StorageOptions;
    use crate::error::CoreError;
    use crate::observer::NoopObserver;
    use crate::persistence::CatalogPersistence;
    use crate::types::{CatalogState, CatalogVersion};
    use kestrel_codec::{SerializationContext, StoragePart};
    use serde::{Deserialize, Serialize};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        text: String,
    }

    impl StoragePart for Note {
        const RECORD_TYPE: &'static str = "note";
        fn storage_part_pk(&self) -> Option<i64> {
            Some(self.id)
        }
    }

    fn note(id: i64) -> Note {
        Note {
            id,
            text: format!("note {id}"),
        }
    }

    fn serialization() -> Arc<SerializationContext> {
        SerializationContext::builder()
            .register::<Note>()
            .unwrap()
            .build()
            .shared()
    }

    fn open(path: &Path, create: bool) -> CatalogPersistence {
        let options = StorageOptions::default().sync_writes(false);
        if create {
            CatalogPersistence::create(path, "notes", options, serialization(), Arc::new(NoopObserver))
        } else {
            CatalogPersistence::load(path, "notes", options, serialization(), Arc::new(NoopObserver))
        }
        .unwrap()
    }

    #[test]
    fn backup_holds_durable_state_only() {
        let source = tempdir().unwrap();
        let target = tempdir().unwrap();
        let backup_path = target.path().join("copy");

        let catalog = open(source.path(), true);
        let notes = catalog
            .create_entity_collection("note", CatalogVersion::WARM_UP)
            .unwrap();
        for id in 0..10 {
            notes.parts().put(CatalogVersion::WARM_UP, &note(id)).unwrap();
        }
        catalog.go_live().unwrap();
        let v1 = CatalogVersion::new(1);
        for id in 0..5 {
            notes.parts().remove::<Note>(v1, id).unwrap();
        }
        catalog.flush(v1, &[]).unwrap();
        notes.parts().put(CatalogVersion::new(2), &note(99)).unwrap();

        let summary = catalog.backup_to(&backup_path).unwrap();
        assert_eq!(summary.version, v1);
        assert_eq!(summary.record_count, 5);
        assert!(summary.files.iter().all(|f| f.exists()));
        catalog.close().unwrap();

        let restored = open(&backup_path, false);
        assert_eq!(restored.version(), v1);
        assert_eq!(restored.state(), CatalogState::Alive);
        assert_eq!(restored.bootstrap_records().unwrap().len(), 1);
        let notes = restored.collection_service_for("note", v1).unwrap();
        assert_eq!(notes.parts().count::<Note>(v1).unwrap(), 5);
        assert_eq!(notes.parts().get::<Note>(v1, 7).unwrap(), Some(note(7)));
        assert!(!notes.parts().contains::<Note>(v1, 99).unwrap());
        assert!((notes.header().active_record_share - 1.0).abs() < f64::EPSILON);
        assert_eq!(restored.committed_transactions().unwrap().count(), 0);
    }

    #[test]
    fn backup_refuses_existing_catalog() {
        let source = tempdir().unwrap();
        let catalog = open(source.path(), true);
        catalog.go_live().unwrap();

        let target = tempdir().unwrap();
        catalog.backup_to(target.path()).unwrap();
        assert!(matches!(
            catalog.backup_to(target.path()),
            Err(CoreError::InvalidOperation { .. })
        ));
    }
}

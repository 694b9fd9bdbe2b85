//! One generation of an entity collection file.

use super::{PersistenceContext, StoragePartPersistence};
use crate::compaction::CompactionResult;
use crate::dir::CatalogDir;
use crate::error::{CoreError, CoreResult};
use crate::header::{CollectionFileReference, EntityCollectionHeader, StoredCollectionHeader};
use crate::offset_index::{read_root_record, RecordStore};
use crate::types::{CatalogVersion, FileLocation};
use kestrel_storage::{FileBackend, StorageBackend};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct DurableHeader {
    header: EntityCollectionHeader,
    location: Option<FileLocation>,
}

/// Outcome of flushing one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionFlush {
    /// The header now authoritative for the collection.
    pub header: EntityCollectionHeader,
    /// Pointer to store in the catalog header.
    pub reference: CollectionFileReference,
    /// Whether a new header record was written.
    pub changed: bool,
}

/// One generation of `{entityType}_{typePK}_{fileIndex}.entity`.
///
/// The file holds the collection's storage parts and, as root records, its
/// headers. The newest header is the last record of the committed file.
#[derive(Debug)]
pub struct EntityCollectionPersistence {
    entity_type: String,
    entity_type_primary_key: i32,
    parts: StoragePartPersistence,
    durable: RwLock<DurableHeader>,
    ctx: Arc<PersistenceContext>,
}

impl EntityCollectionPersistence {
    /// Creates generation `file_index` of a new, empty collection.
    pub(crate) fn create(
        dir: &CatalogDir,
        ctx: &Arc<PersistenceContext>,
        entity_type: &str,
        entity_type_primary_key: i32,
        file_index: u32,
        version: CatalogVersion,
    ) -> CoreResult<Self> {
        let path = dir.entity_file_path(entity_type, entity_type_primary_key, file_index);
        let backend = FileBackend::create_new(&path)?;
        let store = RecordStore::create(Box::new(backend), version, ctx.store_options)?;
        let mut header = EntityCollectionHeader::new(entity_type, entity_type_primary_key, version);
        header.file_index = file_index;
        debug!(path = %path.display(), entity_type, "created entity collection file");
        Ok(Self {
            entity_type: entity_type.to_string(),
            entity_type_primary_key,
            parts: StoragePartPersistence::new(store, path, file_index, Arc::clone(ctx)),
            durable: RwLock::new(DurableHeader {
                header,
                location: None,
            }),
            ctx: Arc::clone(ctx),
        })
    }

    /// Opens the generation a catalog header points at.
    ///
    /// Data written after the referenced header is discarded.
    pub(crate) fn open(
        dir: &CatalogDir,
        ctx: &Arc<PersistenceContext>,
        reference: &CollectionFileReference,
    ) -> CoreResult<Self> {
        let path = dir.entity_file_path(
            &reference.entity_type,
            reference.entity_type_primary_key,
            reference.file_index,
        );
        let backend = FileBackend::open_existing(&path)?;
        let bytes = read_root_record(
            &backend,
            reference.header_location,
            ctx.options.compute_crc32c,
        )?;
        let header = StoredCollectionHeader::decode(&bytes)?.into_current()?;
        if header.entity_type != reference.entity_type
            || header.entity_type_primary_key != reference.entity_type_primary_key
        {
            return Err(CoreError::corrupted(
                backend.describe(),
                Some(reference.header_location),
                format!(
                    "header belongs to `{}` ({}), expected `{}` ({})",
                    header.entity_type,
                    header.entity_type_primary_key,
                    reference.entity_type,
                    reference.entity_type_primary_key
                ),
            ));
        }
        let store = RecordStore::open(
            Box::new(backend),
            header.descriptor.clone(),
            reference.header_location.end(),
            ctx.store_options,
        )?;
        Ok(Self {
            entity_type: reference.entity_type.clone(),
            entity_type_primary_key: reference.entity_type_primary_key,
            parts: StoragePartPersistence::new(store, path, reference.file_index, Arc::clone(ctx)),
            durable: RwLock::new(DurableHeader {
                header,
                location: Some(reference.header_location),
            }),
            ctx: Arc::clone(ctx),
        })
    }

    /// Entity type served by this generation.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Catalog-unique id of the entity type.
    #[must_use]
    pub fn entity_type_primary_key(&self) -> i32 {
        self.entity_type_primary_key
    }

    /// Generation index of the file.
    #[must_use]
    pub fn file_index(&self) -> u32 {
        self.parts.file_index()
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.parts.path()
    }

    /// Storage parts of the collection.
    #[must_use]
    pub fn parts(&self) -> &StoragePartPersistence {
        &self.parts
    }

    /// The last header written to the file, or the initial header of a
    /// collection that was never flushed.
    #[must_use]
    pub fn header(&self) -> EntityCollectionHeader {
        self.durable.read().header.clone()
    }

    /// Pointer to the last written header, `None` before the first flush.
    #[must_use]
    pub fn reference(&self) -> Option<CollectionFileReference> {
        let durable = self.durable.read();
        durable.location.map(|location| self.reference_to(location))
    }

    fn reference_to(&self, header_location: FileLocation) -> CollectionFileReference {
        CollectionFileReference {
            entity_type: self.entity_type.clone(),
            entity_type_primary_key: self.entity_type_primary_key,
            file_index: self.file_index(),
            header_location,
        }
    }

    /// Seals the staged parts and rewrites the header if anything changed.
    ///
    /// `template` carries the counters kept by the layer above (last
    /// assigned primary key, index key and price id). The header is only
    /// rewritten when the descriptor or a counter differs from the last
    /// written header.
    ///
    /// # Errors
    ///
    /// Fails if the store flush or the header write fails.
    pub fn flush(
        &self,
        version: CatalogVersion,
        template: Option<&EntityCollectionHeader>,
    ) -> CoreResult<CollectionFlush> {
        let descriptor = self.parts.flush(version)?;
        let mut durable = self.durable.write();

        let mut next = durable.header.clone();
        if let Some(template) = template {
            next.last_primary_key = template.last_primary_key;
            next.last_index_key = template.last_index_key;
            next.last_internal_price_id = template.last_internal_price_id;
        }
        next.record_count = descriptor.living_record_count;
        next.active_record_share = descriptor.active_record_share();
        next.descriptor = descriptor;

        if let Some(location) = durable.location {
            let current = &durable.header;
            let unchanged = next.descriptor == current.descriptor
                && next.last_primary_key == current.last_primary_key
                && next.last_index_key == current.last_index_key
                && next.last_internal_price_id == current.last_internal_price_id;
            if unchanged {
                return Ok(CollectionFlush {
                    header: current.clone(),
                    reference: self.reference_to(location),
                    changed: false,
                });
            }
        }

        next.version = version;
        let location = self.parts.write_header(version, next.encode()?)?;
        debug!(
            entity_type = %self.entity_type,
            version = %version,
            records = next.record_count,
            share = next.active_record_share,
            "wrote collection header"
        );
        durable.header = next.clone();
        durable.location = Some(location);
        Ok(CollectionFlush {
            header: next,
            reference: self.reference_to(location),
            changed: true,
        })
    }

    /// Copies the live records at `version` into the next generation.
    ///
    /// Changes staged at `version` must be flushed first.
    ///
    /// # Errors
    ///
    /// Fails if the new file exists already or any read or write fails. The
    /// current generation is left untouched.
    pub fn compact(
        &self,
        dir: &CatalogDir,
        version: CatalogVersion,
    ) -> CoreResult<(Self, CompactionResult)> {
        self.copy_to_generation(dir, &self.entity_type, version)
    }

    /// Copies the live records at `version` into the next generation filed
    /// under `entity_type`.
    pub(crate) fn rename(
        &self,
        dir: &CatalogDir,
        entity_type: &str,
        version: CatalogVersion,
    ) -> CoreResult<Self> {
        let (renamed, _) = self.copy_to_generation(dir, entity_type, version)?;
        info!(from = %self.entity_type, to = entity_type, version = %version, "renamed entity collection");
        Ok(renamed)
    }

    fn copy_to_generation(
        &self,
        dir: &CatalogDir,
        entity_type: &str,
        version: CatalogVersion,
    ) -> CoreResult<(Self, CompactionResult)> {
        let file_index = self.file_index() + 1;
        let path = dir.entity_file_path(entity_type, self.entity_type_primary_key, file_index);
        let mut backend = FileBackend::create_new(&path)?;
        let (descriptor, result) =
            self.ctx
                .compactor
                .compact(self.parts.store(), version, &mut backend)?;
        let end = backend.len();
        let store = RecordStore::open(
            Box::new(backend),
            descriptor.clone(),
            end,
            self.ctx.store_options,
        )?;
        let parts = StoragePartPersistence::new(store, path, file_index, Arc::clone(&self.ctx));

        let mut header = self.durable.read().header.clone();
        header.entity_type = entity_type.to_string();
        header.file_index = file_index;
        header.version = version;
        header.record_count = descriptor.living_record_count;
        header.active_record_share = descriptor.active_record_share();
        header.descriptor = descriptor;
        let location = parts.write_header(version, header.encode()?)?;
        self.ctx.observer.compaction_finished(&result);

        let next = Self {
            entity_type: entity_type.to_string(),
            entity_type_primary_key: self.entity_type_primary_key,
            parts,
            durable: RwLock::new(DurableHeader {
                header,
                location: Some(location),
            }),
            ctx: Arc::clone(&self.ctx),
        };
        Ok((next, result))
    }

    /// Closes the generation.
    pub fn close(&self) {
        self.parts.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::observer::NoopObserver;
    use kestrel_codec::{SerializationContext, StoragePart};
    use serde::{Deserialize, Serialize};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sku {
        id: i64,
        code: String,
    }

    impl StoragePart for Sku {
        const RECORD_TYPE: &'static str = "sku";
        fn storage_part_pk(&self) -> Option<i64> {
            Some(self.id)
        }
    }

    fn v(n: u64) -> CatalogVersion {
        CatalogVersion::new(n)
    }

    fn setup() -> (TempDir, CatalogDir, Arc<PersistenceContext>) {
        let temp = tempdir().unwrap();
        let dir = CatalogDir::open(temp.path(), "shop", true).unwrap();
        let serialization = SerializationContext::builder()
            .register::<Sku>()
            .unwrap()
            .build()
            .shared();
        let ctx = PersistenceContext::new(
            StorageOptions::default().sync_writes(false),
            serialization,
            Arc::new(NoopObserver),
        );
        (temp, dir, ctx)
    }

    fn sku(id: i64) -> Sku {
        Sku {
            id,
            code: format!("SKU-{id:04}"),
        }
    }

    #[test]
    fn flush_writes_header_only_on_change() {
        let (_temp, dir, ctx) = setup();
        let collection =
            EntityCollectionPersistence::create(&dir, &ctx, "product", 1, 0, v(1)).unwrap();
        assert!(collection.reference().is_none());

        collection.parts().put(v(1), &sku(1)).unwrap();
        let first = collection.flush(v(1), None).unwrap();
        assert!(first.changed);
        assert_eq!(first.header.record_count, 1);

        let again = collection.flush(v(2), None).unwrap();
        assert!(!again.changed);
        assert_eq!(again.reference, first.reference);

        let mut template = first.header.clone();
        template.last_primary_key = 1;
        let counters = collection.flush(v(3), Some(&template)).unwrap();
        assert!(counters.changed);
        assert_eq!(counters.header.last_primary_key, 1);
        assert_eq!(counters.header.version, v(3));
    }

    #[test]
    fn reopen_from_reference() {
        let (_temp, dir, ctx) = setup();
        let collection =
            EntityCollectionPersistence::create(&dir, &ctx, "product", 4, 0, v(1)).unwrap();
        for id in 0..10 {
            collection.parts().put(v(1), &sku(id)).unwrap();
        }
        let flushed = collection.flush(v(1), None).unwrap();
        collection.parts().put(v(2), &sku(99)).unwrap();
        collection.parts().flush_trapped().unwrap();
        drop(collection);

        let reopened = EntityCollectionPersistence::open(&dir, &ctx, &flushed.reference).unwrap();
        assert_eq!(reopened.header(), flushed.header);
        assert_eq!(reopened.parts().count::<Sku>(v(2)).unwrap(), 10);
        assert_eq!(reopened.parts().get::<Sku>(v(2), 99).unwrap(), None);
        assert_eq!(reopened.parts().get::<Sku>(v(2), 3).unwrap(), Some(sku(3)));
    }

    #[test]
    fn open_rejects_foreign_header() {
        let (_temp, dir, ctx) = setup();
        let collection =
            EntityCollectionPersistence::create(&dir, &ctx, "product", 1, 0, v(1)).unwrap();
        let mut reference = collection.flush(v(1), None).unwrap().reference;
        drop(collection);
        assert!(EntityCollectionPersistence::open(&dir, &ctx, &reference).is_ok());

        let other = dir.entity_file_path("product", 1, 0);
        std::fs::copy(&other, dir.entity_file_path("brand", 1, 0)).unwrap();
        reference.entity_type = "brand".into();
        assert!(matches!(
            EntityCollectionPersistence::open(&dir, &ctx, &reference),
            Err(CoreError::CorruptedRecord { .. })
        ));
    }

    #[test]
    fn compaction_produces_next_generation() {
        let (_temp, dir, ctx) = setup();
        let collection =
            EntityCollectionPersistence::create(&dir, &ctx, "product", 2, 0, v(1)).unwrap();
        for id in 0..100 {
            collection.parts().put(v(1), &sku(id)).unwrap();
        }
        collection.flush(v(1), None).unwrap();
        for id in 0..90 {
            collection.parts().remove::<Sku>(v(2), id).unwrap();
        }
        let before = collection.flush(v(2), None).unwrap();

        let (next, result) = collection.compact(&dir, v(2)).unwrap();
        assert_eq!(next.file_index(), 1);
        assert_eq!(next.path(), dir.entity_file_path("product", 2, 1));
        assert_eq!(result.output_records, 10);
        assert!(next.header().active_record_share >= before.header.active_record_share);
        assert_eq!(next.parts().primary_keys::<Sku>(v(2)).unwrap(), (90..100).collect::<Vec<_>>());

        let reference = next.reference().unwrap();
        assert_eq!(reference.file_index, 1);
        drop(next);
        let reopened = EntityCollectionPersistence::open(&dir, &ctx, &reference).unwrap();
        assert_eq!(reopened.parts().get::<Sku>(v(2), 95).unwrap(), Some(sku(95)));
    }

    #[test]
    fn rename_files_under_new_name() {
        let (_temp, dir, ctx) = setup();
        let collection =
            EntityCollectionPersistence::create(&dir, &ctx, "product", 3, 0, v(1)).unwrap();
        collection.parts().put(v(1), &sku(1)).unwrap();
        collection.flush(v(1), None).unwrap();

        let renamed = collection.rename(&dir, "article", v(2)).unwrap();
        assert_eq!(renamed.entity_type(), "article");
        assert_eq!(renamed.header().entity_type, "article");
        assert_eq!(renamed.path(), dir.entity_file_path("article", 3, 1));
        assert_eq!(renamed.parts().get::<Sku>(v(2), 1).unwrap(), Some(sku(1)));
    }
}

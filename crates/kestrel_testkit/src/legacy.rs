//! Builders for catalogs in the protocol 1 layout.
//!
//! Protocol 1 named collection files `{entityType}_{fileIndex}.entity`,
//! had no entity type ids and referenced the WAL by path. Loading such a
//! directory exercises the upgrade path end to end.

use crate::fixtures::{test_options, test_serialization, Product};
use kestrel_core::dir::{bootstrap_file_name, catalog_file_name, legacy_entity_file_name, wal_file_name};
use kestrel_core::header::{CatalogHeaderV1, CollectionFileReferenceV1, EntityCollectionHeaderV1};
use kestrel_core::{
    now_millis, BootstrapLog, BootstrapRecord, CatalogState, CatalogVersion, CoreResult,
    RecordKey, RecordStore, RecordStoreOptions, StoredCatalogHeader, StoredCollectionHeader,
};
use kestrel_storage::FileBackend;
use std::collections::BTreeMap;
use std::path::Path;

/// Writes a protocol 1 catalog directory.
#[derive(Debug, Clone)]
pub struct LegacyCatalogBuilder {
    name: String,
    version: CatalogVersion,
    state: CatalogState,
    wal_segment: Option<u32>,
    collections: BTreeMap<String, Vec<Product>>,
}

impl LegacyCatalogBuilder {
    /// A warming-up catalog at version 0 without collections.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: CatalogVersion::WARM_UP,
            state: CatalogState::WarmingUp,
            wal_segment: None,
            collections: BTreeMap::new(),
        }
    }

    /// Sets the catalog version of every header.
    #[must_use]
    pub fn version(mut self, version: CatalogVersion) -> Self {
        self.version = version;
        self
    }

    /// Marks the catalog alive with an empty WAL segment `index`.
    #[must_use]
    pub fn alive_with_wal(mut self, index: u32) -> Self {
        self.state = CatalogState::Alive;
        self.wal_segment = Some(index);
        self
    }

    /// Adds a collection holding `products`.
    #[must_use]
    pub fn collection(mut self, entity_type: &str, products: Vec<Product>) -> Self {
        self.collections.insert(entity_type.to_string(), products);
        self
    }

    /// Writes the files into `dir`.
    ///
    /// # Errors
    ///
    /// Fails if a file exists already or cannot be written.
    pub fn build(&self, dir: &Path) -> CoreResult<()> {
        let serialization = test_serialization();
        let options = RecordStoreOptions::from(&test_options());
        let record_type = serialization.type_id::<Product>()?;

        let mut references = BTreeMap::new();
        for (entity_type, products) in &self.collections {
            let path = dir.join(legacy_entity_file_name(entity_type, 0));
            let store = RecordStore::create(
                Box::new(FileBackend::create_new(&path)?),
                CatalogVersion::WARM_UP,
                options,
            )?;
            for product in products {
                store.put(
                    self.version,
                    RecordKey::new(record_type, product.id),
                    serialization.encode(product)?,
                )?;
            }
            let descriptor = store.flush(self.version)?;
            let header = EntityCollectionHeaderV1 {
                entity_type: entity_type.clone(),
                file_index: 0,
                version: self.version,
                record_count: descriptor.living_record_count,
                last_primary_key: products.iter().map(|p| p.id).max().unwrap_or(0),
                descriptor,
            };
            let header_location = store
                .write_root(self.version, StoredCollectionHeader::V1(header).encode()?)?;
            references.insert(
                entity_type.clone(),
                CollectionFileReferenceV1 {
                    entity_type: entity_type.clone(),
                    file_index: 0,
                    header_location,
                },
            );
        }

        let wal_file_path = match self.wal_segment {
            Some(index) => {
                let name = wal_file_name(&self.name, index);
                FileBackend::create_new(&dir.join(&name))?;
                Some(format!("./{name}"))
            }
            None => None,
        };

        let store = RecordStore::create(
            Box::new(FileBackend::create_new(&dir.join(catalog_file_name(&self.name, 0)))?),
            CatalogVersion::WARM_UP,
            options,
        )?;
        let header = CatalogHeaderV1 {
            catalog_name: self.name.clone(),
            state: self.state,
            version: self.version,
            catalog_file_index: 0,
            wal_file_path,
            collections: references,
            descriptor: store.flush(self.version)?,
        };
        let location = store.write_root(self.version, StoredCatalogHeader::V1(header).encode()?)?;

        BootstrapLog::create(
            &dir.join(bootstrap_file_name(&self.name)),
            BootstrapRecord {
                storage_protocol_version: 1,
                catalog_version: self.version,
                catalog_file_index: 0,
                timestamp_millis: now_millis(),
                header_location: Some(location),
            },
        )?;
        Ok(())
    }
}

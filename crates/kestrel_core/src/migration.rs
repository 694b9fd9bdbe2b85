//! Storage protocol upgrades.
//!
//! Every header carries the storage protocol version it was written with.
//! When a catalog written by an older engine is loaded, the registered
//! migrations are applied to an in-memory [`CatalogImage`] one version gap
//! at a time. Nothing is written while migrating: the catalog service
//! persists the upgraded headers and then commits them with exactly one
//! bootstrap record, so a partially upgraded catalog never becomes durable.
//!
//! A stored version newer than [`CURRENT_STORAGE_PROTOCOL_VERSION`] fails
//! with [`CoreError::UnsupportedProtocolVersion`] before anything else
//! happens.

use crate::dir::{parse_wal_file_name, WAL_EXTENSION};
use crate::error::{CoreError, CoreResult};
use crate::header::{
    CatalogHeader, CollectionFileReference, EntityCollectionHeader, StoredCatalogHeader,
    StoredCollectionHeader, WalFileReference, CURRENT_STORAGE_PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

/// The headers of one catalog as they were read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogImage {
    /// Catalog header.
    pub catalog: StoredCatalogHeader,
    /// Collection headers keyed by entity type.
    pub collections: BTreeMap<String, StoredCollectionHeader>,
}

impl CatalogImage {
    /// Protocol version of the catalog header.
    #[must_use]
    pub fn protocol_version(&self) -> u32 {
        self.catalog.protocol_version()
    }

    /// Splits a fully upgraded image into current-protocol headers.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MigrationFailed`] if any header is still in an
    /// older shape.
    pub fn into_current(
        self,
    ) -> CoreResult<(CatalogHeader, BTreeMap<String, EntityCollectionHeader>)> {
        let catalog = self.catalog.into_current()?;
        let collections = self
            .collections
            .into_iter()
            .map(|(name, header)| Ok((name, header.into_current()?)))
            .collect::<CoreResult<_>>()?;
        Ok((catalog, collections))
    }
}

/// Information about a registered migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Protocol version the migration upgrades from.
    pub from_version: u32,
    /// Human-readable name.
    pub name: String,
}

/// One protocol version step.
pub trait HeaderMigration: Send + Sync {
    /// Protocol version this step reads. It produces `from_version + 1`.
    fn from_version(&self) -> u32;

    /// Human-readable name, for logs.
    fn name(&self) -> &str;

    /// Rewrites the image into the next protocol shape.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MigrationFailed`] if the image cannot be
    /// upgraded.
    fn migrate(&self, image: CatalogImage) -> CoreResult<CatalogImage>;
}

/// Outcome of [`MigrationRegistry::upgrade`].
#[derive(Debug, Clone)]
pub struct UpgradeOutcome {
    /// The image in the current protocol shape.
    pub image: CatalogImage,
    /// Protocol version the image was stored with.
    pub stored_version: u32,
    /// Steps that were applied, oldest first.
    pub applied: Vec<MigrationInfo>,
}

impl UpgradeOutcome {
    /// Returns `true` if at least one step ran.
    #[must_use]
    pub fn upgraded(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Registered migrations keyed by the version they upgrade from.
pub struct MigrationRegistry {
    steps: BTreeMap<u32, Box<dyn HeaderMigration>>,
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MigrationRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            steps: BTreeMap::new(),
        }
    }

    /// The registry with every step this engine ships.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.steps.insert(1, Box::new(IdentityAndWalIndexes));
        registry
    }

    /// Registers a step.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MigrationFailed`] if a step for the same
    /// version is already registered.
    pub fn register(&mut self, step: Box<dyn HeaderMigration>) -> CoreResult<()> {
        let version = step.from_version();
        if self.steps.contains_key(&version) {
            return Err(CoreError::migration_failed(format!(
                "migration from protocol {version} already registered"
            )));
        }
        self.steps.insert(version, step);
        Ok(())
    }

    /// Registered steps, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.steps.values().map(|step| info_of(step.as_ref())).collect()
    }

    /// Checks that the steps form an unbroken chain ending at the current
    /// protocol version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MigrationFailed`] on a gap.
    pub fn validate(&self) -> CoreResult<()> {
        let Some(&first) = self.steps.keys().next() else {
            return Ok(());
        };
        for (offset, version) in self.steps.keys().enumerate() {
            let expected = first + offset as u32;
            if *version != expected {
                return Err(CoreError::migration_failed(format!(
                    "migration gap: expected step from {expected}, got {version}"
                )));
            }
        }
        let last = first + self.steps.len() as u32;
        if last != CURRENT_STORAGE_PROTOCOL_VERSION {
            return Err(CoreError::migration_failed(format!(
                "migrations end at protocol {last}, engine writes {CURRENT_STORAGE_PROTOCOL_VERSION}"
            )));
        }
        Ok(())
    }

    /// Applies every step between the image's version and the current one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedProtocolVersion`] for images newer
    /// than this engine, or [`CoreError::MigrationFailed`] if a step is
    /// missing or fails.
    pub fn upgrade(&self, image: CatalogImage) -> CoreResult<UpgradeOutcome> {
        let stored_version = image.protocol_version();
        check_supported(stored_version)?;

        let mut image = image;
        let mut applied = Vec::new();
        while image.protocol_version() < CURRENT_STORAGE_PROTOCOL_VERSION {
            let from = image.protocol_version();
            let step = self.steps.get(&from).ok_or_else(|| {
                CoreError::migration_failed(format!("no migration registered from protocol {from}"))
            })?;
            image = step.migrate(image)?;
            if image.protocol_version() != from + 1 {
                return Err(CoreError::migration_failed(format!(
                    "migration `{}` produced protocol {} instead of {}",
                    step.name(),
                    image.protocol_version(),
                    from + 1
                )));
            }
            info!(from, to = from + 1, migration = step.name(), "applied header migration");
            applied.push(info_of(step.as_ref()));
        }
        Ok(UpgradeOutcome {
            image,
            stored_version,
            applied,
        })
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Fails fast on protocol versions this engine cannot read.
///
/// # Errors
///
/// Returns [`CoreError::UnsupportedProtocolVersion`].
pub fn check_supported(found: u32) -> CoreResult<()> {
    if found > CURRENT_STORAGE_PROTOCOL_VERSION || found == 0 {
        return Err(CoreError::UnsupportedProtocolVersion {
            found,
            supported: CURRENT_STORAGE_PROTOCOL_VERSION,
        });
    }
    Ok(())
}

fn info_of(step: &dyn HeaderMigration) -> MigrationInfo {
    MigrationInfo {
        from_version: step.from_version(),
        name: step.name().to_string(),
    }
}

/// Protocol 1 to 2.
///
/// Gives the catalog an id, numbers entity types in name order and turns
/// the WAL file path into a segment index.
#[derive(Debug)]
struct IdentityAndWalIndexes;

impl HeaderMigration for IdentityAndWalIndexes {
    fn from_version(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "catalog-identity-and-wal-indexes"
    }

    fn migrate(&self, image: CatalogImage) -> CoreResult<CatalogImage> {
        let StoredCatalogHeader::V1(catalog) = image.catalog else {
            return Err(CoreError::migration_failed("expected a protocol 1 catalog header"));
        };

        let wal = match &catalog.wal_file_path {
            None => None,
            Some(path) => {
                let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
                let file_index = parse_wal_file_name(&catalog.catalog_name, file_name)
                    .ok_or_else(|| {
                        CoreError::migration_failed(format!(
                            "WAL path `{path}` is not a `{}_N.{WAL_EXTENSION}` segment",
                            catalog.catalog_name
                        ))
                    })?;
                Some(WalFileReference {
                    catalog_name: catalog.catalog_name.clone(),
                    file_index,
                    last_location: None,
                })
            }
        };

        let mut type_keys = BTreeMap::new();
        let mut references = BTreeMap::new();
        for (position, (entity_type, reference)) in catalog.collections.iter().enumerate() {
            let type_pk = position as i32 + 1;
            type_keys.insert(entity_type.clone(), type_pk);
            references.insert(
                entity_type.clone(),
                CollectionFileReference {
                    entity_type: reference.entity_type.clone(),
                    entity_type_primary_key: type_pk,
                    file_index: reference.file_index,
                    header_location: reference.header_location,
                },
            );
        }

        let mut collections = BTreeMap::new();
        for (entity_type, stored) in image.collections {
            let StoredCollectionHeader::V1(old) = stored else {
                return Err(CoreError::migration_failed(format!(
                    "collection `{entity_type}` is not in protocol 1 shape"
                )));
            };
            let type_pk = *type_keys.get(&entity_type).ok_or_else(|| {
                CoreError::migration_failed(format!(
                    "collection `{entity_type}` is not referenced by the catalog header"
                ))
            })?;
            let header = EntityCollectionHeader {
                entity_type: old.entity_type,
                entity_type_primary_key: type_pk,
                file_index: old.file_index,
                version: old.version,
                record_count: old.record_count,
                last_primary_key: old.last_primary_key,
                last_index_key: 0,
                last_internal_price_id: 0,
                active_record_share: old.descriptor.active_record_share(),
                descriptor: old.descriptor,
            };
            collections.insert(entity_type, StoredCollectionHeader::V2(header));
        }

        let header = CatalogHeader {
            storage_protocol_version: 2,
            catalog_id: Uuid::new_v4(),
            catalog_name: catalog.catalog_name,
            state: catalog.state,
            version: catalog.version,
            catalog_file_index: catalog.catalog_file_index,
            wal,
            last_entity_collection_primary_key: references.len() as i32,
            collections: references,
            active_record_share: catalog.descriptor.active_record_share(),
            descriptor: catalog.descriptor,
        };
        Ok(CatalogImage {
            catalog: StoredCatalogHeader::V2(header),
            collections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{CatalogHeaderV1, CollectionFileReferenceV1, EntityCollectionHeaderV1};
    use crate::offset_index::OffsetIndexDescriptor;
    use crate::types::{CatalogState, CatalogVersion, FileLocation};

    fn v1_image() -> CatalogImage {
        let version = CatalogVersion::new(5);
        let mut references = BTreeMap::new();
        let mut collections = BTreeMap::new();
        for (name, index) in [("product", 2u32), ("brand", 0)] {
            references.insert(
                name.to_string(),
                CollectionFileReferenceV1 {
                    entity_type: name.to_string(),
                    file_index: index,
                    header_location: FileLocation::new(100, 40),
                },
            );
            collections.insert(
                name.to_string(),
                StoredCollectionHeader::V1(EntityCollectionHeaderV1 {
                    entity_type: name.to_string(),
                    file_index: index,
                    version,
                    record_count: 3,
                    last_primary_key: 3,
                    descriptor: OffsetIndexDescriptor::empty(version),
                }),
            );
        }
        CatalogImage {
            catalog: StoredCatalogHeader::V1(CatalogHeaderV1 {
                catalog_name: "shop".into(),
                state: CatalogState::Alive,
                version,
                catalog_file_index: 1,
                wal_file_path: Some("data/shop_4.wal".into()),
                collections: references,
                descriptor: OffsetIndexDescriptor::empty(version),
            }),
            collections,
        }
    }

    struct Broken;

    impl HeaderMigration for Broken {
        fn from_version(&self) -> u32 {
            1
        }

        fn name(&self) -> &str {
            "broken"
        }

        fn migrate(&self, image: CatalogImage) -> CoreResult<CatalogImage> {
            Ok(image)
        }
    }

    #[test]
    fn standard_registry_is_complete() {
        let registry = MigrationRegistry::standard();
        registry.validate().unwrap();
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn upgrades_v1_image() {
        let outcome = MigrationRegistry::standard().upgrade(v1_image()).unwrap();
        assert!(outcome.upgraded());
        assert_eq!(outcome.stored_version, 1);

        let (catalog, collections) = outcome.image.into_current().unwrap();
        assert_eq!(catalog.storage_protocol_version, CURRENT_STORAGE_PROTOCOL_VERSION);
        assert!(!catalog.catalog_id.is_nil());
        assert_eq!(catalog.last_entity_collection_primary_key, 2);
        assert_eq!(catalog.collections["brand"].entity_type_primary_key, 1);
        assert_eq!(catalog.collections["product"].entity_type_primary_key, 2);
        assert_eq!(catalog.wal.as_ref().map(|w| w.file_index), Some(4));
        assert_eq!(collections["product"].entity_type_primary_key, 2);
        assert_eq!(collections["product"].file_index, 2);
    }

    #[test]
    fn current_image_is_untouched() {
        let image = CatalogImage {
            catalog: StoredCatalogHeader::V2(CatalogHeader::new("shop")),
            collections: BTreeMap::new(),
        };
        let outcome = MigrationRegistry::standard().upgrade(image.clone()).unwrap();
        assert!(!outcome.upgraded());
        assert_eq!(outcome.image, image);
    }

    #[test]
    fn missing_step_fails() {
        let result = MigrationRegistry::new().upgrade(v1_image());
        assert!(matches!(result, Err(CoreError::MigrationFailed { .. })));
    }

    #[test]
    fn step_must_advance_version() {
        let mut registry = MigrationRegistry::new();
        registry.register(Box::new(Broken)).unwrap();
        assert!(registry.register(Box::new(Broken)).is_err());
        assert!(registry.upgrade(v1_image()).is_err());
    }

    #[test]
    fn future_versions_fail_fast() {
        assert!(matches!(
            check_supported(CURRENT_STORAGE_PROTOCOL_VERSION + 1),
            Err(CoreError::UnsupportedProtocolVersion { found: 3, supported: 2 })
        ));
        check_supported(1).unwrap();
    }

    #[test]
    fn bad_wal_path_is_rejected() {
        let mut image = v1_image();
        if let StoredCatalogHeader::V1(header) = &mut image.catalog {
            header.wal_file_path = Some("other.log".into());
        }
        assert!(MigrationRegistry::standard().upgrade(image).is_err());
    }
}

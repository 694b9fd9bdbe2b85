//! Catalog and entity-collection headers.
//!
//! Headers are the root records of their files. A catalog header lives in
//! `{catalog}_{fileIndex}.catalog` and is pointed at by the bootstrap log;
//! each entity-collection header lives in its own `.entity` file and is
//! pointed at by the catalog header.
//!
//! On disk every header is wrapped in a tagged enum whose tag is the
//! storage protocol version it was written with. Older shapes stay
//! decodable and are upgraded by [`crate::migration`].

use crate::error::{CoreError, CoreResult};
use crate::offset_index::OffsetIndexDescriptor;
use crate::types::{CatalogState, CatalogVersion, FileLocation};
use kestrel_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Protocol version written by this engine.
pub const CURRENT_STORAGE_PROTOCOL_VERSION: u32 = 2;

/// Where the WAL of a catalog continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalFileReference {
    /// Catalog the WAL belongs to.
    pub catalog_name: String,
    /// Index of the segment `{catalog}_{index}.wal`.
    pub file_index: u32,
    /// Last transaction record written before the header, if any.
    pub last_location: Option<FileLocation>,
}

impl WalFileReference {
    /// File name of the referenced segment.
    #[must_use]
    pub fn file_name(&self) -> String {
        crate::dir::wal_file_name(&self.catalog_name, self.file_index)
    }
}

/// Pointer from a catalog header to one entity-collection generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFileReference {
    /// Entity type name.
    pub entity_type: String,
    /// Catalog-unique id of the entity type.
    pub entity_type_primary_key: i32,
    /// Generation of the `.entity` file.
    pub file_index: u32,
    /// Location of the collection header inside that file.
    pub header_location: FileLocation,
}

impl CollectionFileReference {
    /// File name of the referenced generation.
    #[must_use]
    pub fn file_name(&self) -> String {
        crate::dir::entity_file_name(
            &self.entity_type,
            self.entity_type_primary_key,
            self.file_index,
        )
    }
}

/// Root record of one entity collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCollectionHeader {
    /// Entity type name.
    pub entity_type: String,
    /// Catalog-unique id of the entity type.
    pub entity_type_primary_key: i32,
    /// Generation of the `.entity` file.
    pub file_index: u32,
    /// Catalog version the header was written at.
    pub version: CatalogVersion,
    /// Live records in the collection.
    pub record_count: u64,
    /// Highest primary key handed out to an entity.
    pub last_primary_key: i64,
    /// Highest internal index key handed out.
    pub last_index_key: i32,
    /// Highest internal price id handed out.
    pub last_internal_price_id: i64,
    /// Live share of the data file at the time of writing.
    pub active_record_share: f64,
    /// Descriptor of the collection's record store.
    pub descriptor: OffsetIndexDescriptor,
}

impl EntityCollectionHeader {
    /// Header of a collection that has never been flushed.
    #[must_use]
    pub fn new(entity_type: &str, entity_type_primary_key: i32, version: CatalogVersion) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_type_primary_key,
            file_index: 0,
            version,
            record_count: 0,
            last_primary_key: 0,
            last_index_key: 0,
            last_internal_price_id: 0,
            active_record_share: 1.0,
            descriptor: OffsetIndexDescriptor::empty(version),
        }
    }

    /// Key dictionary of the collection.
    #[must_use]
    pub fn key_dictionary(&self) -> &BTreeMap<i32, String> {
        &self.descriptor.key_dictionary
    }
}

/// Root record of a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogHeader {
    /// Protocol version this header was written with.
    pub storage_protocol_version: u32,
    /// Stable identity of the catalog.
    pub catalog_id: Uuid,
    /// Catalog name; must match the directory contents.
    pub catalog_name: String,
    /// Lifecycle state.
    pub state: CatalogState,
    /// Catalog version the header belongs to.
    pub version: CatalogVersion,
    /// Generation of the catalog file.
    pub catalog_file_index: u32,
    /// WAL continuation point; `None` while warming up.
    pub wal: Option<WalFileReference>,
    /// Entity type name to collection generation.
    pub collections: BTreeMap<String, CollectionFileReference>,
    /// Highest entity type id handed out.
    pub last_entity_collection_primary_key: i32,
    /// Live share of the catalog file at the time of writing.
    pub active_record_share: f64,
    /// Descriptor of the catalog's own record store.
    pub descriptor: OffsetIndexDescriptor,
}

impl CatalogHeader {
    /// Header of a freshly created catalog.
    #[must_use]
    pub fn new(catalog_name: &str) -> Self {
        Self {
            storage_protocol_version: CURRENT_STORAGE_PROTOCOL_VERSION,
            catalog_id: Uuid::new_v4(),
            catalog_name: catalog_name.to_string(),
            state: CatalogState::WarmingUp,
            version: CatalogVersion::WARM_UP,
            catalog_file_index: 0,
            wal: None,
            collections: BTreeMap::new(),
            last_entity_collection_primary_key: 0,
            active_record_share: 1.0,
            descriptor: OffsetIndexDescriptor::empty(CatalogVersion::WARM_UP),
        }
    }

    /// Key dictionary of the catalog file.
    #[must_use]
    pub fn key_dictionary(&self) -> &BTreeMap<i32, String> {
        &self.descriptor.key_dictionary
    }

    /// Encodes the header in the current protocol shape.
    ///
    /// # Errors
    ///
    /// Fails if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(&StoredCatalogHeaderRef::V2(self))?)
    }
}

/// Pointer to a collection in the protocol 1 catalog header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFileReferenceV1 {
    /// Entity type name.
    pub entity_type: String,
    /// Generation of the `.entity` file.
    pub file_index: u32,
    /// Location of the collection header.
    pub header_location: FileLocation,
}

/// Protocol 1 catalog header.
///
/// Protocol 1 had no catalog id and no entity type ids, and referenced the
/// WAL by file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogHeaderV1 {
    /// Catalog name.
    pub catalog_name: String,
    /// Lifecycle state.
    pub state: CatalogState,
    /// Catalog version.
    pub version: CatalogVersion,
    /// Generation of the catalog file.
    pub catalog_file_index: u32,
    /// Path of the WAL segment, relative to the catalog directory.
    pub wal_file_path: Option<String>,
    /// Entity type name to collection generation.
    pub collections: BTreeMap<String, CollectionFileReferenceV1>,
    /// Descriptor of the catalog's record store.
    pub descriptor: OffsetIndexDescriptor,
}

/// Protocol 1 entity-collection header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCollectionHeaderV1 {
    /// Entity type name.
    pub entity_type: String,
    /// Generation of the `.entity` file.
    pub file_index: u32,
    /// Catalog version.
    pub version: CatalogVersion,
    /// Live records.
    pub record_count: u64,
    /// Highest primary key handed out.
    pub last_primary_key: i64,
    /// Descriptor of the record store.
    pub descriptor: OffsetIndexDescriptor,
}

/// A catalog header as found on disk, tagged by protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol")]
pub enum StoredCatalogHeader {
    /// Protocol 1.
    #[serde(rename = "1")]
    V1(CatalogHeaderV1),
    /// Protocol 2.
    #[serde(rename = "2")]
    V2(CatalogHeader),
}

#[derive(Serialize)]
#[serde(tag = "protocol")]
enum StoredCatalogHeaderRef<'a> {
    #[serde(rename = "2")]
    V2(&'a CatalogHeader),
}

impl StoredCatalogHeader {
    /// Protocol version of the stored shape.
    #[must_use]
    pub fn protocol_version(&self) -> u32 {
        match self {
            Self::V1(_) => 1,
            Self::V2(_) => 2,
        }
    }

    /// Name of the catalog the header belongs to.
    #[must_use]
    pub fn catalog_name(&self) -> &str {
        match self {
            Self::V1(h) => &h.catalog_name,
            Self::V2(h) => &h.catalog_name,
        }
    }

    /// Decodes a stored header.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not a known header shape.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        Ok(from_cbor(bytes)?)
    }

    /// Encodes the header in its own shape.
    ///
    /// # Errors
    ///
    /// Fails if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(self)?)
    }

    /// Returns the current-protocol header.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MigrationFailed`] for an older shape that was
    /// not upgraded first.
    pub fn into_current(self) -> CoreResult<CatalogHeader> {
        match self {
            Self::V2(header) => Ok(header),
            other => Err(CoreError::migration_failed(format!(
                "catalog header of protocol {} was not upgraded",
                other.protocol_version()
            ))),
        }
    }
}

/// An entity-collection header as found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol")]
pub enum StoredCollectionHeader {
    /// Protocol 1.
    #[serde(rename = "1")]
    V1(EntityCollectionHeaderV1),
    /// Protocol 2.
    #[serde(rename = "2")]
    V2(EntityCollectionHeader),
}

#[derive(Serialize)]
#[serde(tag = "protocol")]
enum StoredCollectionHeaderRef<'a> {
    #[serde(rename = "2")]
    V2(&'a EntityCollectionHeader),
}

impl StoredCollectionHeader {
    /// Protocol version of the stored shape.
    #[must_use]
    pub fn protocol_version(&self) -> u32 {
        match self {
            Self::V1(_) => 1,
            Self::V2(_) => 2,
        }
    }

    /// Decodes a stored header.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not a known header shape.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        Ok(from_cbor(bytes)?)
    }

    /// Encodes the header in its own shape.
    ///
    /// # Errors
    ///
    /// Fails if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(self)?)
    }

    /// Returns the current-protocol header.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MigrationFailed`] for an older shape.
    pub fn into_current(self) -> CoreResult<EntityCollectionHeader> {
        match self {
            Self::V2(header) => Ok(header),
            other => Err(CoreError::migration_failed(format!(
                "collection header of protocol {} was not upgraded",
                other.protocol_version()
            ))),
        }
    }
}

impl EntityCollectionHeader {
    /// Encodes the header in the current protocol shape.
    ///
    /// # Errors
    ///
    /// Fails if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(&StoredCollectionHeaderRef::V2(self))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_header_roundtrip() {
        let mut header = CatalogHeader::new("products");
        header.collections.insert(
            "brand".into(),
            CollectionFileReference {
                entity_type: "brand".into(),
                entity_type_primary_key: 1,
                file_index: 3,
                header_location: FileLocation::new(400, 90),
            },
        );
        header.descriptor.key_dictionary.insert(1, "locale:en".into());

        let stored = StoredCatalogHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(stored.protocol_version(), CURRENT_STORAGE_PROTOCOL_VERSION);
        assert_eq!(stored.into_current().unwrap(), header);
    }

    #[test]
    fn legacy_header_decodes_as_v1() {
        let legacy = StoredCatalogHeader::V1(CatalogHeaderV1 {
            catalog_name: "products".into(),
            state: CatalogState::Alive,
            version: CatalogVersion::new(7),
            catalog_file_index: 1,
            wal_file_path: Some("products_2.wal".into()),
            collections: BTreeMap::new(),
            descriptor: OffsetIndexDescriptor::empty(CatalogVersion::new(7)),
        });
        let decoded = StoredCatalogHeader::decode(&legacy.encode().unwrap()).unwrap();
        assert_eq!(decoded.protocol_version(), 1);
        assert_eq!(decoded.catalog_name(), "products");
        assert!(matches!(
            decoded.into_current(),
            Err(CoreError::MigrationFailed { .. })
        ));
    }

    #[test]
    fn collection_header_roundtrip() {
        let header = EntityCollectionHeader::new("product", 4, CatalogVersion::new(2));
        let stored = StoredCollectionHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(stored.into_current().unwrap(), header);
    }

    #[test]
    fn reference_file_names() {
        let reference = CollectionFileReference {
            entity_type: "product".into(),
            entity_type_primary_key: 4,
            file_index: 2,
            header_location: FileLocation::new(0, 1),
        };
        assert_eq!(reference.file_name(), "product_4_2.entity");
        let wal = WalFileReference {
            catalog_name: "products".into(),
            file_index: 3,
            last_location: None,
        };
        assert_eq!(wal.file_name(), "products_3.wal");
    }
}

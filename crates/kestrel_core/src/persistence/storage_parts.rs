//! Typed access to the storage parts of one file generation.

use super::PersistenceContext;
use crate::error::CoreResult;
use crate::offset_index::{FileStatistics, OffsetIndexDescriptor, RecordStore};
use crate::types::{CatalogVersion, FileLocation, RecordKey};
use kestrel_codec::StoragePart;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Typed facade over one [`RecordStore`] generation.
///
/// Parts are addressed by their Rust type (mapped to an on-disk type id by
/// the serialization context) and a primary key.
///
/// # Example
///
/// ```rust,ignore
/// let pk = parts.put(version, &PriceList { id: 7, currency: "EUR".into() })?;
/// let list: Option<PriceList> = parts.get(version, pk)?;
/// parts.flush(version)?;
/// ```
#[derive(Debug)]
pub struct StoragePartPersistence {
    store: RecordStore,
    path: PathBuf,
    file_index: u32,
    ctx: Arc<PersistenceContext>,
}

impl StoragePartPersistence {
    pub(crate) fn new(
        store: RecordStore,
        path: PathBuf,
        file_index: u32,
        ctx: Arc<PersistenceContext>,
    ) -> Self {
        Self {
            store,
            path,
            file_index,
            ctx,
        }
    }

    /// Path of the file generation.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generation index of the file.
    #[must_use]
    pub fn file_index(&self) -> u32 {
        self.file_index
    }

    /// The underlying record store.
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Descriptor of the latest flush.
    #[must_use]
    pub fn descriptor(&self) -> OffsetIndexDescriptor {
        self.store.descriptor()
    }

    /// Reads the part of type `T` with `primary_key` visible at `version`.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not registered, the record is damaged or its payload
    /// is not a valid `T`.
    pub fn get<T: StoragePart>(
        &self,
        version: CatalogVersion,
        primary_key: i64,
    ) -> CoreResult<Option<T>> {
        let key = RecordKey::new(self.ctx.serialization.type_id::<T>()?, primary_key);
        match self.store.get(version, key)? {
            Some(payload) => Ok(Some(self.ctx.serialization.decode::<T>(&payload)?)),
            None => Ok(None),
        }
    }

    /// Reads a raw payload by type id.
    ///
    /// # Errors
    ///
    /// Fails if the record is damaged.
    pub fn get_binary(
        &self,
        version: CatalogVersion,
        record_type: u8,
        primary_key: i64,
    ) -> CoreResult<Option<Vec<u8>>> {
        self.store.get(version, RecordKey::new(record_type, primary_key))
    }

    /// Stages `part` at `version` and returns its primary key.
    ///
    /// Parts without an intrinsic key derive one through the file's key
    /// dictionary.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not registered, no key can be derived, the payload
    /// is too large or `version` is not the open version.
    pub fn put<T: StoragePart>(&self, version: CatalogVersion, part: &T) -> CoreResult<i64> {
        let record_type = self.ctx.serialization.type_id::<T>()?;
        let primary_key = self.store.with_keys(|keys| part.resolve_pk(keys))?;
        let payload = self.ctx.serialization.encode(part)?;
        self.store
            .put(version, RecordKey::new(record_type, primary_key), payload)?;
        Ok(primary_key)
    }

    /// Stages a raw payload by type id.
    ///
    /// # Errors
    ///
    /// Fails if the payload is too large or `version` is not the open
    /// version.
    pub fn put_binary(
        &self,
        version: CatalogVersion,
        record_type: u8,
        primary_key: i64,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        self.store
            .put(version, RecordKey::new(record_type, primary_key), payload)
    }

    /// Stages the removal of a part. Returns `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not registered or `version` is not the open version.
    pub fn remove<T: StoragePart>(
        &self,
        version: CatalogVersion,
        primary_key: i64,
    ) -> CoreResult<bool> {
        let key = RecordKey::new(self.ctx.serialization.type_id::<T>()?, primary_key);
        self.store.remove(version, key)
    }

    /// Stages the removal of a raw record.
    ///
    /// # Errors
    ///
    /// Fails if `version` is not the open version.
    pub fn remove_binary(
        &self,
        version: CatalogVersion,
        record_type: u8,
        primary_key: i64,
    ) -> CoreResult<bool> {
        self.store
            .remove(version, RecordKey::new(record_type, primary_key))
    }

    /// Returns `true` if the part exists at `version`.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not registered.
    pub fn contains<T: StoragePart>(
        &self,
        version: CatalogVersion,
        primary_key: i64,
    ) -> CoreResult<bool> {
        let key = RecordKey::new(self.ctx.serialization.type_id::<T>()?, primary_key);
        self.store.contains(version, key)
    }

    /// Number of parts of type `T` at `version`.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not registered.
    pub fn count<T: StoragePart>(&self, version: CatalogVersion) -> CoreResult<u64> {
        let record_type = self.ctx.serialization.type_id::<T>()?;
        self.store.count(version, Some(record_type))
    }

    /// Number of records of any type at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`](crate::CoreError::Closed) once the
    /// generation was retired.
    pub fn count_all(&self, version: CatalogVersion) -> CoreResult<u64> {
        self.store.count(version, None)
    }

    /// Primary keys of every `T` at `version`, ascending.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not registered.
    pub fn primary_keys<T: StoragePart>(&self, version: CatalogVersion) -> CoreResult<Vec<i64>> {
        let record_type = self.ctx.serialization.type_id::<T>()?;
        self.store.primary_keys(version, record_type)
    }

    /// Seals the staged changes and returns the descriptor to store in the
    /// owning header.
    ///
    /// # Errors
    ///
    /// Fails if a write fails; the previous descriptor stays authoritative.
    pub fn flush(&self, version: CatalogVersion) -> CoreResult<OffsetIndexDescriptor> {
        let before = self.store.descriptor();
        let descriptor = self.store.flush(version)?;
        if descriptor != before {
            self.ctx
                .observer
                .record_store_flushed(self.store.name(), &descriptor);
        }
        Ok(descriptor)
    }

    /// Spills staged payloads to the file to release memory.
    ///
    /// # Errors
    ///
    /// Fails if an append fails.
    pub fn flush_trapped(&self) -> CoreResult<u64> {
        self.store.flush_trapped()
    }

    /// Appends a header record.
    pub(crate) fn write_header(
        &self,
        version: CatalogVersion,
        payload: Vec<u8>,
    ) -> CoreResult<FileLocation> {
        let location = self.store.write_root(version, payload)?;
        self.ctx
            .observer
            .header_written(self.store.name(), version, location);
        Ok(location)
    }

    /// Checksum scan of the whole file.
    ///
    /// # Errors
    ///
    /// Fails on the first damaged record.
    pub fn verify(&self) -> CoreResult<FileStatistics> {
        self.store.verify_contents()
    }

    /// Closes the generation; later reads fail with `Closed`.
    pub fn close(&self) {
        self.store.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::error::CoreError;
    use crate::observer::NoopObserver;
    use crate::offset_index::RecordStoreOptions;
    use kestrel_codec::{compose_pk, CodecError, KeyCompressor, SerializationContext};
    use kestrel_storage::InMemoryBackend;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Price {
        id: i64,
        amount: u32,
    }

    impl StoragePart for Price {
        const RECORD_TYPE: &'static str = "price";
        fn storage_part_pk(&self) -> Option<i64> {
            Some(self.id)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Label {
        locale: String,
        text: String,
    }

    impl StoragePart for Label {
        const RECORD_TYPE: &'static str = "label";
        fn storage_part_pk(&self) -> Option<i64> {
            None
        }
        fn compute_unique_part_id(&self, keys: &mut KeyCompressor) -> Result<i64, CodecError> {
            Ok(compose_pk(keys.get_or_assign(&self.locale), 0))
        }
    }

    fn v(n: u64) -> CatalogVersion {
        CatalogVersion::new(n)
    }

    fn parts() -> StoragePartPersistence {
        let serialization = SerializationContext::builder()
            .register::<Price>()
            .unwrap()
            .register::<Label>()
            .unwrap()
            .build()
            .shared();
        let ctx = PersistenceContext::new(
            StorageOptions::default(),
            serialization,
            Arc::new(NoopObserver),
        );
        let store = RecordStore::create(
            Box::new(InMemoryBackend::new()),
            v(0),
            RecordStoreOptions::default(),
        )
        .unwrap();
        StoragePartPersistence::new(store, PathBuf::from("test.entity"), 0, ctx)
    }

    #[test]
    fn typed_roundtrip() {
        let parts = parts();
        let price = Price { id: 3, amount: 1999 };
        assert_eq!(parts.put(v(1), &price).unwrap(), 3);
        assert_eq!(parts.get::<Price>(v(1), 3).unwrap(), Some(price.clone()));
        assert_eq!(parts.get::<Price>(v(0), 3).unwrap(), None);

        parts.flush(v(1)).unwrap();
        assert_eq!(parts.get::<Price>(v(1), 3).unwrap(), Some(price));
        assert_eq!(parts.count::<Price>(v(1)).unwrap(), 1);
        assert_eq!(parts.count::<Label>(v(1)).unwrap(), 0);
    }

    #[test]
    fn types_do_not_collide() {
        let parts = parts();
        parts.put(v(1), &Price { id: 1, amount: 5 }).unwrap();
        let label_pk = parts
            .put(v(1), &Label { locale: "en".into(), text: "Shoe".into() })
            .unwrap();
        assert_eq!(label_pk, 1 << 32);
        assert!(parts.contains::<Price>(v(1), 1).unwrap());
        assert!(!parts.contains::<Label>(v(1), 1).unwrap());
        assert!(!parts.contains::<Price>(v(1), label_pk).unwrap());
        assert_eq!(parts.count_all(v(1)).unwrap(), 2);
    }

    #[test]
    fn derived_keys_land_in_dictionary() {
        let parts = parts();
        let pk = parts
            .put(v(1), &Label { locale: "de".into(), text: "Schuh".into() })
            .unwrap();
        let descriptor = parts.flush(v(1)).unwrap();
        assert!(descriptor.key_dictionary.values().any(|k| k == "de"));
        assert_eq!(
            parts.get::<Label>(v(1), pk).unwrap().map(|l| l.text),
            Some("Schuh".to_string())
        );
    }

    #[test]
    fn remove_and_primary_keys() {
        let parts = parts();
        for id in [5, 1, 3] {
            parts.put(v(1), &Price { id, amount: 1 }).unwrap();
        }
        parts.flush(v(1)).unwrap();
        assert!(parts.remove::<Price>(v(2), 3).unwrap());
        assert!(!parts.remove::<Price>(v(2), 42).unwrap());
        assert_eq!(parts.primary_keys::<Price>(v(2)).unwrap(), vec![1, 5]);
        assert_eq!(parts.primary_keys::<Price>(v(1)).unwrap(), vec![1, 3, 5]);
    }

    #[test]
    fn unregistered_type_is_rejected() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Stray;
        impl StoragePart for Stray {
            const RECORD_TYPE: &'static str = "stray";
            fn storage_part_pk(&self) -> Option<i64> {
                Some(1)
            }
        }
        let parts = parts();
        assert!(matches!(
            parts.put(v(1), &Stray),
            Err(CoreError::Codec(CodecError::UnknownRecordType { .. }))
        ));
    }

    #[test]
    fn binary_access_matches_typed() {
        let parts = parts();
        let type_id = parts.ctx.serialization.type_id::<Price>().unwrap();
        parts.put(v(1), &Price { id: 9, amount: 7 }).unwrap();
        let raw = parts.get_binary(v(1), type_id, 9).unwrap().unwrap();
        parts.put_binary(v(1), type_id, 10, raw).unwrap();
        assert_eq!(
            parts.get::<Price>(v(1), 10).unwrap(),
            Some(Price { id: 9, amount: 7 })
        );
        assert!(parts.remove_binary(v(1), type_id, 10).unwrap());
    }
}

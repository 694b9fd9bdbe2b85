//! Test fixtures and catalog helpers.
//!
//! Provides sample storage parts and catalogs in temporary directories
//! that can be closed and reopened like a restarted process.

use crate::observer::RecordingObserver;
use kestrel_codec::{compose_pk, CodecResult, KeyCompressor, SerializationContext, StoragePart};
use kestrel_core::{
    CatalogPersistence, CatalogVersion, MigrationRegistry, StorageObserver, StorageOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Catalog name used by every fixture.
pub const TEST_CATALOG: &str = "testcat";

/// A sample part with an intrinsic primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Price in cents.
    pub price_cents: u64,
}

impl Product {
    /// A product whose fields derive from `id`.
    #[must_use]
    pub fn sample(id: i64) -> Self {
        Self {
            id,
            name: format!("product-{id}"),
            price_cents: (id.unsigned_abs() % 10_000) * 3,
        }
    }
}

impl StoragePart for Product {
    const RECORD_TYPE: &'static str = "product";

    fn storage_part_pk(&self) -> Option<i64> {
        Some(self.id)
    }
}

/// A sample part keyed through the file's key dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Locale the value belongs to.
    pub locale: String,
    /// The value.
    pub value: String,
}

impl StoragePart for Attribute {
    const RECORD_TYPE: &'static str = "attribute";

    fn storage_part_pk(&self) -> Option<i64> {
        None
    }

    fn compute_unique_part_id(&self, keys: &mut KeyCompressor) -> CodecResult<i64> {
        let name = keys.get_or_assign(&self.name);
        let locale = keys.get_or_assign(&self.locale);
        Ok(compose_pk(name, locale))
    }
}

/// Serialization context knowing [`Product`] and [`Attribute`].
///
/// # Panics
///
/// Never; both types have distinct names.
#[must_use]
pub fn test_serialization() -> Arc<SerializationContext> {
    SerializationContext::builder()
        .register::<Product>()
        .and_then(|builder| builder.register::<Attribute>())
        .expect("sample parts register")
        .build()
        .shared()
}

/// Options for tests: no fsync, default compaction thresholds.
#[must_use]
pub fn test_options() -> StorageOptions {
    StorageOptions::default().sync_writes(false)
}

/// Options that compact any file whose live share drops below one half.
#[must_use]
pub fn eager_compaction_options() -> StorageOptions {
    test_options()
        .min_active_record_share(0.5)
        .file_size_compaction_threshold(1)
}

/// A catalog in a temporary directory, removed on drop.
pub struct TestCatalog {
    catalog: Option<CatalogPersistence>,
    options: StorageOptions,
    observer: Arc<RecordingObserver>,
    temp: TempDir,
}

impl TestCatalog {
    /// Creates a warming-up catalog with [`test_options`].
    ///
    /// # Panics
    ///
    /// Panics if the catalog cannot be created.
    #[must_use]
    pub fn create() -> Self {
        Self::with_options(test_options())
    }

    /// Creates a warming-up catalog with `options`.
    ///
    /// # Panics
    ///
    /// Panics if the catalog cannot be created.
    #[must_use]
    pub fn with_options(options: StorageOptions) -> Self {
        let temp = TempDir::new().expect("temp dir");
        let observer = Arc::new(RecordingObserver::new());
        let catalog = CatalogPersistence::create(
            temp.path(),
            TEST_CATALOG,
            options.clone(),
            test_serialization(),
            Arc::clone(&observer) as Arc<dyn StorageObserver>,
        )
        .expect("create catalog");
        Self {
            catalog: Some(catalog),
            options,
            observer,
            temp,
        }
    }

    /// Wraps an existing directory, e.g. one built by
    /// [`LegacyCatalogBuilder`](crate::legacy::LegacyCatalogBuilder), and
    /// loads it.
    ///
    /// # Panics
    ///
    /// Panics if the catalog cannot be loaded.
    #[must_use]
    pub fn load_from(temp: TempDir, options: StorageOptions) -> Self {
        let observer = Arc::new(RecordingObserver::new());
        let catalog = load(temp.path(), options.clone(), Arc::clone(&observer))
            .expect("load catalog");
        Self {
            catalog: Some(catalog),
            options,
            observer,
            temp,
        }
    }

    /// The open catalog.
    ///
    /// # Panics
    ///
    /// Panics if the catalog was closed with [`close`](Self::close).
    #[must_use]
    pub fn catalog(&self) -> &CatalogPersistence {
        self.catalog.as_ref().expect("catalog is open")
    }

    /// Observer of the currently open catalog.
    #[must_use]
    pub fn observer(&self) -> &RecordingObserver {
        &self.observer
    }

    /// Directory of the catalog.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Path of a file inside the catalog directory.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    /// Closes and drops the catalog, keeping the directory.
    ///
    /// # Panics
    ///
    /// Panics if closing fails.
    pub fn close(&mut self) {
        if let Some(catalog) = self.catalog.take() {
            catalog.close().expect("close catalog");
        }
    }

    /// Drops the catalog without closing it, like a killed process.
    pub fn crash(&mut self) {
        self.catalog = None;
    }

    /// Loads the catalog from disk again.
    ///
    /// # Errors
    ///
    /// Returns the load error, leaving the fixture closed.
    pub fn try_reopen(&mut self) -> kestrel_core::CoreResult<&CatalogPersistence> {
        self.close();
        self.observer = Arc::new(RecordingObserver::new());
        let catalog = load(self.temp.path(), self.options.clone(), Arc::clone(&self.observer))?;
        let catalog = self.catalog.insert(catalog);
        Ok(&*catalog)
    }

    /// Closes the catalog and loads it from disk again.
    ///
    /// # Panics
    ///
    /// Panics if the load fails.
    #[must_use]
    pub fn reopen(mut self) -> Self {
        self.try_reopen().expect("reopen catalog");
        self
    }

    /// Names of the files in the catalog directory, sorted.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be listed.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.temp.path())
            .expect("list catalog dir")
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }
}

impl std::ops::Deref for TestCatalog {
    type Target = CatalogPersistence;

    fn deref(&self) -> &Self::Target {
        self.catalog()
    }
}

fn load(
    path: &Path,
    options: StorageOptions,
    observer: Arc<RecordingObserver>,
) -> kestrel_core::CoreResult<CatalogPersistence> {
    CatalogPersistence::load_with_migrations(
        path,
        TEST_CATALOG,
        options,
        test_serialization(),
        observer,
        &MigrationRegistry::standard(),
    )
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Name of the collection the scenarios populate.
    pub const PRODUCTS: &str = "product";

    /// A live catalog whose `product` collection holds `count` products
    /// loaded during warm-up.
    ///
    /// # Panics
    ///
    /// Panics if any step fails.
    #[must_use]
    pub fn populated_catalog(count: i64, options: StorageOptions) -> TestCatalog {
        let fixture = TestCatalog::with_options(options);
        let products = fixture
            .create_entity_collection(PRODUCTS, CatalogVersion::WARM_UP)
            .expect("create collection");
        for id in 0..count {
            products
                .parts()
                .put(CatalogVersion::WARM_UP, &Product::sample(id))
                .expect("put product");
        }
        fixture.go_live().expect("go live");
        fixture
    }
}

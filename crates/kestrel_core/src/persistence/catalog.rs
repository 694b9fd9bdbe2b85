//! The catalog persistence service.

use super::{
    CollectionFlush, EntityCollectionPersistence, PersistenceContext, StoragePartPersistence,
};
use crate::backup::{self, BackupSource, BackupSummary};
use crate::bootstrap::{BootstrapLog, BootstrapRecord};
use crate::compaction::CompactionResult;
use crate::config::StorageOptions;
use crate::dir::{legacy_entity_file_name, validate_entity_type, CatalogDir, CatalogFileKind};
use crate::error::{CoreError, CoreResult, TemporalTarget};
use crate::header::{
    CatalogHeader, CollectionFileReference, EntityCollectionHeader, StoredCatalogHeader,
    StoredCollectionHeader, WalFileReference, CURRENT_STORAGE_PROTOCOL_VERSION,
};
use crate::migration::{check_supported, CatalogImage, MigrationRegistry};
use crate::obsolete::{ObsoleteFileMaintainer, RemovalCallback};
use crate::observer::StorageObserver;
use crate::offset_index::{read_root_record, FileStatistics, RecordStore};
use crate::types::{now_millis, CatalogState, CatalogVersion, FileLocation};
use crate::versioned::{Versioned, VersionedServices};
use crate::wal::{CatalogWal, WalOptions, WalPurgeCallback, WalReplay};
use kestrel_codec::SerializationContext;
use kestrel_storage::{remove_file_if_exists, FileBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a catalog flush.
#[derive(Debug, Clone)]
pub struct CatalogFlush {
    /// The catalog header now authoritative.
    pub header: CatalogHeader,
    /// Current header of every healthy collection, keyed by entity type.
    pub collections: BTreeMap<String, EntityCollectionHeader>,
    /// Files rewritten into a new generation during the flush.
    pub compactions: Vec<CompactionResult>,
    /// The bootstrap record that committed the flush; `None` if nothing
    /// changed and no header was written.
    pub bootstrap: Option<BootstrapRecord>,
}

/// Result of [`CatalogPersistence::verify`] for one file.
#[derive(Debug, Clone)]
pub struct FileVerification {
    /// Verified file.
    pub path: PathBuf,
    /// Scan statistics when the file is intact.
    pub statistics: Option<FileStatistics>,
    /// What is wrong with the file otherwise.
    pub error: Option<String>,
}

/// Result of [`CatalogPersistence::verify`].
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// Intact records in the bootstrap log.
    pub bootstrap_records: u64,
    /// One entry per catalog and collection file.
    pub files: Vec<FileVerification>,
}

impl VerificationReport {
    /// Returns `true` if no file reported an error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.files.iter().all(|f| f.error.is_none())
    }
}

#[derive(Debug)]
enum SlotState {
    Healthy(Arc<VersionedServices<EntityCollectionPersistence>>),
    /// The file could not be opened at load; reads fail, the reference is
    /// carried over unchanged into new headers.
    Damaged {
        reference: CollectionFileReference,
        error: String,
    },
}

#[derive(Debug)]
struct CollectionSlot {
    entity_type: String,
    created_at: CatalogVersion,
    removed_at: Mutex<Option<CatalogVersion>>,
    state: SlotState,
}

impl CollectionSlot {
    fn healthy(
        entity_type: &str,
        created_at: CatalogVersion,
        service: Arc<EntityCollectionPersistence>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entity_type: entity_type.to_string(),
            created_at,
            removed_at: Mutex::new(None),
            state: SlotState::Healthy(Arc::new(VersionedServices::new(created_at, service))),
        })
    }

    fn visible_at(&self, version: CatalogVersion) -> bool {
        self.created_at <= version && self.removed_at.lock().is_none_or(|removed| version < removed)
    }

    fn service_for(&self, version: CatalogVersion) -> CoreResult<Arc<EntityCollectionPersistence>> {
        match &self.state {
            SlotState::Healthy(services) => services.service_for(version),
            SlotState::Damaged { reference, error } => Err(self.unavailable(reference, error)),
        }
    }

    fn latest(&self) -> CoreResult<Arc<EntityCollectionPersistence>> {
        match &self.state {
            SlotState::Healthy(services) => Ok(services.latest().service),
            SlotState::Damaged { reference, error } => Err(self.unavailable(reference, error)),
        }
    }

    fn unavailable(&self, reference: &CollectionFileReference, error: &str) -> CoreError {
        CoreError::corrupted(
            reference.file_name(),
            Some(reference.header_location),
            format!("collection `{}` is unavailable: {error}", self.entity_type),
        )
    }

    fn close(&self) {
        if let SlotState::Healthy(services) = &self.state {
            for entry in services.snapshot().iter() {
                entry.service.close();
            }
        }
    }
}

#[derive(Debug, Clone)]
struct DurableCatalog {
    header: CatalogHeader,
    location: FileLocation,
}

struct Retirement {
    path: PathBuf,
    on_removal: Option<RemovalCallback>,
}

impl std::fmt::Debug for Retirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retirement").field("path", &self.path).finish()
    }
}

#[derive(Debug)]
struct WriterState {
    last_collection_pk: i32,
    /// Generations superseded since the last commit; handed to the
    /// maintainer once the commit is durable.
    retirements: Vec<Retirement>,
}

struct StagedCatalog {
    catalog: Arc<StoragePartPersistence>,
    collections: BTreeMap<String, CollectionFileReference>,
    headers: BTreeMap<String, EntityCollectionHeader>,
    compactions: Vec<CompactionResult>,
    changed: bool,
}

/// Durable state of one catalog directory.
///
/// Owns the catalog file, the bootstrap log, the WAL and every entity
/// collection. All mutations are serialized by an internal writer lock;
/// readers resolve a pinned version to the file generation serving it
/// without blocking the writer.
///
/// # Example
///
/// ```rust,ignore
/// let catalog = CatalogPersistence::create(path, "products", options, ctx, observer)?;
/// let skus = catalog.create_entity_collection("sku", CatalogVersion::WARM_UP)?;
/// skus.parts().put(CatalogVersion::WARM_UP, &sku)?;
/// catalog.go_live()?;
/// ```
pub struct CatalogPersistence {
    dir: CatalogDir,
    ctx: Arc<PersistenceContext>,
    bootstrap: Mutex<BootstrapLog>,
    catalog: Arc<VersionedServices<StoragePartPersistence>>,
    live: RwLock<BTreeMap<String, Arc<CollectionSlot>>>,
    dropped: Arc<RwLock<Vec<Arc<CollectionSlot>>>>,
    durable: RwLock<DurableCatalog>,
    wal: RwLock<Option<Arc<CatalogWal>>>,
    maintainer: ObsoleteFileMaintainer,
    writer: Mutex<WriterState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CatalogPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let durable = self.durable.read();
        f.debug_struct("CatalogPersistence")
            .field("path", &self.dir.path())
            .field("catalog", &durable.header.catalog_name)
            .field("version", &durable.header.version)
            .field("state", &durable.header.state)
            .finish_non_exhaustive()
    }
}

impl CatalogPersistence {
    /// Creates a new catalog in `path` in the warm-up state.
    ///
    /// The directory is created if missing. The catalog file receives an
    /// empty header and the bootstrap log its first record.
    ///
    /// # Errors
    ///
    /// Fails if the options are invalid, the directory is locked, already
    /// holds the catalog or a stray catalog file, or a file cannot be
    /// written.
    pub fn create(
        path: &Path,
        catalog_name: &str,
        options: StorageOptions,
        serialization: Arc<SerializationContext>,
        observer: Arc<dyn StorageObserver>,
    ) -> CoreResult<Self> {
        options.validate()?;
        let dir = CatalogDir::open(path, catalog_name, true)?;
        if dir.has_bootstrap() {
            return Err(CoreError::invalid_operation(format!(
                "catalog `{catalog_name}` already exists in {}",
                path.display()
            )));
        }
        let ctx = PersistenceContext::new(options, serialization, observer);

        let catalog_path = dir.catalog_file_path(0);
        if catalog_path.exists() {
            return Err(CoreError::invalid_operation(format!(
                "{} exists without a bootstrap log; remove it to create catalog `{catalog_name}`",
                catalog_path.display()
            )));
        }
        let store = RecordStore::create(
            Box::new(FileBackend::create_new(&catalog_path)?),
            CatalogVersion::WARM_UP,
            ctx.store_options,
        )?;
        let catalog = StoragePartPersistence::new(store, catalog_path, 0, Arc::clone(&ctx));
        let header = CatalogHeader::new(catalog_name);
        let location = catalog.write_header(CatalogVersion::WARM_UP, header.encode()?)?;
        dir.sync()?;

        let first = BootstrapRecord {
            storage_protocol_version: CURRENT_STORAGE_PROTOCOL_VERSION,
            catalog_version: CatalogVersion::WARM_UP,
            catalog_file_index: 0,
            timestamp_millis: now_millis(),
            header_location: Some(location),
        };
        let bootstrap = BootstrapLog::create(&dir.bootstrap_path(), first)?;
        ctx.observer.bootstrap_appended(&first);
        let maintainer =
            ObsoleteFileMaintainer::with_worker(ctx.options.time_travel_enabled, Arc::clone(&ctx.observer))?;
        info!(catalog = catalog_name, path = %path.display(), "created catalog");

        Ok(Self::assemble(
            dir,
            ctx,
            bootstrap,
            DurableCatalog { header, location },
            Arc::new(catalog),
            Vec::new(),
            None,
            maintainer,
        ))
    }

    /// Loads an existing catalog with the standard migrations.
    ///
    /// # Errors
    ///
    /// See [`load_with_migrations`](Self::load_with_migrations).
    pub fn load(
        path: &Path,
        catalog_name: &str,
        options: StorageOptions,
        serialization: Arc<SerializationContext>,
        observer: Arc<dyn StorageObserver>,
    ) -> CoreResult<Self> {
        Self::load_with_migrations(
            path,
            catalog_name,
            options,
            serialization,
            observer,
            &MigrationRegistry::standard(),
        )
    }

    /// Loads an existing catalog.
    ///
    /// Recovery starts at the newest intact bootstrap record. Headers
    /// written with an older protocol are upgraded through `migrations`
    /// and committed with one new bootstrap record before anything else
    /// happens. A collection whose file cannot be opened does not fail the
    /// load; reads against it fail instead.
    ///
    /// # Errors
    ///
    /// - [`CoreError::CatalogIdentityMismatch`] if the directory holds a
    ///   different catalog
    /// - [`CoreError::UnsupportedProtocolVersion`] for headers newer than
    ///   this engine
    /// - [`CoreError::MigrationFailed`] if an upgrade step fails
    /// - corruption and I/O errors of the bootstrap log, the catalog file
    ///   or the WAL
    pub fn load_with_migrations(
        path: &Path,
        catalog_name: &str,
        options: StorageOptions,
        serialization: Arc<SerializationContext>,
        observer: Arc<dyn StorageObserver>,
        migrations: &MigrationRegistry,
    ) -> CoreResult<Self> {
        options.validate()?;
        let dir = CatalogDir::open(path, catalog_name, false)?;
        if !dir.has_bootstrap() {
            return Err(CoreError::invalid_format(format!(
                "no bootstrap log for catalog `{catalog_name}` in {}",
                path.display()
            )));
        }
        let mut bootstrap = BootstrapLog::open(&dir.bootstrap_path())?;
        let last = bootstrap.last_record();
        check_supported(last.storage_protocol_version)?;
        let location = last.header_location.ok_or_else(|| {
            CoreError::corrupted(
                bootstrap.path().display().to_string(),
                None,
                "newest bootstrap record points at no header",
            )
        })?;

        let catalog_path = dir.catalog_file_path(last.catalog_file_index);
        let backend = FileBackend::open_existing(&catalog_path)?;
        let stored = StoredCatalogHeader::decode(&read_root_record(
            &backend,
            location,
            options.compute_crc32c,
        )?)?;
        if stored.catalog_name() != catalog_name {
            return Err(CoreError::CatalogIdentityMismatch {
                expected: catalog_name.to_string(),
                found: stored.catalog_name().to_string(),
            });
        }
        check_supported(stored.protocol_version())?;

        let ctx = PersistenceContext::new(options, serialization, observer);
        let (durable, catalog, collections) =
            if stored.protocol_version() < CURRENT_STORAGE_PROTOCOL_VERSION {
                upgrade(&dir, &ctx, &mut bootstrap, migrations, stored, backend, location)?
            } else {
                let header = stored.into_current()?;
                let store = RecordStore::open(
                    Box::new(backend),
                    header.descriptor.clone(),
                    location.end(),
                    ctx.store_options,
                )?;
                let catalog = StoragePartPersistence::new(
                    store,
                    catalog_path,
                    header.catalog_file_index,
                    Arc::clone(&ctx),
                );
                let collections = open_collections(&dir, &ctx, &header);
                (DurableCatalog { header, location }, catalog, collections)
            };

        let wal = match (&durable.header.wal, durable.header.state) {
            (None, CatalogState::WarmingUp) => None,
            (reference, _) => {
                let wal = CatalogWal::open(
                    dir.path(),
                    catalog_name,
                    WalOptions::from(&ctx.options),
                    Arc::clone(&ctx.observer),
                )?;
                if let Some(reference) = reference {
                    wal.validate_reference(reference)?;
                }
                Some(Arc::new(wal))
            }
        };

        let maintainer =
            ObsoleteFileMaintainer::with_worker(ctx.options.time_travel_enabled, Arc::clone(&ctx.observer))?;
        info!(
            catalog = catalog_name,
            version = %durable.header.version,
            state = %durable.header.state,
            collections = durable.header.collections.len(),
            "loaded catalog"
        );
        let persistence = Self::assemble(
            dir,
            ctx,
            bootstrap,
            durable,
            Arc::new(catalog),
            collections,
            wal,
            maintainer,
        );
        persistence.sweep_unreferenced_files()?;
        Ok(persistence)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        dir: CatalogDir,
        ctx: Arc<PersistenceContext>,
        bootstrap: BootstrapLog,
        durable: DurableCatalog,
        catalog: Arc<StoragePartPersistence>,
        collections: Vec<Arc<CollectionSlot>>,
        wal: Option<Arc<CatalogWal>>,
        maintainer: ObsoleteFileMaintainer,
    ) -> Self {
        let version = durable.header.version;
        let last_collection_pk = durable.header.last_entity_collection_primary_key;
        let live = collections
            .into_iter()
            .map(|slot| (slot.entity_type.clone(), slot))
            .collect();
        Self {
            dir,
            ctx,
            bootstrap: Mutex::new(bootstrap),
            catalog: Arc::new(VersionedServices::new(version, catalog)),
            live: RwLock::new(live),
            dropped: Arc::new(RwLock::new(Vec::new())),
            durable: RwLock::new(durable),
            wal: RwLock::new(wal),
            maintainer,
            writer: Mutex::new(WriterState {
                last_collection_pk,
                retirements: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Catalog name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.dir.catalog_name()
    }

    /// Catalog directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Options the catalog was opened with.
    #[must_use]
    pub fn options(&self) -> &StorageOptions {
        &self.ctx.options
    }

    /// The serialization context shared by every service.
    #[must_use]
    pub fn serialization(&self) -> &Arc<SerializationContext> {
        &self.ctx.serialization
    }

    /// The newest durable header.
    #[must_use]
    pub fn header(&self) -> CatalogHeader {
        self.durable.read().header.clone()
    }

    /// Version of the newest durable header.
    #[must_use]
    pub fn version(&self) -> CatalogVersion {
        self.durable.read().header.version
    }

    /// Lifecycle state of the newest durable header.
    #[must_use]
    pub fn state(&self) -> CatalogState {
        self.durable.read().header.state
    }

    /// The maintainer that reclaims superseded files.
    #[must_use]
    pub fn maintainer(&self) -> &ObsoleteFileMaintainer {
        &self.maintainer
    }

    /// The WAL; `None` while warming up.
    #[must_use]
    pub fn wal(&self) -> Option<Arc<CatalogWal>> {
        self.wal.read().clone()
    }

    /// Every retained bootstrap record, oldest first.
    ///
    /// # Errors
    ///
    /// Fails if a record is damaged.
    pub fn bootstrap_records(&self) -> CoreResult<Vec<BootstrapRecord>> {
        self.bootstrap.lock().records()
    }

    /// The catalog file generation serving `version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] for versions older than
    /// every registered generation.
    pub fn service_for(&self, version: CatalogVersion) -> CoreResult<Arc<StoragePartPersistence>> {
        self.ensure_open()?;
        self.catalog.service_for(version)
    }

    /// The collection generation serving `entity_type` at `version`.
    ///
    /// A collection renamed or deleted at a later version is still served
    /// under its old name to readers pinned before the change.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if no collection of that
    /// type exists at `version`, or a corruption error if its file could
    /// not be opened.
    pub fn collection_service_for(
        &self,
        entity_type: &str,
        version: CatalogVersion,
    ) -> CoreResult<Arc<EntityCollectionPersistence>> {
        self.ensure_open()?;
        if let Some(slot) = self.live.read().get(entity_type) {
            if slot.visible_at(version) {
                return slot.service_for(version);
            }
        }
        let dropped = self.dropped.read();
        let slot = dropped
            .iter()
            .rev()
            .find(|slot| slot.entity_type == entity_type && slot.visible_at(version));
        match slot {
            Some(slot) => slot.service_for(version),
            None => Err(CoreError::CollectionNotFound {
                entity_type: entity_type.to_string(),
            }),
        }
    }

    /// Entity types visible at `version`, sorted.
    #[must_use]
    pub fn entity_types(&self, version: CatalogVersion) -> Vec<String> {
        let mut names: Vec<String> = self
            .live
            .read()
            .values()
            .chain(self.dropped.read().iter())
            .filter(|slot| slot.visible_at(version))
            .map(|slot| slot.entity_type.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Creates an empty collection visible from `version` on.
    ///
    /// The collection becomes durable with the next flush.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or taken, `version` precedes the
    /// durable version, or the file cannot be created.
    pub fn create_entity_collection(
        &self,
        entity_type: &str,
        version: CatalogVersion,
    ) -> CoreResult<Arc<EntityCollectionPersistence>> {
        self.ensure_open()?;
        validate_entity_type(entity_type)?;
        let mut writer = self.writer.lock();
        self.ensure_writable_version(version)?;
        if self.live.read().contains_key(entity_type) {
            return Err(CoreError::invalid_operation(format!(
                "entity collection `{entity_type}` already exists"
            )));
        }
        let primary_key = writer.last_collection_pk + 1;
        let service = Arc::new(EntityCollectionPersistence::create(
            &self.dir,
            &self.ctx,
            entity_type,
            primary_key,
            0,
            version,
        )?);
        writer.last_collection_pk = primary_key;
        self.live.write().insert(
            entity_type.to_string(),
            CollectionSlot::healthy(entity_type, version, Arc::clone(&service)),
        );
        info!(catalog = %self.name(), entity_type, primary_key, version = %version, "created entity collection");
        Ok(service)
    }

    /// Removes a collection from `version` on.
    ///
    /// Readers pinned before `version` keep reading it. Its files are
    /// retired once the removal is committed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if there is no such
    /// collection.
    pub fn delete_entity_collection(
        &self,
        entity_type: &str,
        version: CatalogVersion,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        self.ensure_writable_version(version)?;
        let slot = self.live.write().remove(entity_type).ok_or_else(|| {
            CoreError::CollectionNotFound {
                entity_type: entity_type.to_string(),
            }
        })?;
        *slot.removed_at.lock() = Some(version);
        self.dropped.write().push(Arc::clone(&slot));
        writer.retirements.push(self.slot_retirement(&slot));
        info!(catalog = %self.name(), entity_type, version = %version, "deleted entity collection");
        Ok(())
    }

    /// Moves a collection to a new name from `version` on.
    ///
    /// The live records are copied into the next file generation under
    /// the new name; the entity type id is kept.
    ///
    /// # Errors
    ///
    /// Fails if the old collection does not exist or is damaged, the new
    /// name is invalid or taken, or the copy fails.
    pub fn rename_entity_collection(
        &self,
        entity_type: &str,
        new_entity_type: &str,
        version: CatalogVersion,
    ) -> CoreResult<Arc<EntityCollectionPersistence>> {
        self.ensure_open()?;
        validate_entity_type(new_entity_type)?;
        let mut writer = self.writer.lock();
        self.ensure_writable_version(version)?;
        let slot = {
            let live = self.live.read();
            if live.contains_key(new_entity_type) {
                return Err(CoreError::invalid_operation(format!(
                    "entity collection `{new_entity_type}` already exists"
                )));
            }
            Arc::clone(live.get(entity_type).ok_or_else(|| CoreError::CollectionNotFound {
                entity_type: entity_type.to_string(),
            })?)
        };
        let current = slot.latest()?;

        current.parts().flush(version)?;
        let renamed = Arc::new(current.rename(&self.dir, new_entity_type, version)?);

        let mut live = self.live.write();
        live.remove(entity_type);
        *slot.removed_at.lock() = Some(version);
        self.dropped.write().push(Arc::clone(&slot));
        writer.retirements.push(self.slot_retirement(&slot));
        live.insert(
            new_entity_type.to_string(),
            CollectionSlot::healthy(new_entity_type, version, Arc::clone(&renamed)),
        );
        Ok(renamed)
    }

    /// Flushes every store at `version` and commits a new header if any
    /// durable state changed.
    ///
    /// `collection_headers` carries the counters maintained above this
    /// layer; collections not mentioned keep their counters. Files whose
    /// live share dropped below the configured minimum are compacted into
    /// a new generation. Without changes nothing is written.
    ///
    /// # Errors
    ///
    /// Fails if `version` precedes the durable version or any write fails.
    /// Nothing becomes durable before the bootstrap record is appended.
    pub fn flush(
        &self,
        version: CatalogVersion,
        collection_headers: &[EntityCollectionHeader],
    ) -> CoreResult<CatalogFlush> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        let state = self.state();
        let staged = self.flush_stores(&mut writer, version, collection_headers)?;
        self.commit(&mut writer, state, version, staged, false)
    }

    /// Writes a header in `state` for `version` and commits it, even if
    /// nothing changed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for a transition back to
    /// warm-up, or any write error.
    pub fn store_header(
        &self,
        state: CatalogState,
        version: CatalogVersion,
        collection_headers: &[EntityCollectionHeader],
    ) -> CoreResult<CatalogFlush> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        if self.state() == CatalogState::Alive && state == CatalogState::WarmingUp {
            return Err(CoreError::invalid_operation(
                "a live catalog cannot return to warm-up",
            ));
        }
        if state == CatalogState::Alive && self.wal.read().is_none() {
            return Err(CoreError::invalid_operation(
                "use go_live to make a catalog alive",
            ));
        }
        let staged = self.flush_stores(&mut writer, version, collection_headers)?;
        self.commit(&mut writer, state, version, staged, true)
    }

    /// Spills staged payloads of every store to disk. Returns the bytes
    /// written.
    ///
    /// # Errors
    ///
    /// Fails if an append fails.
    pub fn flush_trapped(&self) -> CoreResult<u64> {
        self.ensure_open()?;
        let _writer = self.writer.lock();
        let mut written = self.catalog.latest().service.flush_trapped()?;
        for slot in self.live.read().values() {
            if let SlotState::Healthy(services) = &slot.state {
                written += services.latest().service.parts().flush_trapped()?;
            }
        }
        Ok(written)
    }

    /// Leaves warm-up: flushes everything at the warm-up version, creates
    /// the WAL and commits an alive header with exactly one bootstrap
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the catalog is already
    /// alive, or any write error.
    pub fn go_live(&self) -> CoreResult<CatalogHeader> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        let durable = self.header();
        if durable.state == CatalogState::Alive {
            return Err(CoreError::invalid_operation(format!(
                "catalog `{}` is already alive",
                durable.catalog_name
            )));
        }
        let wal = CatalogWal::open(
            self.dir.path(),
            self.name(),
            WalOptions::from(&self.ctx.options),
            Arc::clone(&self.ctx.observer),
        )?;
        *self.wal.write() = Some(Arc::new(wal));
        let staged = self.flush_stores(&mut writer, durable.version, &[])?;
        let flush = self.commit(&mut writer, CatalogState::Alive, durable.version, staged, true)?;
        info!(catalog = %self.name(), version = %durable.version, "catalog is alive");
        Ok(flush.header)
    }

    /// Appends one transaction to the WAL.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] while warming up, or
    /// [`CoreError::InvariantViolation`] if `version` is not newer than the
    /// durable version.
    pub fn append_transaction(
        &self,
        version: CatalogVersion,
        mutations: Vec<u8>,
    ) -> CoreResult<WalFileReference> {
        self.ensure_open()?;
        let wal = self
            .wal()
            .ok_or_else(|| CoreError::invalid_operation("catalog has no WAL while warming up"))?;
        let durable = self.version();
        if version <= durable {
            return Err(CoreError::invariant(format!(
                "transaction {version} is not newer than durable {durable}"
            )));
        }
        wal.append(version, mutations)
    }

    /// Transactions in the WAL newer than the durable header, oldest first.
    ///
    /// # Errors
    ///
    /// Fails if the WAL directory cannot be read.
    pub fn committed_transactions(&self) -> CoreResult<WalReplay> {
        let version = self.version();
        match self.wal() {
            Some(wal) => wal.committed_from(version),
            None => Ok(WalReplay::new(version, Vec::new(), true)),
        }
    }

    /// Appends the bootstrap record that commits a header.
    ///
    /// This is the only place a bootstrap record is written; every file
    /// the header depends on must already be durable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] if `version` goes
    /// backwards, or an I/O error.
    pub fn record_bootstrap(
        &self,
        version: CatalogVersion,
        catalog_file_index: u32,
        header_location: FileLocation,
    ) -> CoreResult<BootstrapRecord> {
        let record = BootstrapRecord {
            storage_protocol_version: CURRENT_STORAGE_PROTOCOL_VERSION,
            catalog_version: version,
            catalog_file_index,
            timestamp_millis: now_millis(),
            header_location: Some(header_location),
        };
        self.bootstrap.lock().append(record)?;
        self.ctx.observer.bootstrap_appended(&record);
        Ok(record)
    }

    /// The catalog header authoritative at `version`.
    ///
    /// Older versions are read from the catalog file generation the
    /// bootstrap log points at.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TemporalDataNotAvailable`] if the bootstrap log
    /// or the file no longer covers `version`.
    pub fn catalog_header(&self, version: CatalogVersion) -> CoreResult<CatalogHeader> {
        {
            let durable = self.durable.read();
            if version >= durable.header.version {
                return Ok(durable.header.clone());
            }
        }
        let record = self.bootstrap.lock().version_at(version)?;
        self.read_catalog_header(&record, TemporalTarget::Version(version))
    }

    /// The header of `entity_type` authoritative at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if the collection did not
    /// exist at `version`, or the errors of
    /// [`catalog_header`](Self::catalog_header).
    pub fn collection_header(
        &self,
        entity_type: &str,
        version: CatalogVersion,
    ) -> CoreResult<EntityCollectionHeader> {
        let header = self.catalog_header(version)?;
        let reference = header.collections.get(entity_type).ok_or_else(|| {
            CoreError::CollectionNotFound {
                entity_type: entity_type.to_string(),
            }
        })?;
        let path = self.dir.file_path(&reference.file_name());
        if !path.exists() {
            return Err(CoreError::TemporalDataNotAvailable {
                requested: TemporalTarget::Version(version),
            });
        }
        let backend = FileBackend::open_read_only(&path)?;
        let bytes = read_root_record(
            &backend,
            reference.header_location,
            self.ctx.options.compute_crc32c,
        )?;
        StoredCollectionHeader::decode(&bytes)?.into_current()
    }

    /// The newest catalog version committed at or before `moment_millis`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TemporalDataNotAvailable`] if the moment
    /// precedes every retained bootstrap record.
    pub fn version_at(&self, moment_millis: i64) -> CoreResult<CatalogVersion> {
        Ok(self
            .bootstrap
            .lock()
            .version_at_moment(moment_millis)?
            .catalog_version)
    }

    /// Drops bootstrap history older than `min_version`, purges WAL
    /// segments no retained header replays from and lets the maintainer
    /// reclaim generations only that history referenced.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TemporalDataNotAvailable`] if no record anchors
    /// `min_version`, or an I/O error.
    pub fn trim_bootstrap(&self, min_version: CatalogVersion) -> CoreResult<BootstrapRecord> {
        self.ensure_open()?;
        let _writer = self.writer.lock();
        let first = self.bootstrap.lock().trim(min_version)?;
        if let Some(wal) = self.wal() {
            let purged = wal.purge_up_to(first.catalog_version)?;
            debug!(purged, "purged WAL segments after bootstrap trim");
        }
        self.maintainer.bootstrap_trimmed(first.catalog_version);
        self.ctx.observer.bootstrap_trimmed(&first);
        Ok(first)
    }

    /// Reports that no reader below `min_version` remains.
    ///
    /// Advances the maintainer and drops in-memory history no reader can
    /// reach any more.
    ///
    /// # Errors
    ///
    /// Fails if the bootstrap log cannot be read.
    pub fn consumers_left(&self, min_version: CatalogVersion) -> CoreResult<()> {
        self.maintainer.consumers_left(min_version);
        let horizon = if self.ctx.options.time_travel_enabled {
            let first = self.bootstrap.lock().record_at(0)?.catalog_version;
            min_version.min(first)
        } else {
            min_version
        };
        for entry in self.catalog.snapshot().iter() {
            entry.service.store().purge(horizon);
        }
        for slot in self.live.read().values() {
            if let SlotState::Healthy(services) = &slot.state {
                for entry in services.snapshot().iter() {
                    entry.service.parts().store().purge(horizon);
                }
            }
        }
        Ok(())
    }

    /// Runs a synchronous purge of reclaimable files. Returns how many
    /// were removed.
    pub fn purge_obsolete_files(&self) -> usize {
        self.maintainer.purge_obsolete_files()
    }

    /// Copies the catalog as of its durable version into `target`.
    ///
    /// See [`crate::backup`].
    ///
    /// # Errors
    ///
    /// Fails if `target` already holds the catalog, a collection is
    /// damaged, or any read or write fails.
    pub fn backup_to(&self, target: &Path) -> CoreResult<BackupSummary> {
        self.ensure_open()?;
        let _writer = self.writer.lock();
        let header = self.header();
        let catalog = self.catalog.service_for(header.version)?;
        let mut collections = Vec::with_capacity(header.collections.len());
        for entity_type in header.collections.keys() {
            collections.push(self.collection_service_for(entity_type, header.version)?);
        }
        backup::write_backup(
            &BackupSource {
                header,
                catalog,
                collections,
                options: &self.ctx.options,
            },
            target,
        )
    }

    /// Checksum scan of the bootstrap log and every current file.
    ///
    /// Damaged files are reported, not raised.
    ///
    /// # Errors
    ///
    /// Fails only if the bootstrap log itself is damaged.
    pub fn verify(&self) -> CoreResult<VerificationReport> {
        self.ensure_open()?;
        let mut report = VerificationReport {
            bootstrap_records: self.bootstrap.lock().records()?.len() as u64,
            files: Vec::new(),
        };
        let catalog = self.catalog.latest().service;
        report.files.push(verify_file(catalog.path(), catalog.verify()));
        for slot in self.live.read().values() {
            match &slot.state {
                SlotState::Healthy(services) => {
                    let service = services.latest().service;
                    report
                        .files
                        .push(verify_file(service.path(), service.parts().verify()));
                }
                SlotState::Damaged { reference, error } => report.files.push(FileVerification {
                    path: self.dir.file_path(&reference.file_name()),
                    statistics: None,
                    error: Some(error.clone()),
                }),
            }
        }
        Ok(report)
    }

    /// Closes the catalog. Uncommitted changes are discarded.
    ///
    /// # Errors
    ///
    /// Fails if the WAL cannot be synced.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _writer = self.writer.lock();
        if let Some(wal) = self.wal() {
            wal.sync()?;
        }
        self.maintainer.shutdown();
        for entry in self.catalog.snapshot().iter() {
            entry.service.close();
        }
        for slot in self.live.read().values() {
            slot.close();
        }
        for slot in self.dropped.read().iter() {
            slot.close();
        }
        info!(catalog = %self.name(), version = %self.version(), "closed catalog");
        Ok(())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable_version(&self, version: CatalogVersion) -> CoreResult<()> {
        let durable = self.version();
        if version < durable {
            return Err(CoreError::invariant(format!(
                "write at {version} precedes durable {durable}"
            )));
        }
        Ok(())
    }

    fn flush_stores(
        &self,
        writer: &mut WriterState,
        version: CatalogVersion,
        updates: &[EntityCollectionHeader],
    ) -> CoreResult<StagedCatalog> {
        self.ensure_writable_version(version)?;
        let policy = *self.ctx.compactor.policy();
        let mut collections = BTreeMap::new();
        let mut headers = BTreeMap::new();
        let mut compactions = Vec::new();
        let mut changed = false;

        let slots: Vec<Arc<CollectionSlot>> = self.live.read().values().cloned().collect();
        for slot in slots {
            let services = match &slot.state {
                SlotState::Healthy(services) => services,
                SlotState::Damaged { reference, .. } => {
                    collections.insert(slot.entity_type.clone(), reference.clone());
                    continue;
                }
            };
            let current = services.latest();
            let template = updates.iter().find(|h| h.entity_type == slot.entity_type);
            let mut flushed = current.service.flush(version, template)?;
            if policy.should_compact(&flushed.header.descriptor) {
                let (next, result) = current.service.compact(&self.dir, version)?;
                let reference = next
                    .reference()
                    .ok_or_else(|| CoreError::invariant("compacted generation has no header"))?;
                flushed = CollectionFlush {
                    header: next.header(),
                    reference,
                    changed: true,
                };
                let path = current.service.path().to_path_buf();
                publish(writer, services, &current, path, version, Arc::new(next), |s| s.close())?;
                compactions.push(result);
            }
            changed |= flushed.changed;
            collections.insert(slot.entity_type.clone(), flushed.reference);
            headers.insert(slot.entity_type.clone(), flushed.header);
        }

        let current = self.catalog.latest();
        let descriptor = current.service.flush(version)?;
        let catalog = if policy.should_compact(&descriptor) {
            let (next, result) = self.compact_catalog(&current.service, version)?;
            let next = Arc::new(next);
            let path = current.service.path().to_path_buf();
            publish(writer, &self.catalog, &current, path, version, Arc::clone(&next), |s| s.close())?;
            compactions.push(result);
            changed = true;
            next
        } else {
            current.service
        };

        let durable = self.durable.read();
        changed |= catalog.descriptor() != durable.header.descriptor
            || collections != durable.header.collections;
        Ok(StagedCatalog {
            catalog,
            collections,
            headers,
            compactions,
            changed,
        })
    }

    fn compact_catalog(
        &self,
        current: &StoragePartPersistence,
        version: CatalogVersion,
    ) -> CoreResult<(StoragePartPersistence, CompactionResult)> {
        let file_index = current.file_index() + 1;
        let path = self.dir.catalog_file_path(file_index);
        let mut backend = FileBackend::create_new(&path)?;
        let (descriptor, result) =
            self.ctx
                .compactor
                .compact(current.store(), version, &mut backend)?;
        let end = backend.len();
        let store = RecordStore::open(Box::new(backend), descriptor, end, self.ctx.store_options)?;
        self.ctx.observer.compaction_finished(&result);
        Ok((
            StoragePartPersistence::new(store, path, file_index, Arc::clone(&self.ctx)),
            result,
        ))
    }

    fn commit(
        &self,
        writer: &mut WriterState,
        state: CatalogState,
        version: CatalogVersion,
        staged: StagedCatalog,
        force: bool,
    ) -> CoreResult<CatalogFlush> {
        let wal = self.wal().map(|wal| wal.reference());
        let durable = self.durable.read().clone();
        let changed = force
            || staged.changed
            || state != durable.header.state
            || wal != durable.header.wal;
        if !changed {
            return Ok(CatalogFlush {
                header: durable.header,
                collections: staged.headers,
                compactions: staged.compactions,
                bootstrap: None,
            });
        }

        let descriptor = staged.catalog.descriptor();
        let header = CatalogHeader {
            storage_protocol_version: CURRENT_STORAGE_PROTOCOL_VERSION,
            catalog_id: durable.header.catalog_id,
            catalog_name: durable.header.catalog_name.clone(),
            state,
            version,
            catalog_file_index: staged.catalog.file_index(),
            wal,
            collections: staged.collections,
            last_entity_collection_primary_key: writer.last_collection_pk,
            active_record_share: descriptor.active_record_share(),
            descriptor,
        };
        let location = staged.catalog.write_header(version, header.encode()?)?;
        if self.ctx.options.sync_writes {
            self.dir.sync()?;
        }
        let record = self.record_bootstrap(version, header.catalog_file_index, location)?;
        *self.durable.write() = DurableCatalog {
            header: header.clone(),
            location,
        };
        self.release_retired(writer, version);
        debug!(
            catalog = %header.catalog_name,
            version = %version,
            state = %state,
            file_index = header.catalog_file_index,
            "committed catalog header"
        );
        Ok(CatalogFlush {
            header,
            collections: staged.headers,
            compactions: staged.compactions,
            bootstrap: Some(record),
        })
    }

    /// Hands the generations superseded by the committed version to the
    /// maintainer. Warm-up generations have no historical readers.
    fn release_retired(&self, writer: &mut WriterState, version: CatalogVersion) {
        for retirement in writer.retirements.drain(..) {
            if version == CatalogVersion::WARM_UP {
                if let Err(err) = self
                    .maintainer
                    .remove_immediately(&retirement.path, retirement.on_removal)
                {
                    warn!(path = %retirement.path.display(), error = %err, "failed to remove warm-up file");
                }
            } else {
                self.maintainer
                    .retire(version, retirement.path, retirement.on_removal);
            }
        }
    }

    fn slot_retirement(&self, slot: &Arc<CollectionSlot>) -> Retirement {
        let path = match &slot.state {
            SlotState::Healthy(services) => services.latest().service.path().to_path_buf(),
            SlotState::Damaged { reference, .. } => self.dir.file_path(&reference.file_name()),
        };
        let dropped = Arc::clone(&self.dropped);
        let slot = Arc::clone(slot);
        Retirement {
            path,
            on_removal: Some(Box::new(move || {
                dropped.write().retain(|other| !Arc::ptr_eq(other, &slot));
                slot.close();
            })),
        }
    }

    fn read_catalog_header(
        &self,
        record: &BootstrapRecord,
        requested: TemporalTarget,
    ) -> CoreResult<CatalogHeader> {
        let location = record
            .header_location
            .ok_or(CoreError::TemporalDataNotAvailable { requested })?;
        let path = self.dir.catalog_file_path(record.catalog_file_index);
        if !path.exists() {
            return Err(CoreError::TemporalDataNotAvailable { requested });
        }
        let backend = FileBackend::open_read_only(&path)?;
        StoredCatalogHeader::decode(&read_root_record(
            &backend,
            location,
            self.ctx.options.compute_crc32c,
        )?)?
        .into_current()
    }

    /// Removes files a crash left behind and retires generations only
    /// older history references.
    fn sweep_unreferenced_files(&self) -> CoreResult<()> {
        let header = self.header();
        let referenced: HashSet<PathBuf> = header
            .collections
            .values()
            .map(|reference| self.dir.file_path(&reference.file_name()))
            .collect();
        for (kind, path) in self.dir.list_files()? {
            let leftover = match &kind {
                CatalogFileKind::Catalog { file_index } => {
                    if *file_index == header.catalog_file_index {
                        continue;
                    }
                    *file_index > header.catalog_file_index
                }
                CatalogFileKind::Entity(name) => {
                    if referenced.contains(&path) {
                        continue;
                    }
                    name.entity_type_primary_key > header.last_entity_collection_primary_key
                        || header.collections.values().any(|reference| {
                            reference.entity_type_primary_key == name.entity_type_primary_key
                                && name.file_index > reference.file_index
                        })
                }
                CatalogFileKind::Bootstrap | CatalogFileKind::Wal { .. } => continue,
            };
            if leftover || !self.maintainer.is_time_travel() {
                info!(path = %path.display(), "removing unreferenced file");
                remove_file_if_exists(&path)?;
            } else {
                self.maintainer.retire(header.version, path, None);
            }
        }
        Ok(())
    }
}

/// Registers `next` as the generation serving `version` and queues the
/// generation it supersedes.
fn publish<T: Send + Sync + 'static>(
    writer: &mut WriterState,
    services: &Arc<VersionedServices<T>>,
    current: &Versioned<T>,
    path: PathBuf,
    version: CatalogVersion,
    next: Arc<T>,
    close: fn(&T),
) -> CoreResult<()> {
    let on_removal: RemovalCallback = if current.version == version {
        let replaced = services.replace_latest(version, next)?;
        Box::new(move || close(&replaced))
    } else {
        services.register(version, next)?;
        let services = Arc::clone(services);
        let retired = current.version;
        Box::new(move || {
            if let Some(old) = services.retire_generation(retired) {
                close(&old.service);
            }
        })
    };
    writer.retirements.push(Retirement {
        path,
        on_removal: Some(on_removal),
    });
    Ok(())
}

fn verify_file(path: &Path, result: CoreResult<FileStatistics>) -> FileVerification {
    match result {
        Ok(statistics) => FileVerification {
            path: path.to_path_buf(),
            statistics: Some(statistics),
            error: None,
        },
        Err(err) => FileVerification {
            path: path.to_path_buf(),
            statistics: None,
            error: Some(err.to_string()),
        },
    }
}

fn open_collections(
    dir: &CatalogDir,
    ctx: &Arc<PersistenceContext>,
    header: &CatalogHeader,
) -> Vec<Arc<CollectionSlot>> {
    header
        .collections
        .values()
        .map(|reference| match EntityCollectionPersistence::open(dir, ctx, reference) {
            Ok(service) => {
                CollectionSlot::healthy(&reference.entity_type, header.version, Arc::new(service))
            }
            Err(err) => {
                warn!(
                    entity_type = %reference.entity_type,
                    file = %reference.file_name(),
                    error = %err,
                    "entity collection is unavailable"
                );
                Arc::new(CollectionSlot {
                    entity_type: reference.entity_type.clone(),
                    created_at: header.version,
                    removed_at: Mutex::new(None),
                    state: SlotState::Damaged {
                        reference: reference.clone(),
                        error: err.to_string(),
                    },
                })
            }
        })
        .collect()
}

/// Upgrades headers of an older protocol and commits the result.
///
/// Every collection is copied into a file named after the current scheme,
/// the upgraded catalog header is appended to the catalog file and one
/// bootstrap record commits both. Legacy files are removed afterwards.
/// A crash before the bootstrap append leaves the old catalog intact.
fn upgrade(
    dir: &CatalogDir,
    ctx: &Arc<PersistenceContext>,
    bootstrap: &mut BootstrapLog,
    migrations: &MigrationRegistry,
    stored: StoredCatalogHeader,
    catalog_backend: FileBackend,
    location: FileLocation,
) -> CoreResult<(DurableCatalog, StoragePartPersistence, Vec<Arc<CollectionSlot>>)> {
    let legacy_refs: Vec<(String, u32, FileLocation)> = match &stored {
        StoredCatalogHeader::V1(v1) => v1
            .collections
            .values()
            .map(|r| (r.entity_type.clone(), r.file_index, r.header_location))
            .collect(),
        StoredCatalogHeader::V2(_) => {
            return Err(CoreError::invariant("current header passed to upgrade"))
        }
    };

    let mut stored_collections = BTreeMap::new();
    let mut legacy = Vec::with_capacity(legacy_refs.len());
    for (entity_type, file_index, header_location) in legacy_refs {
        let path = dir.file_path(&legacy_entity_file_name(&entity_type, file_index));
        let backend = FileBackend::open_read_only(&path)?;
        let bytes = read_root_record(&backend, header_location, ctx.options.compute_crc32c)?;
        stored_collections.insert(entity_type.clone(), StoredCollectionHeader::decode(&bytes)?);
        legacy.push((entity_type, path, backend));
    }

    let outcome = migrations.upgrade(CatalogImage {
        catalog: stored,
        collections: stored_collections,
    })?;
    let from = outcome.stored_version;
    let (mut header, collection_headers) = outcome.image.into_current()?;
    let version = header.version;

    let mut services = Vec::with_capacity(legacy.len());
    let mut legacy_paths = Vec::with_capacity(legacy.len());
    for (entity_type, legacy_path, backend) in legacy {
        let mut collection = collection_headers.get(&entity_type).cloned().ok_or_else(|| {
            CoreError::migration_failed(format!("migration dropped collection `{entity_type}`"))
        })?;
        let source = RecordStore::open_read_only(
            Box::new(backend),
            collection.descriptor.clone(),
            ctx.store_options,
        )?;
        let target_path = dir.entity_file_path(
            &entity_type,
            collection.entity_type_primary_key,
            collection.file_index,
        );
        remove_file_if_exists(&target_path)?;
        let mut target = FileBackend::create_new(&target_path)?;
        let descriptor = source.copy_snapshot_to(&mut target, version)?;
        let end = target.len();
        let store = RecordStore::open(Box::new(target), descriptor.clone(), end, ctx.store_options)?;

        collection.record_count = descriptor.living_record_count;
        collection.active_record_share = descriptor.active_record_share();
        collection.descriptor = descriptor;
        let header_location = store.write_root(version, collection.encode()?)?;
        ctx.observer
            .header_written(&target_path.display().to_string(), version, header_location);
        drop(store);

        let reference = CollectionFileReference {
            entity_type: entity_type.clone(),
            entity_type_primary_key: collection.entity_type_primary_key,
            file_index: collection.file_index,
            header_location,
        };
        let service = EntityCollectionPersistence::open(dir, ctx, &reference)?;
        header.collections.insert(entity_type.clone(), reference);
        services.push(CollectionSlot::healthy(&entity_type, version, Arc::new(service)));
        legacy_paths.push(legacy_path);
    }

    let catalog_path = dir.catalog_file_path(header.catalog_file_index);
    let store = RecordStore::open(
        Box::new(catalog_backend),
        header.descriptor.clone(),
        location.end(),
        ctx.store_options,
    )?;
    let catalog = StoragePartPersistence::new(
        store,
        catalog_path,
        header.catalog_file_index,
        Arc::clone(ctx),
    );
    header.storage_protocol_version = CURRENT_STORAGE_PROTOCOL_VERSION;
    let header_location = catalog.write_header(version, header.encode()?)?;
    dir.sync()?;

    let record = BootstrapRecord {
        storage_protocol_version: CURRENT_STORAGE_PROTOCOL_VERSION,
        catalog_version: version,
        catalog_file_index: header.catalog_file_index,
        timestamp_millis: now_millis(),
        header_location: Some(header_location),
    };
    bootstrap.append(record)?;
    ctx.observer.bootstrap_appended(&record);
    info!(
        catalog = %header.catalog_name,
        from,
        to = CURRENT_STORAGE_PROTOCOL_VERSION,
        collections = services.len(),
        "upgraded catalog"
    );

    for path in legacy_paths {
        if let Err(err) = remove_file_if_exists(&path) {
            warn!(path = %path.display(), error = %err, "failed to remove legacy collection file");
        }
    }
    Ok((
        DurableCatalog {
            header,
            location: header_location,
        },
        catalog,
        services,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use kestrel_codec::StoragePart;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: i64,
        name: String,
    }

    impl StoragePart for Item {
        const RECORD_TYPE: &'static str = "item";
        fn storage_part_pk(&self) -> Option<i64> {
            Some(self.id)
        }
    }

    fn v(n: u64) -> CatalogVersion {
        CatalogVersion::new(n)
    }

    fn item(id: i64) -> Item {
        Item {
            id,
            name: format!("item-{id}"),
        }
    }

    fn serialization() -> Arc<SerializationContext> {
        SerializationContext::builder()
            .register::<Item>()
            .unwrap()
            .build()
            .shared()
    }

    fn options() -> StorageOptions {
        StorageOptions::default().sync_writes(false)
    }

    fn create(path: &Path) -> CatalogPersistence {
        CatalogPersistence::create(path, "shop", options(), serialization(), Arc::new(NoopObserver))
            .unwrap()
    }

    fn load(path: &Path, options: StorageOptions) -> CoreResult<CatalogPersistence> {
        CatalogPersistence::load(path, "shop", options, serialization(), Arc::new(NoopObserver))
    }

    #[test]
    fn create_writes_first_bootstrap_record() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        assert_eq!(catalog.state(), CatalogState::WarmingUp);
        assert_eq!(catalog.version(), CatalogVersion::WARM_UP);
        let records = catalog.bootstrap_records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].header_location.is_some());
        assert!(catalog.wal().is_none());
    }

    #[test]
    fn create_twice_fails() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        catalog.close().unwrap();
        drop(catalog);
        assert!(CatalogPersistence::create(
            temp.path(),
            "shop",
            options(),
            serialization(),
            Arc::new(NoopObserver)
        )
        .is_err());
    }

    #[test]
    fn create_keeps_catalog_file_without_bootstrap() {
        let temp = tempdir().unwrap();
        {
            let catalog = create(temp.path());
            catalog.close().unwrap();
        }
        let catalog_file = temp.path().join("shop_0.catalog");
        let before = std::fs::read(&catalog_file).unwrap();
        std::fs::remove_file(temp.path().join("shop.boot")).unwrap();

        let result = CatalogPersistence::create(
            temp.path(),
            "shop",
            options(),
            serialization(),
            Arc::new(NoopObserver),
        );
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
        assert_eq!(std::fs::read(&catalog_file).unwrap(), before);
        assert!(!temp.path().join("shop.boot").exists());
    }

    #[test]
    fn second_handle_is_locked_out() {
        let temp = tempdir().unwrap();
        let _catalog = create(temp.path());
        assert!(matches!(load(temp.path(), options()), Err(CoreError::CatalogLocked)));
    }

    #[test]
    fn warm_up_data_survives_reload() {
        let temp = tempdir().unwrap();
        {
            let catalog = create(temp.path());
            let items = catalog
                .create_entity_collection("item", CatalogVersion::WARM_UP)
                .unwrap();
            for id in 0..5 {
                items.parts().put(CatalogVersion::WARM_UP, &item(id)).unwrap();
            }
            let flush = catalog.flush(CatalogVersion::WARM_UP, &[]).unwrap();
            assert!(flush.bootstrap.is_some());
            assert_eq!(flush.collections["item"].record_count, 5);
            catalog.close().unwrap();
        }
        let catalog = load(temp.path(), options()).unwrap();
        let items = catalog
            .collection_service_for("item", CatalogVersion::WARM_UP)
            .unwrap();
        assert_eq!(items.parts().count::<Item>(CatalogVersion::WARM_UP).unwrap(), 5);
        assert_eq!(
            items.parts().get::<Item>(CatalogVersion::WARM_UP, 3).unwrap(),
            Some(item(3))
        );
        assert_eq!(catalog.header().last_entity_collection_primary_key, 1);
    }

    #[test]
    fn flush_without_changes_writes_nothing() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        catalog.go_live().unwrap();
        let before = catalog.bootstrap_records().unwrap().len();
        let flush = catalog.flush(v(1), &[]).unwrap();
        assert!(flush.bootstrap.is_none());
        assert_eq!(catalog.bootstrap_records().unwrap().len(), before);
        assert_eq!(catalog.version(), CatalogVersion::WARM_UP);
    }

    #[test]
    fn go_live_commits_alive_header_once() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        let before = catalog.bootstrap_records().unwrap().len();
        let header = catalog.go_live().unwrap();
        assert_eq!(header.state, CatalogState::Alive);
        assert_eq!(catalog.bootstrap_records().unwrap().len(), before + 1);
        let wal = header.wal.unwrap();
        assert_eq!(wal.file_index, 0);
        assert!(temp.path().join("shop_0.wal").exists());
        assert!(matches!(catalog.go_live(), Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn readers_keep_their_version() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        let items = catalog
            .create_entity_collection("item", CatalogVersion::WARM_UP)
            .unwrap();
        items.parts().put(CatalogVersion::WARM_UP, &item(1)).unwrap();
        catalog.go_live().unwrap();

        let items = catalog.collection_service_for("item", v(1)).unwrap();
        items.parts().put(v(1), &item(2)).unwrap();
        catalog.flush(v(1), &[]).unwrap();

        let pinned = catalog
            .collection_service_for("item", CatalogVersion::WARM_UP)
            .unwrap();
        assert!(!pinned.parts().contains::<Item>(CatalogVersion::WARM_UP, 2).unwrap());
        assert!(pinned.parts().contains::<Item>(v(1), 2).unwrap());
    }

    #[test]
    fn compaction_retires_old_generation() {
        let temp = tempdir().unwrap();
        let options = options()
            .min_active_record_share(0.5)
            .file_size_compaction_threshold(1);
        let catalog = CatalogPersistence::create(
            temp.path(),
            "shop",
            options,
            serialization(),
            Arc::new(NoopObserver),
        )
        .unwrap();
        catalog.create_entity_collection("item", CatalogVersion::WARM_UP).unwrap();
        catalog.go_live().unwrap();

        let items = catalog.collection_service_for("item", v(1)).unwrap();
        for id in 0..50 {
            items.parts().put(v(1), &item(id)).unwrap();
        }
        catalog.flush(v(1), &[]).unwrap();
        for id in 0..45 {
            items.parts().remove::<Item>(v(2), id).unwrap();
        }
        let flush = catalog.flush(v(2), &[]).unwrap();
        assert_eq!(flush.compactions.len(), 1);
        assert_eq!(flush.header.collections["item"].file_index, 1);

        let old_path = items.path().to_path_buf();
        assert!(old_path.exists());
        let pinned = catalog.collection_service_for("item", v(1)).unwrap();
        assert_eq!(pinned.file_index(), 0);
        assert_eq!(pinned.parts().count::<Item>(v(1)).unwrap(), 50);

        let current = catalog.collection_service_for("item", v(2)).unwrap();
        assert_eq!(current.file_index(), 1);
        assert_eq!(current.parts().count::<Item>(v(2)).unwrap(), 5);

        catalog.maintainer().shutdown();
        catalog.consumers_left(v(2)).unwrap();
        assert_eq!(catalog.purge_obsolete_files(), 1);
        assert!(!old_path.exists());
        assert!(pinned.parts().count::<Item>(v(1)).is_err());
        assert!(matches!(
            catalog.collection_service_for("item", v(1)),
            Err(CoreError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn delete_keeps_collection_for_older_readers() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        let items = catalog
            .create_entity_collection("item", CatalogVersion::WARM_UP)
            .unwrap();
        items.parts().put(CatalogVersion::WARM_UP, &item(1)).unwrap();
        catalog.go_live().unwrap();

        catalog.delete_entity_collection("item", v(1)).unwrap();
        let flush = catalog.flush(v(1), &[]).unwrap();
        assert!(flush.header.collections.is_empty());
        assert!(matches!(
            catalog.collection_service_for("item", v(1)),
            Err(CoreError::CollectionNotFound { .. })
        ));
        assert!(catalog
            .collection_service_for("item", CatalogVersion::WARM_UP)
            .is_ok());
        assert_eq!(catalog.entity_types(CatalogVersion::WARM_UP), vec!["item".to_string()]);
        assert!(catalog.entity_types(v(1)).is_empty());
        assert_eq!(catalog.maintainer().pending_count(), 1);
    }

    #[test]
    fn rename_moves_collection() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        let items = catalog
            .create_entity_collection("item", CatalogVersion::WARM_UP)
            .unwrap();
        items.parts().put(CatalogVersion::WARM_UP, &item(7)).unwrap();
        catalog.go_live().unwrap();

        let renamed = catalog.rename_entity_collection("item", "article", v(1)).unwrap();
        assert_eq!(renamed.entity_type_primary_key(), items.entity_type_primary_key());
        let flush = catalog.flush(v(1), &[]).unwrap();
        assert!(flush.header.collections.contains_key("article"));
        assert!(!flush.header.collections.contains_key("item"));

        let article = catalog.collection_service_for("article", v(1)).unwrap();
        assert_eq!(article.parts().get::<Item>(v(1), 7).unwrap(), Some(item(7)));
        assert!(catalog.collection_service_for("item", CatalogVersion::WARM_UP).is_ok());
        assert!(catalog.collection_service_for("article", CatalogVersion::WARM_UP).is_err());
    }

    #[test]
    fn historical_headers_come_from_bootstrap() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        catalog.create_entity_collection("item", CatalogVersion::WARM_UP).unwrap();
        catalog.go_live().unwrap();
        catalog.create_entity_collection("brand", v(1)).unwrap();
        catalog.flush(v(1), &[]).unwrap();

        let old = catalog.catalog_header(CatalogVersion::WARM_UP).unwrap();
        assert_eq!(old.collections.len(), 1);
        let new = catalog.catalog_header(v(5)).unwrap();
        assert_eq!(new.collections.len(), 2);
        let brand = catalog.collection_header("brand", v(1)).unwrap();
        assert_eq!(brand.entity_type_primary_key, 2);
        assert!(matches!(
            catalog.collection_header("brand", CatalogVersion::WARM_UP),
            Err(CoreError::CollectionNotFound { .. })
        ));
    }

    #[test]
    fn version_at_before_history_fails() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        let first = catalog.bootstrap_records().unwrap()[0];
        assert!(matches!(
            catalog.version_at(first.timestamp_millis - 1),
            Err(CoreError::TemporalDataNotAvailable { .. })
        ));
        assert_eq!(
            catalog.version_at(first.timestamp_millis).unwrap(),
            CatalogVersion::WARM_UP
        );
    }

    #[test]
    fn wal_transactions_replay_after_reload() {
        let temp = tempdir().unwrap();
        {
            let catalog = create(temp.path());
            assert!(catalog.append_transaction(v(1), b"early".to_vec()).is_err());
            catalog.go_live().unwrap();
            catalog.append_transaction(v(1), b"tx-1".to_vec()).unwrap();
            catalog.flush(v(1), &[]).unwrap();
            catalog.append_transaction(v(2), b"tx-2".to_vec()).unwrap();
            catalog.close().unwrap();
        }
        let catalog = load(temp.path(), options()).unwrap();
        assert_eq!(catalog.version(), v(1));
        let replayed: Vec<_> = catalog
            .committed_transactions()
            .unwrap()
            .map(|entry| entry.unwrap().payload)
            .collect();
        assert_eq!(replayed, vec![b"tx-2".to_vec()]);
    }

    #[test]
    fn damaged_collection_does_not_block_load() {
        let temp = tempdir().unwrap();
        let broken_path;
        {
            let catalog = create(temp.path());
            let good = catalog
                .create_entity_collection("good", CatalogVersion::WARM_UP)
                .unwrap();
            let bad = catalog
                .create_entity_collection("bad", CatalogVersion::WARM_UP)
                .unwrap();
            good.parts().put(CatalogVersion::WARM_UP, &item(1)).unwrap();
            bad.parts().put(CatalogVersion::WARM_UP, &item(1)).unwrap();
            catalog.flush(CatalogVersion::WARM_UP, &[]).unwrap();
            broken_path = bad.path().to_path_buf();
            catalog.close().unwrap();
        }
        std::fs::write(&broken_path, b"garbage").unwrap();

        let catalog = load(temp.path(), options()).unwrap();
        let good = catalog
            .collection_service_for("good", CatalogVersion::WARM_UP)
            .unwrap();
        assert_eq!(
            good.parts().get::<Item>(CatalogVersion::WARM_UP, 1).unwrap(),
            Some(item(1))
        );
        let err = catalog
            .collection_service_for("bad", CatalogVersion::WARM_UP)
            .unwrap_err();
        assert!(err.is_corruption());
        assert!(!catalog.verify().unwrap().is_clean());
    }

    #[test]
    fn identity_mismatch_fails_load() {
        let temp = tempdir().unwrap();
        {
            let catalog = create(temp.path());
            catalog.close().unwrap();
        }
        std::fs::rename(temp.path().join("shop.boot"), temp.path().join("mall.boot")).unwrap();
        std::fs::rename(temp.path().join("shop_0.catalog"), temp.path().join("mall_0.catalog"))
            .unwrap();
        let result = CatalogPersistence::load(
            temp.path(),
            "mall",
            options(),
            serialization(),
            Arc::new(NoopObserver),
        );
        assert!(matches!(result, Err(CoreError::CatalogIdentityMismatch { .. })));
    }

    #[test]
    fn uncommitted_collection_file_is_swept() {
        let temp = tempdir().unwrap();
        let orphan;
        {
            let catalog = create(temp.path());
            catalog.go_live().unwrap();
            let items = catalog.create_entity_collection("item", v(1)).unwrap();
            orphan = items.path().to_path_buf();
            catalog.close().unwrap();
        }
        assert!(orphan.exists());
        let catalog = load(temp.path(), options()).unwrap();
        assert!(!orphan.exists());
        assert!(catalog.entity_types(v(1)).is_empty());
    }

    #[test]
    fn closed_catalog_rejects_calls() {
        let temp = tempdir().unwrap();
        let catalog = create(temp.path());
        catalog.close().unwrap();
        catalog.close().unwrap();
        assert!(matches!(
            catalog.create_entity_collection("item", CatalogVersion::WARM_UP),
            Err(CoreError::Closed)
        ));
    }
}

//! # Kestrel Core
//!
//! Durable storage for Kestrel catalogs.
//!
//! A catalog is a directory of append-only files. Every file is a sequence
//! of framed [`StorageRecord`]s; the data files are offset-indexed record
//! stores whose newest state is described by a header record. The
//! bootstrap log points at the header that is authoritative for each
//! catalog version, and appending to it is the single commit point.
//!
//! This crate provides:
//! - [`RecordStore`] - an offset-indexed, versioned record store
//! - [`BootstrapLog`] - the recovery root and time-travel index
//! - [`CatalogHeader`] and [`EntityCollectionHeader`] with protocol
//!   migrations
//! - [`VersionedServices`] - lookup of the file generation serving a version
//! - [`Compactor`] and [`ObsoleteFileMaintainer`] - space reclamation that
//!   never removes a file a reader can still reach
//! - [`CatalogWal`] - the boundary to the transaction log
//! - [`CatalogPersistence`] - the service tying all of the above together
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_core::{CatalogPersistence, CatalogVersion, NoopObserver, StorageOptions};
//!
//! let catalog = CatalogPersistence::create(path, "products", StorageOptions::default(), ctx, Arc::new(NoopObserver))?;
//! let skus = catalog.create_entity_collection("sku", CatalogVersion::WARM_UP)?;
//! skus.parts().put(CatalogVersion::WARM_UP, &sku)?;
//! catalog.go_live()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod bootstrap;
pub mod compaction;
mod config;
pub mod dir;
mod error;
pub mod header;
pub mod migration;
pub mod observer;
pub mod obsolete;
pub mod offset_index;
pub mod persistence;
pub mod record;
mod types;
pub mod versioned;
pub mod wal;

pub use backup::BackupSummary;
pub use bootstrap::{BootstrapLog, BootstrapRecord, BOOTSTRAP_RECORD_SIZE};
pub use compaction::{CompactionPolicy, CompactionResult, Compactor};
pub use config::StorageOptions;
pub use dir::{CatalogDir, CatalogFileKind};
pub use error::{CoreError, CoreResult, TemporalTarget};
pub use header::{
    CatalogHeader, CollectionFileReference, EntityCollectionHeader, StoredCatalogHeader,
    StoredCollectionHeader, WalFileReference, CURRENT_STORAGE_PROTOCOL_VERSION,
};
pub use migration::{CatalogImage, HeaderMigration, MigrationInfo, MigrationRegistry};
pub use observer::{NoopObserver, StorageObserver};
pub use obsolete::ObsoleteFileMaintainer;
pub use offset_index::{FileStatistics, OffsetIndexDescriptor, RecordStore, RecordStoreOptions};
pub use persistence::{
    CatalogFlush, CatalogPersistence, CollectionFlush, EntityCollectionPersistence,
    FileVerification, StoragePartPersistence, VerificationReport,
};
pub use record::{RecordControl, StorageRecord};
pub use types::{now_millis, CatalogState, CatalogVersion, FileLocation, RecordKey};
pub use versioned::{Versioned, VersionedServices};
pub use wal::{CatalogWal, WalEntry, WalReplay};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

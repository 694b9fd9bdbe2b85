//! Persistence services of a catalog.
//!
//! Three layers sit on top of the record store:
//!
//! - [`StoragePartPersistence`] is a typed facade over one file generation
//! - [`EntityCollectionPersistence`] owns one `.entity` generation and its
//!   header
//! - [`CatalogPersistence`] owns the catalog file, the bootstrap log, the
//!   WAL and the version index of every collection
//!
//! ## Write path
//!
//! ```text
//! put/remove ──▶ RecordStore (staged) ──flush(v)──▶ descriptor
//!                                                       │
//!         collection header (if changed) ◀──────────────┘
//!                       │
//!         catalog header ──▶ bootstrap record (commit point)
//! ```
//!
//! ## Read path
//!
//! A reader pinned to version `v` asks
//! [`CatalogPersistence::collection_service_for`] and receives the file
//! generation that serves `v`, even if the writer has compacted or renamed
//! the collection since. Superseded generations are handed to the
//! [`ObsoleteFileMaintainer`](crate::obsolete::ObsoleteFileMaintainer) and
//! closed once no reader can reach them.

mod catalog;
mod entity_collection;
mod storage_parts;

pub use catalog::{CatalogFlush, CatalogPersistence, FileVerification, VerificationReport};
pub use entity_collection::{CollectionFlush, EntityCollectionPersistence};
pub use storage_parts::StoragePartPersistence;

use crate::compaction::{CompactionPolicy, Compactor};
use crate::config::StorageOptions;
use crate::observer::StorageObserver;
use crate::offset_index::RecordStoreOptions;
use kestrel_codec::SerializationContext;
use std::sync::Arc;

/// Everything a service needs besides its own file.
#[derive(Debug)]
pub(crate) struct PersistenceContext {
    pub(crate) options: StorageOptions,
    pub(crate) store_options: RecordStoreOptions,
    pub(crate) serialization: Arc<SerializationContext>,
    pub(crate) observer: Arc<dyn StorageObserver>,
    pub(crate) compactor: Compactor,
}

impl PersistenceContext {
    pub(crate) fn new(
        options: StorageOptions,
        serialization: Arc<SerializationContext>,
        observer: Arc<dyn StorageObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store_options: RecordStoreOptions::from(&options),
            compactor: Compactor::new(CompactionPolicy::from(&options)),
            options,
            serialization,
            observer,
        })
    }
}

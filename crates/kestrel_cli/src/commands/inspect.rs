//! Inspect command implementation.
//!
//! Reads the catalog without taking the writer lock and without changing
//! any file, so it also works on a catalog that is in use or that still
//! needs an upgrade.

use super::{format_size, format_timestamp, CatalogTarget};
use kestrel_core::dir::{
    bootstrap_file_name, catalog_file_name, entity_file_name, legacy_entity_file_name,
};
use kestrel_core::offset_index::read_root_record;
use kestrel_core::{
    BootstrapLog, BootstrapRecord, FileLocation, StoredCatalogHeader, StoredCollectionHeader,
};
use kestrel_storage::{FileBackend, StorageBackend};
use serde::Serialize;

/// Catalog inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Catalog directory.
    pub path: String,
    /// Catalog name.
    pub catalog: String,
    /// Protocol the current header was written with.
    pub protocol: u32,
    /// Lifecycle state.
    pub state: String,
    /// Durable catalog version.
    pub version: u64,
    /// Generation of the catalog file.
    pub catalog_file_index: u32,
    /// Size of the catalog file in bytes.
    pub catalog_file_size: u64,
    /// WAL segment the header continues in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal: Option<String>,
    /// Total bootstrap records.
    pub bootstrap_records: u64,
    /// Newest bootstrap records, oldest first.
    pub history: Vec<HistoryEntry>,
    /// One entry per collection.
    pub collections: Vec<CollectionStats>,
}

/// One bootstrap record.
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    /// Position in the log.
    pub index: u64,
    /// Catalog version.
    pub version: u64,
    /// Protocol of the referenced header.
    pub protocol: u32,
    /// Catalog file generation.
    pub catalog_file_index: u32,
    /// Commit time in milliseconds since the epoch.
    pub timestamp_millis: i64,
}

/// Statistics for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Entity type name.
    pub entity_type: String,
    /// Entity type id; absent in protocol 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type_primary_key: Option<i32>,
    /// File generation.
    pub file_index: u32,
    /// File name.
    pub file: String,
    /// Live records.
    pub record_count: Option<u64>,
    /// Live share of the file.
    pub active_record_share: Option<f64>,
    /// File size in bytes.
    pub file_size: Option<u64>,
    /// Why the header could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the inspect command.
pub fn run(
    target: &CatalogTarget,
    history: usize,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let bootstrap = BootstrapLog::open_read_only(&target.file(&bootstrap_file_name(&target.name)))?;
    let records = bootstrap.records()?;
    let last = bootstrap.last_record();

    let catalog_file = catalog_file_name(&target.name, last.catalog_file_index);
    let catalog_backend = FileBackend::open_read_only(&target.file(&catalog_file))?;
    let location = last
        .header_location
        .ok_or("Newest bootstrap record has no header location")?;
    let stored = StoredCatalogHeader::decode(&read_root_record(&catalog_backend, location, false)?)?;

    let skip = if history == 0 {
        0
    } else {
        records.len().saturating_sub(history)
    };
    let mut result = InspectResult {
        path: target.path.display().to_string(),
        catalog: stored.catalog_name().to_string(),
        protocol: stored.protocol_version(),
        state: String::new(),
        version: last.catalog_version.as_u64(),
        catalog_file_index: last.catalog_file_index,
        catalog_file_size: catalog_backend.len(),
        wal: None,
        bootstrap_records: bootstrap.record_count(),
        history: records
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(index, record)| history_entry(index as u64, record))
            .collect(),
        collections: Vec::new(),
    };

    match &stored {
        StoredCatalogHeader::V2(header) => {
            result.state = header.state.to_string();
            result.wal = header.wal.as_ref().map(|wal| wal.file_name());
            for reference in header.collections.values() {
                let file = entity_file_name(
                    &reference.entity_type,
                    reference.entity_type_primary_key,
                    reference.file_index,
                );
                let mut stats = collection_stats(target, &file, reference.header_location);
                stats.entity_type = reference.entity_type.clone();
                stats.entity_type_primary_key = Some(reference.entity_type_primary_key);
                stats.file_index = reference.file_index;
                result.collections.push(stats);
            }
        }
        StoredCatalogHeader::V1(header) => {
            result.state = header.state.to_string();
            result.wal = header.wal_file_path.clone();
            for reference in header.collections.values() {
                let file = legacy_entity_file_name(&reference.entity_type, reference.file_index);
                let mut stats = collection_stats(target, &file, reference.header_location);
                stats.entity_type = reference.entity_type.clone();
                stats.file_index = reference.file_index;
                result.collections.push(stats);
            }
        }
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn history_entry(index: u64, record: &BootstrapRecord) -> HistoryEntry {
    HistoryEntry {
        index,
        version: record.catalog_version.as_u64(),
        protocol: record.storage_protocol_version,
        catalog_file_index: record.catalog_file_index,
        timestamp_millis: record.timestamp_millis,
    }
}

fn collection_stats(target: &CatalogTarget, file: &str, location: FileLocation) -> CollectionStats {
    let mut stats = CollectionStats {
        entity_type: String::new(),
        entity_type_primary_key: None,
        file_index: 0,
        file: file.to_string(),
        record_count: None,
        active_record_share: None,
        file_size: None,
        error: None,
    };
    let header = FileBackend::open_read_only(&target.file(file))
        .map_err(kestrel_core::CoreError::from)
        .and_then(|backend| {
            stats.file_size = Some(backend.len());
            StoredCollectionHeader::decode(&read_root_record(&backend, location, false)?)
        });
    match header {
        Ok(StoredCollectionHeader::V2(header)) => {
            stats.record_count = Some(header.record_count);
            stats.active_record_share = Some(header.active_record_share);
        }
        Ok(StoredCollectionHeader::V1(header)) => {
            stats.record_count = Some(header.record_count);
            stats.active_record_share = Some(header.descriptor.active_record_share());
        }
        Err(err) => stats.error = Some(err.to_string()),
    }
    stats
}

fn print_text_output(result: &InspectResult) {
    println!("Kestrel Catalog Inspection");
    println!("==========================");
    println!();
    println!("Path:      {}", result.path);
    println!("Catalog:   {}", result.catalog);
    println!("State:     {}", result.state);
    println!("Version:   {}", result.version);
    println!("Protocol:  {}", result.protocol);
    println!(
        "Catalog file: generation {} ({})",
        result.catalog_file_index,
        format_size(result.catalog_file_size)
    );
    if let Some(wal) = &result.wal {
        println!("WAL:       {}", wal);
    }
    println!();
    println!(
        "Bootstrap history ({} of {} records):",
        result.history.len(),
        result.bootstrap_records
    );
    for entry in &result.history {
        println!(
            "  #{:<5} version {:<8} protocol {} file {:<3} {}",
            entry.index,
            entry.version,
            entry.protocol,
            entry.catalog_file_index,
            format_timestamp(entry.timestamp_millis)
        );
    }

    println!();
    println!("Collections:");
    if result.collections.is_empty() {
        println!("  (none)");
    }
    for collection in &result.collections {
        match &collection.error {
            Some(error) => println!(
                "  {} [{}] DAMAGED: {}",
                collection.entity_type, collection.file, error
            ),
            None => println!(
                "  {} [{}] {} records, {:.1}% live, {}",
                collection.entity_type,
                collection.file,
                collection.record_count.unwrap_or(0),
                collection.active_record_share.unwrap_or(1.0) * 100.0,
                format_size(collection.file_size.unwrap_or(0))
            ),
        }
    }
}

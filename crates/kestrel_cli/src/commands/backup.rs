//! Backup command implementation.
//!
//! Writes the durable state of a catalog into a fresh directory that loads
//! as an independent catalog of the same name.

use super::{format_size, format_timestamp, CatalogTarget};
use kestrel_core::StorageOptions;
use std::path::Path;
use tracing::info;

/// Creates a backup of the catalog in `output`.
pub fn run(target: &CatalogTarget, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Creating backup of {:?} in {:?}", target.path, output);

    let catalog = target.load(StorageOptions::default())?;
    let summary = catalog.backup_to(output)?;
    catalog.close()?;

    println!("✓ Backup created successfully");
    println!("  Path: {:?}", summary.path);
    println!("  Catalog: {}", summary.catalog_name);
    println!("  Version: {}", summary.version.as_u64());
    println!("  Records: {}", summary.record_count);
    println!("  Size: {}", format_size(summary.bytes_written));
    println!("  Files: {}", summary.files.len() + 1);
    println!("  Timestamp: {}", format_timestamp(summary.timestamp_millis));

    Ok(())
}

//! Trim command implementation.

use super::{format_timestamp, CatalogTarget};
use kestrel_core::{CatalogVersion, StorageOptions};
use tracing::info;

/// Runs the trim command.
pub fn run(target: &CatalogTarget, below: u64) -> Result<(), Box<dyn std::error::Error>> {
    let min_version = CatalogVersion::new(below);
    info!(catalog = %target.name, version = %min_version, "trimming bootstrap log");

    let catalog = target.load(StorageOptions::default())?;
    let before = catalog.bootstrap_records()?.len();
    let first = catalog.trim_bootstrap(min_version)?;
    let after = catalog.bootstrap_records()?.len();
    let removed = catalog.purge_obsolete_files();
    catalog.close()?;

    println!("✓ Bootstrap log trimmed");
    println!("  Records: {} -> {}", before, after);
    println!(
        "  Oldest addressable version: {} (committed {})",
        first.catalog_version.as_u64(),
        format_timestamp(first.timestamp_millis)
    );
    println!("  Obsolete files removed: {}", removed);

    Ok(())
}

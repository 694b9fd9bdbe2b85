//! Migrate command implementation.

use super::CatalogTarget;
use kestrel_core::dir::bootstrap_file_name;
use kestrel_core::{
    BootstrapLog, MigrationRegistry, StorageOptions, CURRENT_STORAGE_PROTOCOL_VERSION,
};
use tracing::info;

/// Upgrades the catalog to the current storage protocol.
pub fn run(target: &CatalogTarget, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let stored = BootstrapLog::open_read_only(&target.file(&bootstrap_file_name(&target.name)))?
        .last_record()
        .storage_protocol_version;

    println!("Migration Status");
    println!("================");
    println!("  Stored protocol:  {}", stored);
    println!("  Current protocol: {}", CURRENT_STORAGE_PROTOCOL_VERSION);

    if stored == CURRENT_STORAGE_PROTOCOL_VERSION {
        println!();
        println!("✓ Catalog is up to date");
        return Ok(());
    }
    if stored > CURRENT_STORAGE_PROTOCOL_VERSION {
        return Err(format!(
            "Catalog was written by a newer engine (protocol {stored}); refusing to touch it"
        )
        .into());
    }

    let registry = MigrationRegistry::standard();
    let pending: Vec<_> = registry
        .list()
        .into_iter()
        .filter(|step| step.from_version >= stored)
        .collect();
    println!();
    println!("Pending Migrations:");
    for step in &pending {
        println!("  v{} -> v{}: {}", step.from_version, step.from_version + 1, step.name);
    }

    if dry_run {
        return Ok(());
    }

    info!(catalog = %target.name, from = stored, "upgrading catalog");
    let catalog = target.load(StorageOptions::default())?;
    let header = catalog.header();
    catalog.close()?;

    println!();
    println!(
        "✓ Catalog upgraded to protocol {} at version {}",
        header.storage_protocol_version,
        header.version.as_u64()
    );

    Ok(())
}

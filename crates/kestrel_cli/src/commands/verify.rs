//! Verify command implementation.

use super::{format_size, CatalogTarget};
use kestrel_core::{StorageOptions, VerificationReport};

/// Runs the verify command.
pub fn run(target: &CatalogTarget) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying catalog `{}` at {:?}", target.name, target.path);
    println!();

    let catalog = target.load(StorageOptions::default())?;
    let report = catalog.verify()?;
    catalog.close()?;

    print_report(&report);

    println!();
    if report.is_clean() {
        println!("✓ Catalog verification passed");
        Ok(())
    } else {
        println!("✗ Catalog verification failed");
        Err("Verification failed".into())
    }
}

fn print_report(report: &VerificationReport) {
    println!("Bootstrap log: {} records intact", report.bootstrap_records);
    for file in &report.files {
        let name = file
            .path
            .file_name()
            .map_or_else(|| file.path.display().to_string(), |n| n.to_string_lossy().into_owned());
        match (&file.statistics, &file.error) {
            (_, Some(error)) => println!("  ✗ {}: {}", name, error),
            (Some(stats), None) => println!(
                "  ✓ {}: {} records ({} data, {} index, {} header), {} live, {:.1}% live share, {}",
                name,
                stats.record_count,
                stats.data_records,
                stats.index_chunks,
                stats.root_records,
                stats.living_records,
                stats.active_record_share * 100.0,
                format_size(stats.file_size)
            ),
            (None, None) => println!("  ? {}: not scanned", name),
        }
    }
}

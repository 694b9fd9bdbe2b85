//! Compact command implementation.

use super::{format_size, CatalogTarget};
use kestrel_core::{CompactionPolicy, OffsetIndexDescriptor, StorageOptions};

/// A file the policy selects for compaction.
#[derive(Debug)]
pub struct Candidate {
    /// Entity type, or `None` for the catalog file.
    pub entity_type: Option<String>,
    /// Live share of the file.
    pub share: f64,
    /// File size in bytes.
    pub file_size: u64,
}

/// Runs the compact command.
pub fn run(
    target: &CatalogTarget,
    min_share: f64,
    threshold: u64,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = StorageOptions::default()
        .min_active_record_share(min_share)
        .file_size_compaction_threshold(threshold);
    options.validate()?;
    let policy = CompactionPolicy::from(&options);

    println!("Compacting catalog `{}` at {:?}", target.name, target.path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let catalog = target.load(options)?;
    let version = catalog.version();
    let header = catalog.header();

    let mut candidates = Vec::new();
    consider(&policy, None, &header.descriptor, &mut candidates);
    for entity_type in header.collections.keys() {
        match catalog.collection_header(entity_type, version) {
            Ok(collection) => consider(
                &policy,
                Some(entity_type),
                &collection.descriptor,
                &mut candidates,
            ),
            Err(err) => println!("  skipping `{}`: {}", entity_type, err),
        }
    }

    if candidates.is_empty() {
        println!("No compaction needed - every file is above the live share threshold");
        catalog.close()?;
        return Ok(());
    }

    println!("Compaction Analysis:");
    for candidate in &candidates {
        println!(
            "  {:<24} {:>6.1}% live, {}",
            candidate.entity_type.as_deref().unwrap_or("(catalog)"),
            candidate.share * 100.0,
            format_size(candidate.file_size)
        );
    }

    if dry_run {
        catalog.close()?;
        return Ok(());
    }

    println!();
    println!("Performing compaction...");
    let flush = catalog.flush(version, &[])?;
    // nobody else reads this catalog, so superseded generations can go now
    catalog.consumers_left(version)?;
    let removed = catalog.purge_obsolete_files();
    catalog.close()?;

    let mut reclaimed = 0;
    for result in &flush.compactions {
        reclaimed += result.bytes_reclaimed();
        println!(
            "  {} -> {}: {} records, {:.1}% -> {:.1}% live",
            result.source,
            result.target,
            result.output_records,
            result.share_before * 100.0,
            result.share_after * 100.0
        );
    }
    println!();
    println!(
        "✓ Compaction complete: {} files rewritten, {} removed, {} reclaimed",
        flush.compactions.len(),
        removed,
        format_size(reclaimed)
    );

    Ok(())
}

fn consider(
    policy: &CompactionPolicy,
    entity_type: Option<&String>,
    descriptor: &OffsetIndexDescriptor,
    candidates: &mut Vec<Candidate>,
) {
    if policy.should_compact(descriptor) {
        candidates.push(Candidate {
            entity_type: entity_type.cloned(),
            share: descriptor.active_record_share(),
            file_size: descriptor.file_size,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::CatalogVersion;

    #[test]
    fn test_consider_uses_policy() {
        let policy = CompactionPolicy::from(
            &StorageOptions::default()
                .min_active_record_share(0.5)
                .file_size_compaction_threshold(10),
        );
        let mut sparse = OffsetIndexDescriptor::empty(CatalogVersion::WARM_UP);
        sparse.living_record_size = 10;
        sparse.written_record_size = 100;
        sparse.file_size = 200;
        let mut dense = sparse.clone();
        dense.living_record_size = 90;

        let mut candidates = Vec::new();
        consider(&policy, Some(&"sku".to_string()), &sparse, &mut candidates);
        consider(&policy, None, &dense, &mut candidates);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].entity_type.as_deref(), Some("sku"));
    }
}

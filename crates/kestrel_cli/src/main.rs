//! Kestrel CLI
//!
//! Maintenance tools for Kestrel catalog directories.
//!
//! # Commands
//!
//! - `inspect` - Display bootstrap history and header summaries
//! - `verify` - Checksum scan of the bootstrap log and every data file
//! - `compact` - Rewrite sparse files into new generations
//! - `trim` - Drop bootstrap history below a version
//! - `backup` - Copy the durable state into a new directory
//! - `migrate` - Upgrade a catalog written by an older protocol

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Kestrel command-line catalog tools.
#[derive(Parser)]
#[command(name = "kestrel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the catalog directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Catalog name (inferred from the single `.boot` file if omitted)
    #[arg(global = true, short, long)]
    catalog: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display bootstrap history and header summaries
    Inspect {
        /// Number of newest bootstrap records to show (0 shows all)
        #[arg(short = 'n', long, default_value = "20")]
        history: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify checksums of the bootstrap log and all data files
    Verify,

    /// Compact files whose live share is below the threshold
    Compact {
        /// Compact files whose live share is below this value
        #[arg(short, long, default_value = "0.5")]
        min_share: f64,

        /// Only compact files larger than this many bytes
        #[arg(short, long, default_value = "1")]
        threshold: u64,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Drop bootstrap history older than a catalog version
    Trim {
        /// Oldest catalog version that must stay addressable
        #[arg(short, long)]
        below: u64,
    },

    /// Copy the durable state of the catalog into a new directory
    Backup {
        /// Directory to create the copy in
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Upgrade a catalog written by an older storage protocol
    Migrate {
        /// Only report the stored protocol and the pending steps
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("Kestrel CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("Kestrel Core v{}", kestrel_core::VERSION);
        println!(
            "Storage protocol {}",
            kestrel_core::CURRENT_STORAGE_PROTOCOL_VERSION
        );
        return Ok(());
    }

    let path = cli.path.ok_or("Catalog path required (--path)")?;
    let target = commands::CatalogTarget::resolve(path, cli.catalog)?;

    match cli.command {
        Commands::Inspect { history, format } => {
            commands::inspect::run(&target, history, &format)?;
        }
        Commands::Verify => {
            commands::verify::run(&target)?;
        }
        Commands::Compact {
            min_share,
            threshold,
            dry_run,
        } => {
            commands::compact::run(&target, min_share, threshold, dry_run)?;
        }
        Commands::Trim { below } => {
            commands::trim::run(&target, below)?;
        }
        Commands::Backup { output } => {
            commands::backup::run(&target, &output)?;
        }
        Commands::Migrate { dry_run } => {
            commands::migrate::run(&target, dry_run)?;
        }
        Commands::Version => {}
    }

    Ok(())
}

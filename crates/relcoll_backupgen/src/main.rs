//! relcoll backup generator CLI
//!
//! # Commands
//!
//! - `generate` - Build a replica, fill a dictionary and copy out a backup
//! - `inspect` - Display the metadata and providers of a backup folder

use clap::{Parser, Subcommand};
use relcoll_backupgen::{
    count_users, BackupGenerator, GeneratorOptions, RandomServiceNames, SequentialServiceNames,
    ServiceNameGenerator,
};
use relcoll_core::{BackupReader, StateProviderKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Reliable collection backup tools.
#[derive(Parser)]
#[command(name = "relcoll-backupgen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a backup of user records
    Generate {
        /// Log folder; wiped before generation
        #[arg(short, long)]
        out: PathBuf,

        /// Number of transactions
        #[arg(long, default_value = "8")]
        batch_count: u32,

        /// Keys added per transaction
        #[arg(long, default_value = "8")]
        batch_size: u32,

        /// First key written
        #[arg(long, default_value = "0")]
        start_key: i64,

        /// Seed for the random service name
        #[arg(long, conflicts_with = "sequential")]
        seed: Option<u64>,

        /// Use `fabric:/unittest/service0` instead of a random name
        #[arg(long)]
        sequential: bool,
    },

    /// Display the contents of a backup folder
    Inspect {
        /// Backup folder
        dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    path: String,
    backup_id: String,
    sequence: u64,
    created_at_ms: u64,
    providers: Vec<ProviderReport>,
}

#[derive(Debug, Serialize)]
struct ProviderReport {
    id: u64,
    name: String,
    kind: String,
    parent: Option<u64>,
    entries: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Generate {
            out,
            batch_count,
            batch_size,
            start_key,
            seed,
            sequential,
        } => {
            let options = GeneratorOptions::new()
                .start_key(start_key)
                .batch_count(batch_count)
                .batch_size(batch_size);
            let copied = if sequential {
                generate(&out, SequentialServiceNames::default(), options)?
            } else {
                let names = seed.map_or_else(RandomServiceNames::new, RandomServiceNames::from_seed);
                generate(&out, names, options)?
            };
            println!("✓ Backup generated");
            println!("  Path: {}", copied.display());
        }
        Commands::Inspect { dir, format } => inspect(&dir, &format, cli.verbose)?,
        Commands::Version => {
            println!("relcoll backupgen v{}", env!("CARGO_PKG_VERSION"));
            println!("relcoll core v{}", relcoll_core::VERSION);
        }
    }

    Ok(())
}

fn generate<N: ServiceNameGenerator>(
    out: &Path,
    names: N,
    options: GeneratorOptions,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let mut generator = BackupGenerator::with_names(out, names).options(options);
    Ok(generator.generate_user_data()?)
}

fn inspect(dir: &Path, format: &str, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let reader = BackupReader::open(dir)?;
    let metadata = reader.metadata();

    let mut providers = Vec::new();
    for info in reader.providers() {
        let entries = if info.kind == StateProviderKind::DataStore {
            None
        } else {
            Some(reader.entry_count(&info.name)?)
        };
        providers.push(ProviderReport {
            id: info.id.as_u64(),
            name: info.name.to_string(),
            kind: info.kind.to_string(),
            parent: info.parent.map(|p| p.as_u64()),
            entries,
        });
    }

    let report = InspectReport {
        path: dir.display().to_string(),
        backup_id: metadata.backup_id.to_string(),
        sequence: metadata.sequence,
        created_at_ms: metadata.created_at_ms,
        providers,
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Backup: {}", report.path);
    println!("  ID: {}", report.backup_id);
    println!("  Sequence: {}", report.sequence);
    println!("  Created: {} ms", report.created_at_ms);
    println!("  Providers: {}", report.providers.len());
    for p in &report.providers {
        match p.entries {
            Some(n) => println!("    [{}] {} ({}, {} entries)", p.id, p.name, p.kind, n),
            None => println!("    [{}] {} ({})", p.id, p.name, p.kind),
        }
    }

    match count_users(&reader) {
        Ok(Some(n)) => println!("  Users: {n}"),
        Ok(None) => {}
        Err(e) if verbose => println!("  Users: cannot decode values: {e}"),
        Err(e) => tracing::debug!(error = %e, "dictionary values are not users"),
    }
    Ok(())
}

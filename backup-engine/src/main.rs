//! Backup Engine - Main entry point
//!
//! Offline inspection of backup metadata documents and restore journals.

use anyhow::{Context, Result};
use backup_engine::{config::Config, journal::RestoreContext, metadata::BackupMetadata, utils};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a backup metadata document
    Show {
        file: PathBuf,
        /// Omit databases and access control
        #[arg(long)]
        light: bool,
    },
    /// Check that the aggregate counters of a document match its parts
    Verify { file: PathBuf },
    /// Summarize a restore journal
    Journal {
        /// Journal location; the configured one if omitted
        file: Option<PathBuf>,
    },
}

fn load_backup(path: &Path) -> Result<BackupMetadata> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(BackupMetadata::load_json(&data)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("Starting backup-engine v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Show { file, light } => {
            let backup = load_backup(&file)?;
            println!("{}", backup.dump_json(light)?);
        }
        Command::Verify { file } => {
            let backup = load_backup(&file)?;
            backup.check_counters()?;
            println!(
                "{}: state={} databases={} parts={} bytes={} real_bytes={}",
                backup.name,
                backup.state(),
                backup.get_databases().len(),
                backup.get_parts().len(),
                backup.size(),
                backup.real_size()
            );
        }
        Command::Journal { file } => {
            let path = file.unwrap_or_else(|| config.backup.restore_context_path.clone());
            let ctx = RestoreContext::open(&path)?;
            println!("{}: {} parts restored", path.display(), ctx.restored_count());
            for failed in ctx.failed_parts() {
                println!("  failed {} {}: {}", failed.table, failed.part, failed.error);
            }
        }
    }

    Ok(())
}

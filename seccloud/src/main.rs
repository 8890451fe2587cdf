use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seccloud::metrics::{render, PrometheusMetrics};
use seccloud::transfer::{LoadArgs, StoreArgs};
use seccloud_storage::{format_byte_size, StorageConfig};

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[arg(long, short, global = true, default_value = "seccloud.toml", help = "Path to the TOML configuration")]
    config: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var"
    )]
    log_level: String,

    #[arg(long, global = true, help = "Print Prometheus metrics when the command finishes")]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a file and commit it to the cloud stores
    Store(StoreArgs),

    /// Load data into a file
    Load(LoadArgs),

    /// Delete data locally and from every cloud store
    Delete {
        /// Data id
        id: String,
    },

    /// Commit unsynced local writes
    Flush {
        /// Data id, every dirty entry when omitted
        id: Option<String>,
    },

    /// Drop the local copy of synced data
    Evict {
        /// Data id
        id: String,
    },

    /// Run the background sync until interrupted
    Sync,

    /// Inspect metadata, cache and stores
    Inspect {
        #[command(subcommand)]
        command: InspectCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum InspectCommand {
    /// Number of keys in each metadata tree
    NumKeys,
    /// Total disk space used by the metadata database
    DiskSpace,
    /// List committed objects
    Objects {
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },
    /// Probe the configured cloud stores
    Stores,
    /// List local cache entries
    Cache,
    /// Local and remote capacity
    Space,
}

fn setup_tracing(log_level: &str) {
    // Try to use RUST_LOG env var first, fall back to CLI flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    let config = StorageConfig::load_from_file(&cli.config)?;
    let metrics = PrometheusMetrics::register()
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?
        .shared();

    match cli.command {
        Command::Store(args) => seccloud::transfer::store(config, metrics, args)?,
        Command::Load(args) => seccloud::transfer::load(config, metrics, args)?,
        Command::Delete { id } => seccloud::transfer::delete(config, metrics, id)?,
        Command::Flush { id } => seccloud::transfer::flush(config, metrics, id)?,
        Command::Evict { id } => seccloud::transfer::evict(config, metrics, id)?,
        Command::Sync => seccloud::transfer::sync(config, metrics)?,
        Command::Inspect { command } => {
            use seccloud::inspect::*;
            match command {
                InspectCommand::NumKeys => num_keys(&config)?,
                InspectCommand::DiskSpace => {
                    let disk_space = disk_space(&config)?;
                    println!("Disk space: {}", format_byte_size(disk_space));
                }
                InspectCommand::Objects { json } => list_objects(&config, json)?,
                InspectCommand::Stores => stores(config, metrics)?,
                InspectCommand::Cache => cache(config, metrics)?,
                InspectCommand::Space => space(config, metrics)?,
            }
        }
    }

    if cli.print_metrics {
        print!("{}", render()?);
    }
    Ok(())
}

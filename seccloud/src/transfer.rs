use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use seccloud_storage::{
    format_byte_size, SecureCloudStorage, SharedMetrics, StorageConfig, StorageError,
};

#[derive(Parser, Debug)]
pub struct StoreArgs {
    #[arg(required = true, help = "Data id")]
    pub id: String,

    #[arg(required = true, help = "Source file path")]
    pub src: PathBuf,

    #[arg(long, help = "Return once staged locally, leave the upload to a later sync")]
    pub no_flush: bool,
}

#[derive(Parser, Debug)]
pub struct LoadArgs {
    #[arg(required = true, help = "Data id")]
    pub id: String,

    #[arg(required = true, help = "Destination file path")]
    pub dest: PathBuf,
}

#[tokio::main]
pub async fn store(config: StorageConfig, metrics: SharedMetrics, args: StoreArgs) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;

    let file = tokio::fs::File::open(&args.src).await?;
    let length = file.metadata().await?.len();
    storage.store_data(&args.id, file, length).await?;
    info!(data_id = %args.id, size = %format_byte_size(length), "Stored locally");

    if !args.no_flush {
        storage.flush(&args.id).await?;
        info!(data_id = %args.id, "Committed to the cloud stores");
    }
    Ok(())
}

#[tokio::main]
pub async fn load(config: StorageConfig, metrics: SharedMetrics, args: LoadArgs) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;

    let mut file = tokio::fs::File::create(&args.dest).await?;
    match storage.load_data(&args.id, &mut file).await {
        Ok(size) => {
            file.flush().await?;
            info!(data_id = %args.id, size = %format_byte_size(size), "Loaded");
            Ok(())
        }
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(&args.dest).await;
            match e {
                StorageError::NotFound(_) => bail!("Data '{}' not found", args.id),
                e => Err(e.into()),
            }
        }
    }
}

#[tokio::main]
pub async fn delete(config: StorageConfig, metrics: SharedMetrics, id: String) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;
    if !storage.delete_data(&id).await? {
        bail!("Data '{}' not found", id);
    }
    println!("Deleted {}", id);
    Ok(())
}

/// Flushes one entry, or every dirty entry when `id` is `None`.
#[tokio::main]
pub async fn flush(config: StorageConfig, metrics: SharedMetrics, id: Option<String>) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;
    match id {
        Some(id) => storage.flush(&id).await?,
        None => {
            let dirty = storage.cache().dirty_ids().len();
            storage.flush_all().await?;
            println!("Flushed {} entries", dirty);
        }
    }
    Ok(())
}

#[tokio::main]
pub async fn evict(config: StorageConfig, metrics: SharedMetrics, id: String) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;
    if storage.evict(&id).await? {
        println!("Evicted local copy of {}", id);
    } else {
        println!("{} is not cached or still has unsynced writes", id);
    }
    Ok(())
}

/// Runs the background sync until interrupted.
#[tokio::main]
pub async fn sync(config: StorageConfig, metrics: SharedMetrics) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;
    let handle = storage.start_sync();
    info!("Background sync running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;

    let dirty = storage.cache().dirty_ids().len();
    if dirty > 0 {
        warn!(dirty, "Stopped with unsynced entries, they resume on the next run");
    }
    Ok(())
}

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use seccloud_storage::{
    format_byte_size, DataObject, MetaStore, SecureCloudStorage, SharedMetrics, StorageConfig,
};

#[derive(Debug, Serialize)]
struct ObjectRow {
    data_id: String,
    size: u64,
    generation: u64,
    k: u32,
    m: u32,
    /// Milliseconds since the UNIX epoch.
    committed_at: i64,
}

impl ObjectRow {
    fn committed_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.committed_at).single()
    }
}

impl From<DataObject> for ObjectRow {
    fn from(object: DataObject) -> Self {
        Self {
            committed_at: object.committed_at,
            data_id: object.data_id,
            size: object.size,
            generation: object.generation,
            k: object.k,
            m: object.m,
        }
    }
}

fn open_meta(config: &StorageConfig) -> Result<MetaStore> {
    Ok(MetaStore::open(config.meta_dir.clone(), Some(config.durability))?)
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn num_keys(config: &StorageConfig) -> Result<()> {
    let (objects, generations, keys, cache) = open_meta(config)?.num_keys()?;
    println!("Objects: {}", objects);
    println!("Generations: {}", generations);
    println!("Encryption keys: {}", keys);
    println!("Cache entries: {}", cache);
    Ok(())
}

pub fn disk_space(config: &StorageConfig) -> Result<u64> {
    Ok(open_meta(config)?.disk_space())
}

/// Lists committed objects, as a table or as JSON.
pub fn list_objects(config: &StorageConfig, json: bool) -> Result<()> {
    let rows: Vec<ObjectRow> = open_meta(config)?
        .list_data_objects()?
        .into_iter()
        .map(ObjectRow::from)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No objects found");
        return Ok(());
    }

    println!(
        "{:<40} {:>12} {:>6} {:>6} {:<20}",
        "Data id", "Size", "Gen", "k+m", "Committed"
    );
    println!("{:-<88}", "");
    for row in rows {
        println!(
            "{:<40} {:>12} {:>6} {:>6} {:<20}",
            row.data_id,
            format_byte_size(row.size),
            row.generation,
            format!("{}+{}", row.k, row.m),
            format_time(row.committed_time())
        );
    }
    Ok(())
}

/// Probes every configured store and prints its state.
#[tokio::main]
pub async fn stores(config: StorageConfig, metrics: SharedMetrics) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;
    let handles = storage.registry().list();
    if handles.is_empty() {
        println!("No stores configured");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:>12} {:>12}",
        "Store", "Reachable", "Total", "Available"
    );
    println!("{:-<57}", "");
    for handle in handles {
        println!(
            "{:<20} {:<10} {:>12} {:>12}",
            handle.id,
            if handle.reachable { "yes" } else { "no" },
            format_byte_size(handle.total_space),
            format_byte_size(handle.available_space)
        );
    }
    Ok(())
}

#[tokio::main]
pub async fn cache(config: StorageConfig, metrics: SharedMetrics) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;
    let entries = storage.cached_entries();
    if entries.is_empty() {
        println!("Cache is empty");
        return Ok(());
    }

    println!(
        "{:<40} {:>12} {:<6} {:<20} {:<20}",
        "Data id", "Size", "Dirty", "Last access", "Last upload"
    );
    println!("{:-<102}", "");
    for entry in entries {
        println!(
            "{:<40} {:>12} {:<6} {:<20} {:<20}",
            entry.data_id,
            format_byte_size(entry.size),
            if entry.dirty { "yes" } else { "no" },
            format_time(Some(entry.last_access_time)),
            format_time(entry.last_upload_time)
        );
    }
    Ok(())
}

#[tokio::main]
pub async fn space(config: StorageConfig, metrics: SharedMetrics) -> Result<()> {
    let storage = SecureCloudStorage::from_config(config, metrics).await?;
    let report = storage.space_report();

    println!("Local cache:");
    println!(
        "  Usage: {} of {}",
        format_byte_size(report.cache_usage),
        format_byte_size(report.cache_max_size)
    );
    println!(
        "  Entries: {} ({} dirty)",
        report.cache_entries, report.dirty_entries
    );
    println!("Cloud stores:");
    println!(
        "  Reachable: {} of {}",
        report.reachable_stores, report.stores
    );
    println!("  Total: {}", format_byte_size(report.remote_total));
    println!("  Available: {}", format_byte_size(report.remote_available));
    Ok(())
}

//! # Secure Cloud Storage Library
//!
//! Stores opaque byte objects across several untrusted cloud stores so that
//! no single store can read them and any `m` of them can disappear.
//!
//! ## Features
//!
//! - **Authenticated Encryption**: every generation of an object gets a fresh AES-256-GCM key
//! - **Erasure Coding**: ciphertext split into `k` data and `m` coding slices over GF(2^8)
//! - **Placement**: each slice of a generation lands on a distinct reachable store
//! - **Write-Back Cache**: writes are staged locally and committed by a background task
//! - **Single-Flight Fetch**: concurrent misses for the same object share one download
//! - **Pluggable Backends**: local directories and in-memory stores behind one trait
//!
//! ## Example
//!
//! ```no_run
//! use seccloud_storage::{SecureCloudStorage, SharedMetrics, StorageConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StorageConfig::load_from_file("seccloud.toml")?;
//! let storage = SecureCloudStorage::from_config(config, SharedMetrics::default()).await?;
//! let sync = storage.start_sync();
//!
//! let report = b"quarterly numbers";
//! storage.store_data("reports/q3", &report[..], report.len() as u64).await?;
//! storage.flush("reports/q3").await?;
//!
//! let mut out = Vec::new();
//! storage.load_data("reports/q3", &mut out).await?;
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cloud;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod erasure;
pub mod error;
pub mod metastore;
pub mod metrics;
pub mod placement;
pub mod storage;

pub use cache::{CacheSettings, ContentCache, ContentCacheEntry, SyncHandle};
pub use cloud::{
    build_store, build_stores, CloudStore, CloudStoreHandle, CloudStoreRegistry,
    LocalCloudStore, MemoryCloudStore,
};
pub use config::{format_byte_size, parse_byte_size, parse_duration, BackendConfig, StorageConfig};
pub use crypto::EncryptionService;
pub use engine::DistributedStore;
pub use erasure::{EncodedSlices, ErasureCodec};
pub use error::{ErrorKind, StorageError};
pub use metastore::{DataObject, Durability, MetaStore, SliceDescriptor, SliceKind};
pub use metrics::{MetricsCollector, NoOpMetrics, SharedMetrics};
pub use placement::SlicePlacementStrategy;
pub use storage::{SecureCloudStorage, SpaceReport};

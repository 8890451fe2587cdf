use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::cache::{CacheSettings, ContentCache, ContentCacheEntry, SyncHandle};
use crate::cloud::{build_stores, CloudStore, CloudStoreRegistry};
use crate::config::StorageConfig;
use crate::engine::DistributedStore;
use crate::erasure::ErasureCodec;
use crate::error::StorageError;
use crate::metastore::{DataObject, MetaStore};
use crate::metrics::SharedMetrics;

/// Local and remote capacity at a glance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceReport {
    pub cache_entries: usize,
    pub dirty_entries: usize,
    pub cache_usage: u64,
    pub cache_max_size: u64,
    pub stores: usize,
    pub reachable_stores: usize,
    pub remote_total: u64,
    pub remote_available: u64,
}

/// Secure, erasure coded storage over a set of untrusted cloud stores.
///
/// Writes are staged in the local [`ContentCache`] and committed remotely in
/// the background, or on [`flush`](Self::flush). Every committed generation
/// is encrypted with a fresh key and split into `k + m` slices on distinct
/// stores, so any `m` stores can be lost.
#[derive(Debug)]
pub struct SecureCloudStorage {
    config: StorageConfig,
    engine: Arc<DistributedStore>,
    cache: ContentCache,
}

impl SecureCloudStorage {
    /// Builds the configured backends, then opens the storage.
    pub async fn from_config(
        config: StorageConfig,
        metrics: SharedMetrics,
    ) -> Result<Self, StorageError> {
        let stores = build_stores(&config.backends).await?;
        Self::open(config, stores, metrics).await
    }

    /// Opens the storage over `stores`, with metadata persisted in
    /// `config.meta_dir`.
    pub async fn open(
        config: StorageConfig,
        stores: Vec<Arc<dyn CloudStore>>,
        metrics: SharedMetrics,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let meta = MetaStore::open(config.meta_dir.clone(), Some(config.durability))?;
        Self::open_with_meta(config, stores, meta, metrics).await
    }

    pub async fn open_with_meta(
        config: StorageConfig,
        stores: Vec<Arc<dyn CloudStore>>,
        meta: MetaStore,
        metrics: SharedMetrics,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let codec = ErasureCodec::new(config.k, config.m, config.alignment)?;
        let registry = Arc::new(CloudStoreRegistry::connect(stores, config.remote_timeout).await?);
        let engine = Arc::new(DistributedStore::new(
            codec,
            registry,
            meta,
            metrics.clone(),
            config.extra_reads,
        ));

        let discarded = engine.recover_pending().await?;
        if discarded > 0 {
            info!(discarded, "Cleaned up interrupted commits");
        }

        let cache = ContentCache::open(CacheSettings::from(&config), Arc::clone(&engine), metrics).await?;
        info!(k = config.k, m = config.m, "Secure cloud storage ready");
        Ok(Self {
            config,
            engine,
            cache,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<CloudStoreRegistry> {
        self.engine.registry()
    }

    pub fn meta(&self) -> &MetaStore {
        self.engine.meta()
    }

    /// Stages exactly `length` bytes from `input` under `data_id`. Returns
    /// once the data is durable locally; remote commit happens later.
    pub async fn store_data<R: AsyncRead + Unpin>(
        &self,
        data_id: &str,
        input: R,
        length: u64,
    ) -> Result<(), StorageError> {
        check_data_id(data_id)?;
        self.cache.write(data_id, input, length).await
    }

    /// Writes the content of `data_id` to `output`, fetching it from the
    /// cloud stores when not cached. Returns the number of bytes written.
    pub async fn load_data<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        data_id: &str,
        output: &mut W,
    ) -> Result<u64, StorageError> {
        check_data_id(data_id)?;
        let size = self.cache.read(data_id, output).await?;
        debug!(data_id, size, "Loaded data");
        Ok(size)
    }

    /// Removes the local copy and every remote slice, descriptor and key of
    /// `data_id`. Returns whether anything was stored under it.
    pub async fn delete_data(&self, data_id: &str) -> Result<bool, StorageError> {
        check_data_id(data_id)?;
        self.cache.delete(data_id).await
    }

    /// Blocks until `data_id` is committed remotely.
    pub async fn flush(&self, data_id: &str) -> Result<(), StorageError> {
        check_data_id(data_id)?;
        self.cache.flush(data_id).await
    }

    pub async fn flush_all(&self) -> Result<(), StorageError> {
        self.cache.flush_all().await
    }

    /// Drops the local copy of a clean entry. See [`ContentCache::evict`].
    pub async fn evict(&self, data_id: &str) -> Result<bool, StorageError> {
        self.cache.evict(data_id).await
    }

    pub fn start_sync(&self) -> SyncHandle {
        self.cache.start_sync()
    }

    /// Committed objects, in id order.
    pub fn list_objects(&self) -> Result<Vec<DataObject>, StorageError> {
        self.meta().list_data_objects()
    }

    pub fn cached_entries(&self) -> Vec<ContentCacheEntry> {
        self.cache.list()
    }

    pub fn space_report(&self) -> SpaceReport {
        let entries = self.cache.list();
        let registry = self.registry();
        SpaceReport {
            cache_entries: entries.len(),
            dirty_entries: entries.iter().filter(|e| e.dirty).count(),
            cache_usage: entries.iter().map(|e| e.size).sum(),
            cache_max_size: self.cache.settings().max_size,
            stores: registry.len(),
            reachable_stores: registry.reachable_count(),
            remote_total: registry.total_space(),
            remote_available: registry.available_space(),
        }
    }
}

fn check_data_id(data_id: &str) -> Result<(), StorageError> {
    if data_id.is_empty() {
        return Err(StorageError::Encoding("data id must not be empty".into()));
    }
    Ok(())
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::CloudStore;
use crate::error::StorageError;

/// Point-in-time view of one registered store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudStoreHandle {
    pub id: String,
    pub total_space: u64,
    pub available_space: u64,
    pub reachable: bool,
    /// Slices placed on this store since the registry was created.
    pub assignments: u64,
    pub bytes_uploaded: u64,
    pub last_upload: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct RegisteredStore {
    store: Arc<dyn CloudStore>,
    reachable: AtomicBool,
    total_space: AtomicU64,
    available_space: AtomicU64,
    assignments: AtomicU64,
    bytes_uploaded: AtomicU64,
    // millis since epoch, 0 when nothing was uploaded yet
    last_upload: AtomicI64,
}

impl RegisteredStore {
    fn handle(&self) -> CloudStoreHandle {
        let last_upload = match self.last_upload.load(Ordering::Acquire) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        };
        CloudStoreHandle {
            id: self.store.id().to_string(),
            total_space: self.total_space.load(Ordering::Acquire),
            available_space: self.available_space.load(Ordering::Acquire),
            reachable: self.reachable.load(Ordering::Acquire),
            assignments: self.assignments.load(Ordering::Acquire),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Acquire),
            last_upload,
        }
    }
}

/// The set of remote stores with their liveness and capacity.
///
/// Every remote call made through the registry is bounded by its timeout; a
/// store that fails an upload or a probe is marked unreachable until the next
/// successful [`refresh`](Self::refresh).
#[derive(Debug)]
pub struct CloudStoreRegistry {
    stores: Vec<RegisteredStore>,
    by_id: HashMap<String, usize>,
    timeout: Duration,
}

impl CloudStoreRegistry {
    /// Registers the stores. Capacities are unknown until the first refresh.
    pub fn new(stores: Vec<Arc<dyn CloudStore>>, timeout: Duration) -> Result<Self, StorageError> {
        let mut by_id = HashMap::new();
        let mut registered = Vec::with_capacity(stores.len());
        for store in stores {
            let id = store.id().to_string();
            if by_id.insert(id.clone(), registered.len()).is_some() {
                return Err(StorageError::Configuration(format!(
                    "Cloud store '{}' registered twice",
                    id
                )));
            }
            registered.push(RegisteredStore {
                store,
                reachable: AtomicBool::new(true),
                total_space: AtomicU64::new(0),
                available_space: AtomicU64::new(0),
                assignments: AtomicU64::new(0),
                bytes_uploaded: AtomicU64::new(0),
                last_upload: AtomicI64::new(0),
            });
        }
        Ok(Self {
            stores: registered,
            by_id,
            timeout,
        })
    }

    /// Registers the stores and probes them once.
    pub async fn connect(
        stores: Vec<Arc<dyn CloudStore>>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let registry = Self::new(stores, timeout)?;
        let reachable = registry.refresh().await;
        info!(
            reachable,
            registered = registry.stores.len(),
            "Cloud store registry ready"
        );
        Ok(registry)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// All stores in registration order.
    pub fn list(&self) -> Vec<CloudStoreHandle> {
        self.stores.iter().map(RegisteredStore::handle).collect()
    }

    pub fn find(&self, id: &str) -> Option<CloudStoreHandle> {
        self.entry(id).map(RegisteredStore::handle)
    }

    pub fn store(&self, id: &str) -> Option<Arc<dyn CloudStore>> {
        self.entry(id).map(|e| Arc::clone(&e.store))
    }

    pub fn is_reachable(&self, id: &str) -> bool {
        self.entry(id)
            .map(|e| e.reachable.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn reachable_count(&self) -> usize {
        self.stores
            .iter()
            .filter(|e| e.reachable.load(Ordering::Acquire))
            .count()
    }

    /// Sum of the capacity of the reachable stores.
    pub fn total_space(&self) -> u64 {
        self.reachable_sum(|e| e.total_space.load(Ordering::Acquire))
    }

    pub fn available_space(&self) -> u64 {
        self.reachable_sum(|e| e.available_space.load(Ordering::Acquire))
    }

    pub fn mark_unreachable(&self, id: &str, reason: &str) {
        if let Some(entry) = self.entry(id) {
            if entry.reachable.swap(false, Ordering::AcqRel) {
                warn!(store_id = id, reason, "Cloud store marked unreachable");
            }
        }
    }

    pub fn mark_reachable(&self, id: &str) {
        if let Some(entry) = self.entry(id) {
            if !entry.reachable.swap(true, Ordering::AcqRel) {
                info!(store_id = id, "Cloud store reachable again");
            }
        }
    }

    pub(crate) fn record_assignment(&self, id: &str) {
        if let Some(entry) = self.entry(id) {
            entry.assignments.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Probes every store's capacity, updating reachability. Returns the
    /// number of reachable stores.
    pub async fn refresh(&self) -> usize {
        let probes = self.stores.iter().map(|entry| async move {
            let probe = async {
                let total = entry.store.total_space().await?;
                let available = entry.store.available_space().await?;
                Ok::<_, StorageError>((total, available))
            };
            (entry, self.bounded(entry.store.id(), probe).await)
        });

        let mut reachable = 0;
        for (entry, result) in join_all(probes).await {
            match result {
                Ok((total, available)) => {
                    entry.total_space.store(total, Ordering::Release);
                    entry.available_space.store(available, Ordering::Release);
                    self.mark_reachable(entry.store.id());
                    reachable += 1;
                }
                Err(e) => self.mark_unreachable(entry.store.id(), &e.to_string()),
            }
        }
        debug!(reachable, "Refreshed cloud stores");
        reachable
    }

    /// Uploads with the registry timeout, keeping the usage bookkeeping. A
    /// failed upload makes the store unreachable.
    pub async fn upload(
        &self,
        store_id: &str,
        object_id: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let entry = self.entry_or_unavailable(store_id)?;
        let size = data.len() as u64;
        match self.bounded(store_id, entry.store.upload(object_id, data)).await {
            Ok(()) => {
                entry.bytes_uploaded.fetch_add(size, Ordering::AcqRel);
                entry
                    .last_upload
                    .store(Utc::now().timestamp_millis(), Ordering::Release);
                let _ = entry.available_space.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |a| Some(a.saturating_sub(size)),
                );
                Ok(())
            }
            Err(e) => {
                if e.is_retryable() {
                    self.mark_unreachable(store_id, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Downloads with the registry timeout. Failures do not change reachability:
    /// readers simply fall back to another slice.
    pub async fn download(&self, store_id: &str, object_id: &str) -> Result<Bytes, StorageError> {
        let entry = self.entry_or_unavailable(store_id)?;
        self.bounded(store_id, entry.store.download(object_id)).await
    }

    /// Deletes with the registry timeout. Only the bytes the store actually
    /// freed are credited back to its available space.
    pub async fn delete(&self, store_id: &str, object_id: &str) -> Result<(), StorageError> {
        let entry = self.entry_or_unavailable(store_id)?;
        let freed = self.bounded(store_id, entry.store.delete(object_id)).await?;
        if freed == 0 {
            return Ok(());
        }
        let total = entry.total_space.load(Ordering::Acquire);
        let _ = entry
            .available_space
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |a| {
                Some(a.saturating_add(freed).min(total))
            });
        Ok(())
    }

    async fn bounded<T>(
        &self,
        store_id: &str,
        op: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::store_unavailable(
                store_id,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }

    fn entry(&self, id: &str) -> Option<&RegisteredStore> {
        self.by_id.get(id).map(|&i| &self.stores[i])
    }

    fn entry_or_unavailable(&self, id: &str) -> Result<&RegisteredStore, StorageError> {
        self.entry(id)
            .ok_or_else(|| StorageError::store_unavailable(id, "not registered"))
    }

    fn reachable_sum(&self, f: impl Fn(&RegisteredStore) -> u64) -> u64 {
        self.stores
            .iter()
            .filter(|e| e.reachable.load(Ordering::Acquire))
            .map(f)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloudStore;

    fn memory_stores(n: usize) -> Vec<Arc<MemoryCloudStore>> {
        (0..n)
            .map(|i| Arc::new(MemoryCloudStore::new(format!("s{}", i), 1000)))
            .collect()
    }

    fn as_dyn(stores: &[Arc<MemoryCloudStore>]) -> Vec<Arc<dyn CloudStore>> {
        stores
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn CloudStore>)
            .collect()
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let a: Arc<dyn CloudStore> = Arc::new(MemoryCloudStore::new("dup", 10));
        let b: Arc<dyn CloudStore> = Arc::new(MemoryCloudStore::new("dup", 10));
        assert!(matches!(
            CloudStoreRegistry::new(vec![a, b], Duration::from_secs(1)),
            Err(StorageError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_tracks_reachability_and_space() {
        let stores = memory_stores(3);
        stores[1].set_offline(true);
        let registry = CloudStoreRegistry::connect(as_dyn(&stores), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(registry.reachable_count(), 2);
        assert!(!registry.is_reachable("s1"));
        assert_eq!(registry.total_space(), 2000);

        stores[1].set_offline(false);
        assert_eq!(registry.refresh().await, 3);
        assert_eq!(registry.find("s1").unwrap().available_space, 1000);
        assert_eq!(registry.available_space(), 3000);
    }

    #[tokio::test]
    async fn test_upload_bookkeeping() {
        let stores = memory_stores(2);
        let registry = CloudStoreRegistry::connect(as_dyn(&stores), Duration::from_secs(1))
            .await
            .unwrap();

        registry.upload("s0", "obj", Bytes::from(vec![0u8; 100])).await.unwrap();
        let handle = registry.find("s0").unwrap();
        assert_eq!(handle.bytes_uploaded, 100);
        assert_eq!(handle.available_space, 900);
        assert!(handle.last_upload.is_some());

        // a slice that never made it frees nothing
        registry.delete("s0", "never-uploaded").await.unwrap();
        assert_eq!(registry.find("s0").unwrap().available_space, 900);

        registry.delete("s0", "obj").await.unwrap();
        assert_eq!(registry.find("s0").unwrap().available_space, 1000);

        stores[1].set_offline(true);
        assert!(registry.upload("s1", "obj", Bytes::from_static(b"x")).await.is_err());
        assert!(!registry.is_reachable("s1"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unavailable() {
        let stores = memory_stores(1);
        stores[0].set_latency(Duration::from_millis(200));
        let registry = CloudStoreRegistry::new(as_dyn(&stores), Duration::from_millis(20)).unwrap();

        let err = registry.download("s0", "obj").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(registry.refresh().await, 0);
    }
}

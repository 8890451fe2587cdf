use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{check_object_id, CloudStore};
use crate::error::StorageError;

/// Capacity-bounded store kept in memory, with knobs to simulate outages,
/// slow links and bit rot.
#[derive(Debug)]
pub struct MemoryCloudStore {
    id: String,
    capacity: u64,
    objects: Mutex<HashMap<String, Bytes>>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryCloudStore {
    pub fn new(id: impl Into<String>, capacity: u64) -> Self {
        Self {
            id: id.into(),
            capacity,
            objects: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// While offline every operation fails as unavailable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Delay added before every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Flips one bit of the stored object. Returns false if there is no such object.
    pub fn corrupt(&self, object_id: &str) -> bool {
        let mut objects = self.lock_objects();
        match objects.get_mut(object_id) {
            Some(data) if !data.is_empty() => {
                let mut raw = data.to_vec();
                raw[0] ^= 0x01;
                *data = Bytes::from(raw);
                true
            }
            _ => false,
        }
    }

    pub fn object_ids(&self) -> Vec<String> {
        self.lock_objects().keys().cloned().collect()
    }

    pub fn used_space(&self) -> u64 {
        self.lock_objects().values().map(|d| d.len() as u64).sum()
    }

    /// Number of upload calls received, including failed ones.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Acquire)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::Acquire)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::Acquire)
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate(&self) -> Result<(), StorageError> {
        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_offline() {
            return Err(StorageError::store_unavailable(&self.id, "store is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudStore for MemoryCloudStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, object_id: &str, data: Bytes) -> Result<(), StorageError> {
        self.uploads.fetch_add(1, Ordering::AcqRel);
        check_object_id(&self.id, object_id)?;
        self.simulate().await?;

        let mut objects = self.lock_objects();
        let used: u64 = objects
            .iter()
            .filter(|(id, _)| id.as_str() != object_id)
            .map(|(_, d)| d.len() as u64)
            .sum();
        if used + data.len() as u64 > self.capacity {
            return Err(StorageError::store_unavailable(
                &self.id,
                format!("capacity {} exceeded", self.capacity),
            ));
        }
        objects.insert(object_id.to_string(), data);
        Ok(())
    }

    async fn download(&self, object_id: &str) -> Result<Bytes, StorageError> {
        self.downloads.fetch_add(1, Ordering::AcqRel);
        self.simulate().await?;
        self.lock_objects().get(object_id).cloned().ok_or_else(|| {
            StorageError::NotFound(format!("object '{}' in store '{}'", object_id, self.id))
        })
    }

    async fn delete(&self, object_id: &str) -> Result<u64, StorageError> {
        self.deletes.fetch_add(1, Ordering::AcqRel);
        self.simulate().await?;
        Ok(self
            .lock_objects()
            .remove(object_id)
            .map_or(0, |data| data.len() as u64))
    }

    async fn total_space(&self) -> Result<u64, StorageError> {
        self.simulate().await?;
        Ok(self.capacity)
    }

    async fn available_space(&self) -> Result<u64, StorageError> {
        self.simulate().await?;
        Ok(self.capacity.saturating_sub(self.used_space()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_store_fails_transiently() {
        let store = MemoryCloudStore::new("ram", 100);
        store.upload("a", Bytes::from_static(b"abc")).await.unwrap();

        store.set_offline(true);
        let err = store.download("a").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.available_space().await.is_err());

        store.set_offline(false);
        assert_eq!(store.download("a").await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(store.download_count(), 2);
    }

    #[tokio::test]
    async fn test_capacity_and_corruption() {
        let store = MemoryCloudStore::new("ram", 4);
        store.upload("a", Bytes::from_static(b"abc")).await.unwrap();
        assert!(store.upload("b", Bytes::from_static(b"de")).await.is_err());
        // replacing an object only counts its new size
        store.upload("a", Bytes::from_static(b"abcd")).await.unwrap();

        assert!(store.corrupt("a"));
        assert!(!store.corrupt("missing"));
        assert_ne!(store.download("a").await.unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(store.upload_count(), 3);
    }
}

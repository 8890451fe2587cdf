//! Remote object stores holding the slices.
//!
//! Every provider adapter implements [`CloudStore`]; the engine never sees
//! anything else. [`CloudStoreRegistry`] tracks which stores are reachable and
//! how full they are.

mod local;
mod memory;
mod registry;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use local::LocalCloudStore;
pub use memory::MemoryCloudStore;
pub use registry::{CloudStoreHandle, CloudStoreRegistry};

use crate::config::BackendConfig;
use crate::error::StorageError;

/// Capability every remote backend provides. Provider specific retries and
/// authentication happen behind it.
#[async_trait]
pub trait CloudStore: Send + Sync + Debug {
    fn id(&self) -> &str;

    /// Stores `data` under `object_id`, replacing any previous content.
    async fn upload(&self, object_id: &str, data: Bytes) -> Result<(), StorageError>;

    async fn download(&self, object_id: &str) -> Result<Bytes, StorageError>;

    /// Returns the bytes freed. Deleting an object that does not exist
    /// succeeds and frees nothing.
    async fn delete(&self, object_id: &str) -> Result<u64, StorageError>;

    async fn total_space(&self) -> Result<u64, StorageError>;

    async fn available_space(&self) -> Result<u64, StorageError>;
}

/// Builds the store described by a backend entry.
pub async fn build_store(config: &BackendConfig) -> Result<Arc<dyn CloudStore>, StorageError> {
    let store: Arc<dyn CloudStore> = match config {
        BackendConfig::Local { id, root, max_size } => {
            Arc::new(LocalCloudStore::open(id.clone(), root.clone(), *max_size).await?)
        }
        BackendConfig::Memory { id, capacity } => {
            Arc::new(MemoryCloudStore::new(id.clone(), *capacity))
        }
    };
    Ok(store)
}

pub async fn build_stores(
    configs: &[BackendConfig],
) -> Result<Vec<Arc<dyn CloudStore>>, StorageError> {
    let mut stores = Vec::with_capacity(configs.len());
    for config in configs {
        stores.push(build_store(config).await?);
    }
    Ok(stores)
}

/// Object ids end up as file names on some backends.
pub(crate) fn check_object_id(store_id: &str, object_id: &str) -> Result<(), StorageError> {
    let valid = !object_id.is_empty()
        && object_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Encoding(format!(
            "Invalid object id '{}' for store '{}'",
            object_id, store_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_memory_store() {
        let store = build_store(&BackendConfig::Memory {
            id: "ram".into(),
            capacity: 4096,
        })
        .await
        .unwrap();
        assert_eq!(store.id(), "ram");
        assert_eq!(store.total_space().await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_build_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let stores = build_stores(&[BackendConfig::Local {
            id: "disk".into(),
            root: dir.path().join("slices"),
            max_size: 1 << 20,
        }])
        .await
        .unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].available_space().await.unwrap(), 1 << 20);
    }

    #[test]
    fn test_object_id_rejects_paths() {
        assert!(check_object_id("s", "0b6c1c1e-5b8f-4b0e-9a55-1f2d3c4b5a69").is_ok());
        assert!(check_object_id("s", "../etc/passwd").is_err());
        assert!(check_object_id("s", "").is_err());
    }
}

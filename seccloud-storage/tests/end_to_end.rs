use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tempfile::TempDir;

use seccloud_storage::{
    CloudStore, MemoryCloudStore, SecureCloudStorage, SharedMetrics, StorageConfig, StorageError,
};

fn random(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn memory_stores(n: usize, capacity: u64) -> Vec<Arc<MemoryCloudStore>> {
    (0..n)
        .map(|i| Arc::new(MemoryCloudStore::new(format!("cloud{}", i), capacity)))
        .collect()
}

fn as_dyn(stores: &[Arc<MemoryCloudStore>]) -> Vec<Arc<dyn CloudStore>> {
    stores
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn CloudStore>)
        .collect()
}

fn config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        k: 4,
        m: 2,
        cache_dir: dir.path().join("cache"),
        meta_dir: dir.path().join("meta"),
        cache_max_size: 64 << 20,
        sync_interval: Duration::from_millis(50),
        sync_quiet_period: Duration::from_millis(10),
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(100),
        ..StorageConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_survives_loss_of_m_stores() {
    let dir = tempfile::tempdir().unwrap();
    let stores = memory_stores(6, 64 << 20);
    let storage = SecureCloudStorage::open(config(&dir), as_dyn(&stores), SharedMetrics::default())
        .await
        .unwrap();

    let payload = random(10 << 20);
    storage
        .store_data("big", payload.as_slice(), payload.len() as u64)
        .await
        .unwrap();
    storage.flush("big").await.unwrap();
    assert!(storage.evict("big").await.unwrap());

    // every store holds exactly one slice, none of it plaintext
    for store in &stores {
        assert_eq!(store.object_ids().len(), 1);
    }

    stores[1].set_offline(true);
    stores[4].set_offline(true);

    let mut out = Vec::new();
    let read = storage.load_data("big", &mut out).await.unwrap();
    assert_eq!(read, payload.len() as u64);
    assert!(out == payload);
}

#[tokio::test]
async fn test_loss_of_more_than_m_stores_fails() {
    let dir = tempfile::tempdir().unwrap();
    let stores = memory_stores(6, 64 << 20);
    let storage = SecureCloudStorage::open(config(&dir), as_dyn(&stores), SharedMetrics::default())
        .await
        .unwrap();

    storage.store_data("doc", &random(4_000)[..], 4_000).await.unwrap();
    storage.flush("doc").await.unwrap();
    storage.evict("doc").await.unwrap();
    for store in &stores[..3] {
        store.set_offline(true);
    }

    let mut out = Vec::new();
    let err = storage.load_data("doc", &mut out).await.unwrap_err();
    assert!(matches!(err, StorageError::Decoding(_)));
    assert!(storage.cached_entries().is_empty());
}

#[tokio::test]
async fn test_corrupted_slices_are_routed_around() {
    let dir = tempfile::tempdir().unwrap();
    let stores = memory_stores(6, 64 << 20);
    let storage = SecureCloudStorage::open(config(&dir), as_dyn(&stores), SharedMetrics::default())
        .await
        .unwrap();

    let payload = random(100_000);
    storage.store_data("doc", &payload[..], 100_000).await.unwrap();
    storage.flush("doc").await.unwrap();
    storage.evict("doc").await.unwrap();
    for store in &stores[..2] {
        for id in store.object_ids() {
            assert!(store.corrupt(&id));
        }
    }

    let mut out = Vec::new();
    storage.load_data("doc", &mut out).await.unwrap();
    assert_eq!(out, payload);
}

#[tokio::test]
async fn test_overwrite_replaces_previous_generation() {
    let dir = tempfile::tempdir().unwrap();
    let stores = memory_stores(6, 64 << 20);
    let storage = SecureCloudStorage::open(config(&dir), as_dyn(&stores), SharedMetrics::default())
        .await
        .unwrap();

    storage.store_data("doc", &random(5_000)[..], 5_000).await.unwrap();
    storage.flush("doc").await.unwrap();
    let second = random(7_000);
    storage.store_data("doc", &second[..], 7_000).await.unwrap();
    storage.flush("doc").await.unwrap();

    let objects = storage.list_objects().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].generation, 2);
    assert_eq!(objects[0].size, 7_000);
    // the first generation's slices were removed
    let slices: usize = stores.iter().map(|s| s.object_ids().len()).sum();
    assert_eq!(slices, 6);

    storage.evict("doc").await.unwrap();
    let mut out = Vec::new();
    storage.load_data("doc", &mut out).await.unwrap();
    assert_eq!(out, second);
}

#[tokio::test]
async fn test_background_sync_commits_without_flush() {
    let dir = tempfile::tempdir().unwrap();
    let stores = memory_stores(6, 64 << 20);
    let storage = SecureCloudStorage::open(config(&dir), as_dyn(&stores), SharedMetrics::default())
        .await
        .unwrap();
    let sync = storage.start_sync();

    storage.store_data("doc", &random(2_000)[..], 2_000).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while storage.cache().is_dirty("doc") && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    sync.shutdown().await;

    assert!(!storage.cache().is_dirty("doc"));
    assert_eq!(storage.list_objects().unwrap().len(), 1);
}

#[tokio::test]
async fn test_local_backends_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display();
    let toml_content = format!(
        r#"
k = 2
m = 1
cache_dir = '{root}/cache'
meta_dir = '{root}/meta'
cache_max_size = "1MB"
sync_quiet_period = "0ms"

[[backends]]
type = "local"
id = "disk-a"
root = '{root}/a'
max_size = "4MB"

[[backends]]
type = "local"
id = "disk-b"
root = '{root}/b'
max_size = "4MB"

[[backends]]
type = "local"
id = "disk-c"
root = '{root}/c'
max_size = "4MB"
"#
    );
    let config = StorageConfig::from_toml(&toml_content).unwrap();
    let storage = SecureCloudStorage::from_config(config, SharedMetrics::default())
        .await
        .unwrap();

    let payload = random(300_000);
    storage.store_data("doc", &payload[..], 300_000).await.unwrap();
    storage.flush("doc").await.unwrap();
    storage.evict("doc").await.unwrap();

    let mut out = Vec::new();
    storage.load_data("doc", &mut out).await.unwrap();
    assert_eq!(out, payload);

    assert!(storage.delete_data("doc").await.unwrap());
    for name in ["a", "b", "c"] {
        let leftover = std::fs::read_dir(dir.path().join(name)).unwrap().count();
        assert_eq!(leftover, 0);
    }
    let mut out = Vec::new();
    assert!(matches!(
        storage.load_data("doc", &mut out).await,
        Err(StorageError::NotFound(_))
    ));
}

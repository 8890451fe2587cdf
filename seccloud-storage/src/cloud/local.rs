use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{check_object_id, CloudStore};
use crate::error::StorageError;

const TMP_SUFFIX: &str = ".part";

/// Stores slices as files in a local directory, never growing past `max_size`.
#[derive(Debug)]
pub struct LocalCloudStore {
    id: String,
    root: PathBuf,
    max_size: u64,
    current_size: AtomicU64,
}

impl LocalCloudStore {
    /// Opens (creating if needed) the store directory and sums the size of the
    /// slices already in it. Leftover partial files are removed.
    pub async fn open(id: String, root: PathBuf, max_size: u64) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;

        let mut current_size = 0;
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                fs::remove_file(&path).await?;
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                current_size += meta.len();
            }
        }
        debug!(store_id = %id, current_size, max_size, "Opened local cloud store");

        Ok(Self {
            id,
            root,
            max_size,
            current_size: AtomicU64::new(current_size),
        })
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    fn path(&self, object_id: &str) -> Result<PathBuf, StorageError> {
        check_object_id(&self.id, object_id)?;
        Ok(self.root.join(object_id))
    }

    // Claims `size` bytes of the quota, or fails if they do not fit.
    fn reserve(&self, size: u64) -> Result<(), StorageError> {
        self.current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|total| *total <= self.max_size)
            })
            .map(|_| ())
            .map_err(|current| {
                StorageError::store_unavailable(
                    &self.id,
                    format!(
                        "max size {} reached (current size {}, upload of {} bytes)",
                        self.max_size, current, size
                    ),
                )
            })
    }

    fn release(&self, size: u64) {
        let _ = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }

    fn io_error(&self, e: std::io::Error) -> StorageError {
        StorageError::store_unavailable(&self.id, e)
    }
}

#[async_trait]
impl CloudStore for LocalCloudStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, object_id: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.path(object_id)?;
        let previous = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let size = data.len() as u64;
        self.reserve(size)?;

        let tmp_path = self.root.join(format!("{}{}", object_id, TMP_SUFFIX));
        let written = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_data().await?;
            fs::rename(&tmp_path, &path).await
        }
        .await;

        match written {
            Ok(()) => {
                self.release(previous);
                debug!(store_id = %self.id, object_id, size, "Stored slice");
                Ok(())
            }
            Err(e) => {
                self.release(size);
                let _ = fs::remove_file(&tmp_path).await;
                Err(self.io_error(e))
            }
        }
    }

    async fn download(&self, object_id: &str) -> Result<Bytes, StorageError> {
        let path = self.path(object_id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(
                format!("object '{}' in store '{}'", object_id, self.id),
            )),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn delete(&self, object_id: &str) -> Result<u64, StorageError> {
        let path = self.path(object_id)?;
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.io_error(e)),
        };
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.release(size);
                Ok(size)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn total_space(&self) -> Result<u64, StorageError> {
        Ok(self.max_size)
    }

    async fn available_space(&self) -> Result<u64, StorageError> {
        Ok(self.max_size.saturating_sub(self.current_size()))
    }
}

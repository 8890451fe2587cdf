use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::debug;

use super::traits::{BaseMetaTree, Durability, MetaOp, Store};
use crate::error::StorageError;

/// [`Store`] backed by a fjall keyspace, one partition per tree.
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: RwLock<HashMap<String, PartitionHandle>>,
    persist_mode: Option<PersistMode>,
}

impl fmt::Debug for FjallStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FjallStore")
            .field("persist_mode", &self.persist_mode)
            .finish()
    }
}

impl FjallStore {
    pub fn new(path: PathBuf, durability: Option<Durability>) -> Result<Self, StorageError> {
        debug!("Opening fjall metadata store at {}", path.display());
        let keyspace = Config::new(path).open()?;
        let persist_mode = durability.and_then(|d| match d {
            Durability::Buffer => None,
            Durability::Fsync => Some(PersistMode::SyncAll),
            Durability::Fdatasync => Some(PersistMode::SyncData),
        });
        Ok(Self {
            keyspace,
            partitions: RwLock::new(HashMap::new()),
            persist_mode,
        })
    }

    fn partition(&self, name: &str) -> Result<PartitionHandle, StorageError> {
        if let Some(p) = self
            .partitions
            .read()
            .map_err(|_| StorageError::Metadata("partition map lock poisoned".into()))?
            .get(name)
        {
            return Ok(p.clone());
        }
        let mut partitions = self
            .partitions
            .write()
            .map_err(|_| StorageError::Metadata("partition map lock poisoned".into()))?;
        if let Some(p) = partitions.get(name) {
            return Ok(p.clone());
        }
        let handle = self
            .keyspace
            .open_partition(name, PartitionCreateOptions::default())?;
        partitions.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    fn persist(&self) -> Result<(), StorageError> {
        if let Some(mode) = self.persist_mode {
            self.keyspace.persist(mode)?;
        }
        Ok(())
    }
}

impl Store for FjallStore {
    fn tree_open(&self, name: &str) -> Result<Arc<dyn BaseMetaTree>, StorageError> {
        let partition = self.partition(name)?;
        Ok(Arc::new(FjallTree {
            partition,
            keyspace: self.keyspace.clone(),
            persist_mode: self.persist_mode,
        }))
    }

    fn apply(&self, ops: Vec<MetaOp>) -> Result<(), StorageError> {
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                MetaOp::Insert { tree, key, value } => {
                    let partition = self.partition(tree)?;
                    batch.insert(&partition, key, value);
                }
                MetaOp::Remove { tree, key } => {
                    let partition = self.partition(tree)?;
                    batch.remove(&partition, key);
                }
            }
        }
        batch.commit()?;
        self.persist()
    }

    fn num_keys(&self, name: &str) -> Result<usize, StorageError> {
        Ok(self.partition(name)?.len()?)
    }

    fn disk_space(&self) -> u64 {
        self.keyspace.disk_space()
    }
}

struct FjallTree {
    partition: PartitionHandle,
    keyspace: Keyspace,
    persist_mode: Option<PersistMode>,
}

impl FjallTree {
    fn persist(&self) -> Result<(), StorageError> {
        if let Some(mode) = self.persist_mode {
            self.keyspace.persist(mode)?;
        }
        Ok(())
    }
}

impl BaseMetaTree for FjallTree {
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.partition.insert(key, value)?;
        self.persist()
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.partition.remove(key)?;
        self.persist()
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.partition.contains_key(key)?)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.partition.get(key)?.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.partition
            .prefix(prefix)
            .map(|item| {
                let (k, v) = item?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }
}

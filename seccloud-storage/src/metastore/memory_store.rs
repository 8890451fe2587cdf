use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::traits::{BaseMetaTree, MetaOp, Store};
use crate::error::StorageError;

type Tree = Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// Volatile [`Store`], for tests and throwaway instances.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trees: Mutex<HashMap<String, Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self, name: &str) -> Result<Tree, StorageError> {
        let mut trees = self
            .trees
            .lock()
            .map_err(|_| StorageError::Metadata("tree map lock poisoned".into()))?;
        Ok(trees.entry(name.to_string()).or_default().clone())
    }
}

fn poisoned() -> StorageError {
    StorageError::Metadata("tree lock poisoned".into())
}

impl Store for MemoryStore {
    fn tree_open(&self, name: &str) -> Result<Arc<dyn BaseMetaTree>, StorageError> {
        Ok(Arc::new(MemoryTree(self.tree(name)?)))
    }

    fn apply(&self, ops: Vec<MetaOp>) -> Result<(), StorageError> {
        // Hold the tree map for the whole batch so no reader sees half of it.
        let mut trees = self
            .trees
            .lock()
            .map_err(|_| StorageError::Metadata("tree map lock poisoned".into()))?;
        for op in ops {
            match op {
                MetaOp::Insert { tree, key, value } => {
                    let t = trees.entry(tree.to_string()).or_default();
                    t.lock().map_err(|_| poisoned())?.insert(key, value);
                }
                MetaOp::Remove { tree, key } => {
                    let t = trees.entry(tree.to_string()).or_default();
                    t.lock().map_err(|_| poisoned())?.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn num_keys(&self, name: &str) -> Result<usize, StorageError> {
        let tree = self.tree(name)?;
        let len = tree.lock().map_err(|_| poisoned())?.len();
        Ok(len)
    }

    fn disk_space(&self) -> u64 {
        0
    }
}

struct MemoryTree(Tree);

impl BaseMetaTree for MemoryTree {
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.0.lock().map_err(|_| poisoned())?.insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.0.lock().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.0.lock().map_err(|_| poisoned())?.contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.0.lock().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let tree = self.0.lock().map_err(|_| poisoned())?;
        Ok(tree
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

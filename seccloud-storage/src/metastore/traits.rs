use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::StorageError;

/// Store is the interface over the persistence technology holding the engine's metadata.
///
/// It hands out named trees and applies batches of writes atomically.
/// Implementations should ensure thread safety and proper error handling.
pub trait Store: Send + Sync + Debug + 'static {
    /// Returns the tree with the given name, creating it if needed.
    fn tree_open(&self, name: &str) -> Result<Arc<dyn BaseMetaTree>, StorageError>;

    /// Applies all operations or none of them.
    fn apply(&self, ops: Vec<MetaOp>) -> Result<(), StorageError>;

    /// Returns the number of keys in the named tree.
    fn num_keys(&self, name: &str) -> Result<usize, StorageError>;

    /// Returns the disk space used by the store.
    fn disk_space(&self) -> u64;
}

/// BaseMetaTree provides basic tree operations for metadata storage.
pub trait BaseMetaTree: Send + Sync {
    /// Inserts a key-value pair into the tree.
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    /// Removes a key from the tree.
    fn remove(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Checks if the tree contains the given key.
    fn contains_key(&self, key: &[u8]) -> Result<bool, StorageError>;

    /// Gets the value associated with the given key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// One write in a batch passed to [`Store::apply`].
#[derive(Debug, Clone)]
pub enum MetaOp {
    Insert {
        tree: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        tree: &'static str,
        key: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Buffer,
    Fsync,
    Fdatasync,
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Fdatasync
    }
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" => Ok(Durability::Buffer),
            "fsync" => Ok(Durability::Fsync),
            "fdatasync" => Ok(Durability::Fdatasync),
            _ => Err(format!("Unknown durability option: {}", s)),
        }
    }
}

mod fjall_store;
mod memory_store;
mod records;
mod traits;

use std::path::PathBuf;
use std::sync::Arc;

pub use fjall_store::FjallStore;
pub use memory_store::MemoryStore;
pub use records::{
    CacheRecord, DataObject, EncryptionKey, GenerationRecord, SliceDescriptor, SliceKind,
};
pub use traits::{BaseMetaTree, Durability, MetaOp, Store};

use records::{from_slice, to_vec};

use crate::error::StorageError;

const OBJECTS_TREE: &str = "_OBJECTS";
const GENERATIONS_TREE: &str = "_GENERATIONS";
const KEYS_TREE: &str = "_KEYS";
const CACHE_TREE: &str = "_CACHE";

/// Typed repositories over a [`Store`]: data objects, per-generation slice
/// descriptors and keys, and persisted cache entries.
#[derive(Debug, Clone)]
pub struct MetaStore {
    store: Arc<dyn Store>,
}

impl MetaStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Opens the fjall-backed store under `path`.
    pub fn open(path: PathBuf, durability: Option<Durability>) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(FjallStore::new(path, durability)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn get_underlying_store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    // data objects

    pub fn find_data_object(&self, data_id: &str) -> Result<Option<DataObject>, StorageError> {
        let tree = self.store.tree_open(OBJECTS_TREE)?;
        match tree.get(data_id.as_bytes())? {
            Some(raw) => Ok(Some(from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn list_data_objects(&self) -> Result<Vec<DataObject>, StorageError> {
        let tree = self.store.tree_open(OBJECTS_TREE)?;
        tree.scan_prefix(&[])?
            .into_iter()
            .map(|(_, raw)| from_slice(&raw))
            .collect()
    }

    pub fn delete_data_object(&self, data_id: &str) -> Result<(), StorageError> {
        self.store.tree_open(OBJECTS_TREE)?.remove(data_id.as_bytes())
    }

    // generations

    pub fn find_generation(
        &self,
        data_id: &str,
        generation: u64,
    ) -> Result<Option<GenerationRecord>, StorageError> {
        let tree = self.store.tree_open(GENERATIONS_TREE)?;
        match tree.get(&generation_key(data_id, generation))? {
            Some(raw) => Ok(Some(from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every generation recorded for `data_id`, oldest first.
    pub fn generations(&self, data_id: &str) -> Result<Vec<GenerationRecord>, StorageError> {
        let tree = self.store.tree_open(GENERATIONS_TREE)?;
        tree.scan_prefix(&id_prefix(data_id))?
            .into_iter()
            .map(|(_, raw)| from_slice(&raw))
            .collect()
    }

    /// Generations that were recorded but never committed, across all data ids.
    pub fn pending_generations(&self) -> Result<Vec<GenerationRecord>, StorageError> {
        let tree = self.store.tree_open(GENERATIONS_TREE)?;
        let mut pending = Vec::new();
        for (_, raw) in tree.scan_prefix(&[])? {
            let record: GenerationRecord = from_slice(&raw)?;
            if !record.committed {
                pending.push(record);
            }
        }
        Ok(pending)
    }

    /// Records a new generation's slice placement and key, before any upload starts.
    pub fn insert_pending_generation(
        &self,
        record: &GenerationRecord,
        key: &EncryptionKey,
    ) -> Result<(), StorageError> {
        debug_assert!(!record.committed);
        let gen_key = generation_key(&record.data_id, record.generation);
        self.store.apply(vec![
            MetaOp::Insert {
                tree: GENERATIONS_TREE,
                key: gen_key.clone(),
                value: to_vec(record)?,
            },
            MetaOp::Insert {
                tree: KEYS_TREE,
                key: gen_key,
                value: to_vec(key)?,
            },
        ])
    }

    /// Flags the generation committed and points the data object at it, atomically.
    pub fn commit_generation(&self, object: &DataObject) -> Result<(), StorageError> {
        let mut record = self
            .find_generation(&object.data_id, object.generation)?
            .ok_or_else(|| {
                StorageError::Metadata(format!(
                    "No slice descriptors for data '{}' generation {}",
                    object.data_id, object.generation
                ))
            })?;
        record.committed = true;
        self.store.apply(vec![
            MetaOp::Insert {
                tree: GENERATIONS_TREE,
                key: generation_key(&object.data_id, object.generation),
                value: to_vec(&record)?,
            },
            MetaOp::Insert {
                tree: OBJECTS_TREE,
                key: object.data_id.as_bytes().to_vec(),
                value: to_vec(object)?,
            },
        ])
    }

    /// Drops a generation's descriptors together with its key.
    pub fn remove_generation(&self, data_id: &str, generation: u64) -> Result<(), StorageError> {
        let gen_key = generation_key(data_id, generation);
        self.store.apply(vec![
            MetaOp::Remove {
                tree: GENERATIONS_TREE,
                key: gen_key.clone(),
            },
            MetaOp::Remove {
                tree: KEYS_TREE,
                key: gen_key,
            },
        ])
    }

    // keys

    pub fn find_key(
        &self,
        data_id: &str,
        generation: u64,
    ) -> Result<Option<EncryptionKey>, StorageError> {
        let tree = self.store.tree_open(KEYS_TREE)?;
        match tree.get(&generation_key(data_id, generation))? {
            Some(raw) => Ok(Some(from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    // cache entries

    pub fn save_cache_record(&self, record: &CacheRecord) -> Result<(), StorageError> {
        self.store
            .tree_open(CACHE_TREE)?
            .insert(record.data_id.as_bytes(), to_vec(record)?)
    }

    pub fn remove_cache_record(&self, data_id: &str) -> Result<(), StorageError> {
        self.store.tree_open(CACHE_TREE)?.remove(data_id.as_bytes())
    }

    pub fn cache_records(&self) -> Result<Vec<CacheRecord>, StorageError> {
        let tree = self.store.tree_open(CACHE_TREE)?;
        tree.scan_prefix(&[])?
            .into_iter()
            .map(|(_, raw)| from_slice(&raw))
            .collect()
    }

    /// Returns the number of keys of the object, generation, key and cache trees.
    pub fn num_keys(&self) -> Result<(usize, usize, usize, usize), StorageError> {
        Ok((
            self.store.num_keys(OBJECTS_TREE)?,
            self.store.num_keys(GENERATIONS_TREE)?,
            self.store.num_keys(KEYS_TREE)?,
            self.store.num_keys(CACHE_TREE)?,
        ))
    }

    /// Returns the disk space used by the metadata store.
    pub fn disk_space(&self) -> u64 {
        self.store.disk_space()
    }
}

// Length-prefixed so that no data id is a key prefix of another.
fn id_prefix(data_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + data_id.len() + 8);
    key.extend_from_slice(&(data_id.len() as u32).to_be_bytes());
    key.extend_from_slice(data_id.as_bytes());
    key
}

fn generation_key(data_id: &str, generation: u64) -> Vec<u8> {
    let mut key = id_prefix(data_id);
    key.extend_from_slice(&generation.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation(data_id: &str, generation: u64) -> GenerationRecord {
        GenerationRecord {
            data_id: data_id.to_string(),
            generation,
            committed: false,
            slices: vec![SliceDescriptor {
                data_id: data_id.to_string(),
                generation,
                slice_index: 0,
                kind: SliceKind::Data,
                store_id: "s1".to_string(),
                remote_object_id: format!("{}-{}", data_id, generation),
                size: 64,
                checksum: "00".repeat(16),
            }],
        }
    }

    fn key(data_id: &str, generation: u64) -> EncryptionKey {
        EncryptionKey {
            data_id: data_id.to_string(),
            generation,
            key: vec![generation as u8; 32],
            nonce: vec![1; 12],
        }
    }

    fn object(data_id: &str, generation: u64) -> DataObject {
        DataObject {
            data_id: data_id.to_string(),
            size: 10,
            encoded_size: 26,
            generation,
            k: 4,
            m: 2,
            committed_at: 0,
        }
    }

    fn exercise(meta: MetaStore) {
        meta.insert_pending_generation(&generation("f1", 1), &key("f1", 1)).unwrap();
        assert_eq!(meta.pending_generations().unwrap().len(), 1);
        assert!(meta.find_data_object("f1").unwrap().is_none());

        meta.commit_generation(&object("f1", 1)).unwrap();
        assert!(meta.pending_generations().unwrap().is_empty());
        assert_eq!(meta.find_data_object("f1").unwrap().unwrap().generation, 1);
        assert!(meta.find_generation("f1", 1).unwrap().unwrap().committed);
        assert_eq!(meta.find_key("f1", 1).unwrap().unwrap().key, vec![1u8; 32]);

        // "f" must not see the generations of "f1"
        meta.insert_pending_generation(&generation("f", 7), &key("f", 7)).unwrap();
        assert_eq!(meta.generations("f").unwrap().len(), 1);
        assert_eq!(meta.generations("f1").unwrap().len(), 1);

        meta.remove_generation("f1", 1).unwrap();
        assert!(meta.find_generation("f1", 1).unwrap().is_none());
        assert!(meta.find_key("f1", 1).unwrap().is_none());

        meta.delete_data_object("f1").unwrap();
        assert!(meta.list_data_objects().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_repositories() {
        exercise(MetaStore::in_memory());
    }

    #[test]
    fn test_fjall_store_repositories() {
        let dir = tempfile::tempdir().unwrap();
        exercise(MetaStore::open(dir.path().join("db"), Some(Durability::Buffer)).unwrap());
    }

    #[test]
    fn test_commit_without_pending_generation_fails() {
        let meta = MetaStore::in_memory();
        assert!(matches!(
            meta.commit_generation(&object("nope", 3)),
            Err(StorageError::Metadata(_))
        ));
    }

    #[test]
    fn test_cache_records_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let record = CacheRecord {
            data_id: "f1".into(),
            size: 42,
            dirty: true,
            uploaded_size: 0,
            last_upload_time: None,
            last_access_time: 1_700_000_000_000,
            access_tick: 9,
        };
        {
            let meta = MetaStore::open(path.clone(), Some(Durability::Fsync)).unwrap();
            meta.save_cache_record(&record).unwrap();
        }
        let meta = MetaStore::open(path, None).unwrap();
        assert_eq!(meta.cache_records().unwrap(), vec![record]);
        meta.remove_cache_record("f1").unwrap();
        assert!(meta.cache_records().unwrap().is_empty());
    }
}

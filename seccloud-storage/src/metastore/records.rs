use crate::error::StorageError;

/// A stored object and the generation currently considered authoritative.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DataObject {
    pub data_id: String,
    /// Plaintext length.
    pub size: u64,
    /// Length of the ciphertext that was erasure coded.
    pub encoded_size: u64,
    pub generation: u64,
    pub k: u32,
    pub m: u32,
    /// Milliseconds since the UNIX epoch.
    pub committed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum SliceKind {
    Data,
    Coding,
}

/// Where one slice of one generation lives.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SliceDescriptor {
    pub data_id: String,
    pub generation: u64,
    /// Position among the k + m slices: data slices first, then coding slices.
    pub slice_index: u32,
    pub kind: SliceKind,
    pub store_id: String,
    pub remote_object_id: String,
    pub size: u64,
    /// Hex MD5 of the slice content.
    pub checksum: String,
}

/// All slices of one generation, persisted before any upload begins and
/// flagged committed once every upload acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GenerationRecord {
    pub data_id: String,
    pub generation: u64,
    pub committed: bool,
    pub slices: Vec<SliceDescriptor>,
}

/// Symmetric key and nonce of one generation. Never reused across generations.
#[derive(Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct EncryptionKey {
    pub data_id: String,
    pub generation: u64,
    pub key: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("data_id", &self.data_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Persisted part of a content cache entry, used to resume pending uploads.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CacheRecord {
    pub data_id: String,
    pub size: u64,
    pub dirty: bool,
    pub uploaded_size: u64,
    pub last_upload_time: Option<i64>,
    pub last_access_time: i64,
    pub access_tick: u64,
}

/// Serializes a record to bytes
pub(crate) fn to_vec<T: bincode::Encode>(record: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::encode_to_vec(record, bincode::config::standard())?)
}

/// Deserializes a record from bytes
pub(crate) fn from_slice<T: bincode::Decode<()>>(data: &[u8]) -> Result<T, StorageError> {
    let (record, _len) = bincode::decode_from_slice(data, bincode::config::standard())?;
    Ok(record)
}

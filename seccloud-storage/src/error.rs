use std::fmt;

/// Coarse classification of a [`StorageError`], so callers can branch on the
/// kind of failure without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Encoding,
    Decoding,
    AuthenticationFailure,
    StoreUnavailable,
    InsufficientStores,
    NotFound,
    LocalIo,
    Metadata,
    Cancelled,
}

/// Error type shared by every component of the storage engine.
///
/// It is `Clone` because a single in-flight fetch hands the same result to
/// every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Invalid k/m, malformed backend entry, duplicated store id...
    Configuration(String),
    /// The input could not be split into slices.
    Encoding(String),
    /// Too few slices, inconsistent slice sizes, or a singular decode matrix.
    Decoding(String),
    /// AEAD tag mismatch on the named data id. Never retried.
    AuthenticationFailure(String),
    /// A remote store failed or timed out. Transient.
    StoreUnavailable { store_id: String, reason: String },
    /// Fewer reachable stores than slices to place.
    InsufficientStores { required: usize, available: usize },
    NotFound(String),
    /// Local disk error (cache directory or local backend).
    LocalIo(String),
    /// Metadata repository failure.
    Metadata(String),
    /// The operation was abandoned before it completed.
    Cancelled,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Configuration(_) => ErrorKind::Configuration,
            StorageError::Encoding(_) => ErrorKind::Encoding,
            StorageError::Decoding(_) => ErrorKind::Decoding,
            StorageError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            StorageError::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            StorageError::InsufficientStores { .. } => ErrorKind::InsufficientStores,
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::LocalIo(_) => ErrorKind::LocalIo,
            StorageError::Metadata(_) => ErrorKind::Metadata,
            StorageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the background scheduler may retry the failed operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::StoreUnavailable { .. })
    }

    pub(crate) fn store_unavailable(store_id: &str, reason: impl fmt::Display) -> Self {
        StorageError::StoreUnavailable {
            store_id: store_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            StorageError::Encoding(msg) => write!(f, "Encoding failed: {}", msg),
            StorageError::Decoding(msg) => write!(f, "Decoding failed: {}", msg),
            StorageError::AuthenticationFailure(data_id) => {
                write!(f, "Authentication failure for data '{}': content was tampered with or corrupted", data_id)
            }
            StorageError::StoreUnavailable { store_id, reason } => {
                write!(f, "Cloud store '{}' unavailable: {}", store_id, reason)
            }
            StorageError::InsufficientStores { required, available } => write!(
                f,
                "Insufficient cloud stores: {} required, {} reachable",
                required, available
            ),
            StorageError::NotFound(what) => write!(f, "Not found: {}", what),
            StorageError::LocalIo(msg) => write!(f, "Local I/O error: {}", msg),
            StorageError::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            StorageError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::LocalIo(e.to_string())
    }
}

impl From<fjall::Error> for StorageError {
    fn from(e: fjall::Error) -> Self {
        StorageError::Metadata(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StorageError::Metadata(format!("Failed to serialize record: {}", e))
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StorageError::Metadata(format!("Failed to deserialize record: {}", e))
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_unavailable_is_retryable() {
        let transient = StorageError::store_unavailable("s1", "timed out");
        assert!(transient.is_retryable());
        assert_eq!(transient.kind(), ErrorKind::StoreUnavailable);

        assert!(!StorageError::AuthenticationFailure("f1".into()).is_retryable());
        assert!(!StorageError::InsufficientStores { required: 6, available: 4 }.is_retryable());
        assert!(!StorageError::Decoding("short".into()).is_retryable());
    }

    #[test]
    fn test_io_error_maps_to_local_io() {
        let err: StorageError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.kind(), ErrorKind::LocalIo);
        assert!(err.to_string().contains("disk full"));
    }
}

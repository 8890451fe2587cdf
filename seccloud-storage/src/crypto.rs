// Whole-object authenticated encryption, applied before erasure coding

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use tracing::error;

use crate::error::StorageError;
use crate::metastore::{EncryptionKey, MetaStore};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// Bytes the GCM tag adds to every ciphertext.
pub const TAG_LEN: usize = 16;

/// AES-256-GCM over whole objects, one fresh key and nonce per generation.
///
/// The ciphertext is bound to its `(data_id, generation)` through the
/// associated data, so slices of one generation can never be decrypted as
/// another.
#[derive(Debug, Clone)]
pub struct EncryptionService {
    meta: MetaStore,
}

impl EncryptionService {
    pub fn new(meta: MetaStore) -> Self {
        Self { meta }
    }

    /// Generate new random key material for a generation.
    pub fn generate_key(&self, data_id: &str, generation: u64) -> EncryptionKey {
        let mut key = vec![0u8; KEY_LEN];
        let mut nonce = vec![0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);
        EncryptionKey {
            data_id: data_id.to_string(),
            generation,
            key,
            nonce,
        }
    }

    /// Encrypts `plaintext` under a freshly generated key. The key is not
    /// persisted here: the caller stores it together with the generation's
    /// slice descriptors.
    pub fn encrypt(
        &self,
        data_id: &str,
        generation: u64,
        plaintext: &[u8],
    ) -> Result<(EncryptionKey, Vec<u8>), StorageError> {
        let key = self.generate_key(data_id, generation);
        let ciphertext = encrypt_with(&key, plaintext)?;
        Ok((key, ciphertext))
    }

    /// Decrypts with the persisted key of the given generation.
    pub fn decrypt(
        &self,
        data_id: &str,
        generation: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        let key = self.meta.find_key(data_id, generation)?.ok_or_else(|| {
            StorageError::NotFound(format!(
                "encryption key of data '{}' generation {}",
                data_id, generation
            ))
        })?;
        decrypt_with(&key, ciphertext)
    }
}

fn cipher(key: &EncryptionKey) -> Result<(Aes256Gcm, [u8; NONCE_LEN]), StorageError> {
    let cipher = Aes256Gcm::new_from_slice(&key.key).map_err(|e| {
        StorageError::Configuration(format!("Invalid key for data '{}': {}", key.data_id, e))
    })?;
    let nonce: [u8; NONCE_LEN] = key.nonce.as_slice().try_into().map_err(|_| {
        StorageError::Configuration(format!("Invalid nonce length for data '{}'", key.data_id))
    })?;
    Ok((cipher, nonce))
}

fn associated_data(key: &EncryptionKey) -> Vec<u8> {
    let mut aad = key.data_id.as_bytes().to_vec();
    aad.extend_from_slice(&key.generation.to_be_bytes());
    aad
}

/// Returns the ciphertext with the authentication tag appended.
pub fn encrypt_with(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
    let (cipher, nonce) = cipher(key)?;
    let nonce = Nonce::from(nonce);
    let aad = associated_data(key);
    cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
        .map_err(|e| StorageError::Encoding(format!("Encryption failed: {}", e)))
}

pub fn decrypt_with(key: &EncryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>, StorageError> {
    let (cipher, nonce) = cipher(key)?;
    let nonce = Nonce::from(nonce);
    let aad = associated_data(key);
    cipher
        .decrypt(&nonce, Payload { msg: ciphertext, aad: &aad })
        .map_err(|_| {
            error!(data_id = %key.data_id, generation = key.generation, "Authentication tag mismatch");
            StorageError::AuthenticationFailure(key.data_id.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new(MetaStore::in_memory())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let svc = service();
        let plaintext = b"attack at dawn".to_vec();
        let (key, ciphertext) = svc.encrypt("f1", 1, &plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);
        assert_ne!(&ciphertext[..plaintext.len()], plaintext.as_slice());
        assert_eq!(decrypt_with(&key, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_bit_flip_is_authentication_failure() {
        let svc = service();
        let (key, mut ciphertext) = svc.encrypt("f1", 1, &[7u8; 1000]).unwrap();
        ciphertext[500] ^= 0x01;
        assert_eq!(
            decrypt_with(&key, &ciphertext),
            Err(StorageError::AuthenticationFailure("f1".into()))
        );
    }

    #[test]
    fn test_ciphertext_bound_to_generation() {
        let svc = service();
        let (mut key, ciphertext) = svc.encrypt("f1", 1, b"data").unwrap();
        key.generation = 2;
        assert!(matches!(
            decrypt_with(&key, &ciphertext),
            Err(StorageError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_fresh_key_per_generation() {
        let svc = service();
        let a = svc.generate_key("f1", 1);
        let b = svc.generate_key("f1", 2);
        assert_ne!(a.key, b.key);
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.key.len(), KEY_LEN);
        assert_eq!(a.nonce.len(), NONCE_LEN);
    }

    #[test]
    fn test_decrypt_looks_up_persisted_key() {
        let meta = MetaStore::in_memory();
        let svc = EncryptionService::new(meta.clone());
        let (key, ciphertext) = svc.encrypt("f1", 3, b"hello").unwrap();

        assert!(matches!(svc.decrypt("f1", 3, &ciphertext), Err(StorageError::NotFound(_))));

        let record = crate::metastore::GenerationRecord {
            data_id: "f1".into(),
            generation: 3,
            committed: false,
            slices: vec![],
        };
        meta.insert_pending_generation(&record, &key).unwrap();
        assert_eq!(svc.decrypt("f1", 3, &ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn test_empty_plaintext() {
        let svc = service();
        let (key, ciphertext) = svc.encrypt("empty", 1, &[]).unwrap();
        assert_eq!(ciphertext.len(), TAG_LEN);
        assert!(decrypt_with(&key, &ciphertext).unwrap().is_empty());
    }
}

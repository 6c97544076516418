//! Key-management contract.
//!
//! Storage encrypts and decrypts through this trait only; the cipher, key
//! wrapping and master-key custody belong to the deployment. Keys are
//! per-collection data-encryption keys (DEKs), so dropping a DEK
//! cryptographically shreds its collection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("no data encryption key for collection `{0}`")]
    UnknownCollection(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
}

pub trait Kms: Send + Sync {
    /// Create (or rotate) the DEK for a collection.
    fn generate_dek(&self, collection: &str) -> Result<(), KmsError>;

    /// Securely discard a collection's DEK.
    fn delete_dek(&self, collection: &str) -> Result<(), KmsError>;

    /// Encrypt a buffer under the collection's DEK.
    fn encrypt(&self, collection: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Decrypt a buffer produced by [`Kms::encrypt`] for the same
    /// collection.
    fn decrypt(&self, collection: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;
}

//! # Cryptographic Primitives
//!
//! Everything DeltaDatabase does with key material lives here:
//!
//! - **AES-GCM**: authenticated encryption of entity payloads with a
//!   detached 16-byte tag and a fresh 12-byte nonce per call.
//! - **RSA-OAEP/SHA-256 key wrapping**: how the master key travels from the
//!   Main Worker to a Processing Worker during the subscribe handshake.
//! - **Master key cell**: the only place the shared AES key exists on a
//!   worker, guarded so it can never be held across I/O.
//!
//! The master key is generated (or supplied) at Main Worker startup and is
//! never written to durable storage.

pub mod keywrap;
pub mod master_key;
pub mod symmetric;

pub use keywrap::{WorkerKeyPair, MIN_RSA_BITS};
pub use master_key::MasterKeyCell;
pub use symmetric::{Sealed, NONCE_SIZE, TAG_SIZE};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Size of the shared master key in bytes (AES-256).
pub const MASTER_KEY_SIZE: usize = 32;

/// Cryptographic failure modes.
///
/// Decryption failures are deliberately opaque: authentication errors,
/// truncated input, and corrupted tags all collapse into
/// [`CryptoError::DecryptionFailed`].
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key size: expected 16, 24 or 32 bytes, got {0}")]
    InvalidKeySize(usize),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("key wrapping failed")]
    WrapFailed,

    #[error("key unwrapping failed")]
    UnwrapFailed,

    #[error("master key not yet distributed")]
    KeyNotDistributed,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Generate a fresh 32-byte master key from the OS random number generator.
pub fn generate_master_key() -> [u8; MASTER_KEY_SIZE] {
    let mut key = [0u8; MASTER_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate an opaque random identifier, hex-encoded.
///
/// Used for key ids and API-key record ids.
pub fn random_id(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_keys_are_distinct() {
        assert_ne!(generate_master_key(), generate_master_key());
    }

    #[test]
    fn test_random_id_length() {
        assert_eq!(random_id(8).len(), 16);
        assert_eq!(random_id(16).len(), 32);
    }
}

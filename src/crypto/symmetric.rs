//! # Symmetric Entity Encryption
//!
//! AES-GCM authenticated encryption for entity payloads. Every call to
//! [`encrypt`] draws a fresh 96-bit nonce from the OS random number
//! generator; nonce reuse under the same key is forbidden, so nonces are
//! never supplied by callers.
//!
//! The authentication tag is kept detached from the ciphertext because the
//! storage layer persists `iv` and `tag` in the metadata sidecar while the
//! ciphertext goes into the blob file.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use super::{CryptoError, CryptoResult};

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// AES-192-GCM is not aliased by the `aes-gcm` crate.
type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, aes_gcm::aead::consts::U12>;

/// Output of [`encrypt`]: ciphertext plus the detached nonce and tag.
#[derive(Debug, Clone, Zeroize)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Cipher {
    fn new(key: &[u8]) -> CryptoResult<Self> {
        match key.len() {
            16 => Ok(Cipher::Aes128(Box::new(Aes128Gcm::new(
                GenericArray::from_slice(key),
            )))),
            24 => Ok(Cipher::Aes192(Box::new(Aes192Gcm::new(
                GenericArray::from_slice(key),
            )))),
            32 => Ok(Cipher::Aes256(Box::new(Aes256Gcm::new(
                GenericArray::from_slice(key),
            )))),
            n => Err(CryptoError::InvalidKeySize(n)),
        }
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let result = match self {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes192(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
        };
        result.map_err(|_| CryptoError::EncryptionFailed)
    }

    fn open(&self, nonce: &[u8], combined: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let result = match self {
            Cipher::Aes128(c) => c.decrypt(nonce, combined),
            Cipher::Aes192(c) => c.decrypt(nonce, combined),
            Cipher::Aes256(c) => c.decrypt(nonce, combined),
        };
        result.map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Encrypt `plaintext` under `key` with a freshly generated random nonce.
///
/// `key` must be 16, 24 or 32 bytes long. Returns the ciphertext with the
/// nonce and 16-byte authentication tag detached.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> CryptoResult<Sealed> {
    let cipher = Cipher::new(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    // The AEAD API appends the tag to the ciphertext; split it back off.
    let mut combined = cipher.seal(&nonce, plaintext)?;
    if combined.len() < TAG_SIZE {
        return Err(CryptoError::EncryptionFailed);
    }
    let tag_start = combined.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&combined[tag_start..]);
    combined.truncate(tag_start);

    Ok(Sealed {
        ciphertext: combined,
        nonce,
        tag,
    })
}

/// Decrypt a ciphertext produced by [`encrypt`].
///
/// Any authentication failure, wrong key, or size mismatch yields the same
/// opaque [`CryptoError::DecryptionFailed`].
pub fn decrypt(key: &[u8], ciphertext: &[u8], nonce: &[u8], tag: &[u8]) -> CryptoResult<Vec<u8>> {
    if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Cipher::new(key)?;

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher.open(nonce, &combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let key = [7u8; 32];
        let sealed = encrypt(&key, b"hello entity").unwrap();
        let plain = decrypt(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag).unwrap();
        assert_eq!(plain, b"hello entity");
    }

    #[test]
    fn test_all_key_sizes() {
        for size in [16usize, 24, 32] {
            let key = vec![3u8; size];
            let sealed = encrypt(&key, b"payload").unwrap();
            let plain = decrypt(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag).unwrap();
            assert_eq!(plain, b"payload");
        }
    }

    #[test]
    fn test_rejects_bad_key_size() {
        assert!(matches!(
            encrypt(&[0u8; 15], b"x"),
            Err(CryptoError::InvalidKeySize(15))
        ));
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = [1u8; 32];
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&[1u8; 32], b"secret").unwrap();
        let result = decrypt(&[2u8; 32], &sealed.ciphertext, &sealed.nonce, &sealed.tag);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = [1u8; 32];
        let mut sealed = encrypt(&key, b"secret").unwrap();
        sealed.tag[0] ^= 1;
        let result = decrypt(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_truncated_nonce_fails() {
        let key = [1u8; 32];
        let sealed = encrypt(&key, b"secret").unwrap();
        let result = decrypt(&key, &sealed.ciphertext, &sealed.nonce[..8], &sealed.tag);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    proptest! {
        #[test]
        fn prop_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let key = [9u8; 32];
            let sealed = encrypt(&key, &plaintext).unwrap();
            let recovered =
                decrypt(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag).unwrap();
            prop_assert_eq!(recovered, plaintext);
        }

        #[test]
        fn prop_bit_flip_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            flip_bit in 0usize..8,
        ) {
            let key = [9u8; 32];
            let mut sealed = encrypt(&key, &plaintext).unwrap();
            let idx = plaintext.len() / 2;
            sealed.ciphertext[idx] ^= 1 << flip_bit;
            prop_assert!(
                decrypt(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag).is_err()
            );
        }

        #[test]
        fn prop_distinct_keys_reject(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            let sealed = encrypt(&a, b"document").unwrap();
            prop_assert!(decrypt(&b, &sealed.ciphertext, &sealed.nonce, &sealed.tag).is_err());
        }
    }
}

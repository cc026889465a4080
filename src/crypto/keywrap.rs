//! # Master Key Wrapping
//!
//! The subscribe handshake moves the 32-byte master key from the Main
//! Worker to a Processing Worker without it ever touching disk or the wire
//! in the clear: the worker generates an ephemeral RSA keypair, sends the
//! public half as PEM, and the Main Worker returns the key wrapped under
//! RSA-OAEP/SHA-256. The keypair is discarded once the key is unwrapped.

use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{CryptoError, CryptoResult, MASTER_KEY_SIZE};

/// Minimum accepted RSA modulus size in bits.
pub const MIN_RSA_BITS: usize = 2048;

/// Ephemeral RSA keypair held by a Processing Worker for the duration of
/// one subscribe handshake.
pub struct WorkerKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl WorkerKeyPair {
    /// Generate a fresh 2048-bit keypair.
    ///
    /// Key generation is CPU-heavy (hundreds of milliseconds); callers on
    /// an async runtime should run it on the blocking pool.
    pub fn generate() -> CryptoResult<Self> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, MIN_RSA_BITS)
            .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
        let public_key = private_key.to_public_key();
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Serialize the public half as SPKI PEM for the subscribe request.
    pub fn public_key_pem(&self) -> CryptoResult<String> {
        self.public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))
    }

    /// Unwrap a master key wrapped under this keypair's public half.
    pub fn unwrap_master_key(&self, wrapped: &[u8]) -> CryptoResult<Zeroizing<[u8; MASTER_KEY_SIZE]>> {
        let padding = Oaep::new::<Sha256>();
        let plain = Zeroizing::new(
            self.private_key
                .decrypt(padding, wrapped)
                .map_err(|_| CryptoError::UnwrapFailed)?,
        );
        if plain.len() != MASTER_KEY_SIZE {
            return Err(CryptoError::UnwrapFailed);
        }
        let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        key.copy_from_slice(&plain);
        Ok(key)
    }
}

impl std::fmt::Debug for WorkerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerKeyPair")
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Parse a PEM-encoded (SPKI) RSA public key, rejecting moduli below
/// [`MIN_RSA_BITS`].
pub fn parse_public_key_pem(pem: &str) -> CryptoResult<RsaPublicKey> {
    let key = RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(CryptoError::InvalidPublicKey(format!(
            "modulus too small: {} bits, minimum {}",
            bits, MIN_RSA_BITS
        )));
    }
    Ok(key)
}

/// Wrap the master key under a worker's public key (RSA-OAEP/SHA-256).
pub fn wrap_master_key(
    public_key: &RsaPublicKey,
    key: &[u8; MASTER_KEY_SIZE],
) -> CryptoResult<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;
    let padding = Oaep::new::<Sha256>();
    public_key
        .encrypt(&mut rng, padding, key)
        .map_err(|_| CryptoError::WrapFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_master_key;

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let pair = WorkerKeyPair::generate().unwrap();
        let pem = pair.public_key_pem().unwrap();
        let public = parse_public_key_pem(&pem).unwrap();

        let master = generate_master_key();
        let wrapped = wrap_master_key(&public, &master).unwrap();
        let unwrapped = pair.unwrap_master_key(&wrapped).unwrap();
        assert_eq!(*unwrapped, master);
    }

    #[test]
    fn test_unwrap_with_wrong_keypair_fails() {
        let alice = WorkerKeyPair::generate().unwrap();
        let bob = WorkerKeyPair::generate().unwrap();

        let public = parse_public_key_pem(&alice.public_key_pem().unwrap()).unwrap();
        let wrapped = wrap_master_key(&public, &generate_master_key()).unwrap();

        assert!(matches!(
            bob.unwrap_master_key(&wrapped),
            Err(CryptoError::UnwrapFailed)
        ));
    }

    #[test]
    fn test_rejects_garbage_pem() {
        assert!(matches!(
            parse_public_key_pem("-----BEGIN PUBLIC KEY-----\nnot a key\n-----END PUBLIC KEY-----"),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_pem_format() {
        let pair = WorkerKeyPair::generate().unwrap();
        let pem = pair.public_key_pem().unwrap();
        assert!(pem.contains("BEGIN PUBLIC KEY"));
        assert!(pem.contains("END PUBLIC KEY"));
    }
}

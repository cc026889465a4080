//! # In-Memory Master Key Cell
//!
//! The master key exists only in worker RAM. This cell is the single place
//! it is stored: a reader/writer lock around an optional 32-byte array.
//! Readers copy the bytes out before use so the lock is never held across
//! I/O, and the array is zeroized when cleared or dropped.

use parking_lot::RwLock;
use zeroize::Zeroizing;

use super::{CryptoError, CryptoResult, MASTER_KEY_SIZE};

/// Holder for the shared AES master key plus the identifier of the key
/// generation it belongs to.
#[derive(Default)]
pub struct MasterKeyCell {
    inner: RwLock<Option<KeyState>>,
}

struct KeyState {
    key: Zeroizing<[u8; MASTER_KEY_SIZE]>,
    key_id: String,
}

impl MasterKeyCell {
    /// Create an empty cell; [`snapshot`](Self::snapshot) refuses until a
    /// key is installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cell pre-loaded with a key, as on the Main Worker at start.
    pub fn with_key(key: [u8; MASTER_KEY_SIZE], key_id: impl Into<String>) -> Self {
        let cell = Self::new();
        cell.install(key, key_id);
        cell
    }

    /// Install (or replace) the key. Replacement happens on re-subscribe
    /// after a Main Worker restart.
    pub fn install(&self, key: [u8; MASTER_KEY_SIZE], key_id: impl Into<String>) {
        let mut guard = self.inner.write();
        *guard = Some(KeyState {
            key: Zeroizing::new(key),
            key_id: key_id.into(),
        });
    }

    /// Copy the key bytes out for use in a single operation.
    ///
    /// Errors with [`CryptoError::KeyNotDistributed`] before the subscribe
    /// handshake has completed.
    pub fn snapshot(&self) -> CryptoResult<Zeroizing<[u8; MASTER_KEY_SIZE]>> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some(state) => Ok(state.key.clone()),
            None => Err(CryptoError::KeyNotDistributed),
        }
    }

    /// Identifier of the currently installed key generation.
    pub fn key_id(&self) -> CryptoResult<String> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some(state) => Ok(state.key_id.clone()),
            None => Err(CryptoError::KeyNotDistributed),
        }
    }

    /// Whether a key has been distributed to this process.
    pub fn is_ready(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Drop and zeroize the key, as on shutdown.
    pub fn clear(&self) {
        let mut guard = self.inner.write();
        *guard = None;
    }
}

impl std::fmt::Debug for MasterKeyCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyCell")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cell_refuses() {
        let cell = MasterKeyCell::new();
        assert!(!cell.is_ready());
        assert!(matches!(
            cell.snapshot(),
            Err(CryptoError::KeyNotDistributed)
        ));
    }

    #[test]
    fn test_install_snapshot_clear() {
        let cell = MasterKeyCell::new();
        cell.install([5u8; MASTER_KEY_SIZE], "key-1");

        assert!(cell.is_ready());
        assert_eq!(*cell.snapshot().unwrap(), [5u8; MASTER_KEY_SIZE]);
        assert_eq!(cell.key_id().unwrap(), "key-1");

        cell.clear();
        assert!(!cell.is_ready());
    }

    #[test]
    fn test_reinstall_replaces() {
        let cell = MasterKeyCell::with_key([1u8; MASTER_KEY_SIZE], "key-1");
        cell.install([2u8; MASTER_KEY_SIZE], "key-2");
        assert_eq!(*cell.snapshot().unwrap(), [2u8; MASTER_KEY_SIZE]);
        assert_eq!(cell.key_id().unwrap(), "key-2");
    }
}

//! # API-Key Manager
//!
//! Persistent RBAC credentials. A key secret is `dk_<hex(32 bytes)>` and is
//! returned exactly once at creation; only its SHA-256 is stored. Records
//! persist as a JSON array in `_auth/keys.json`, written atomically
//! (temp file + rename). A missing store file is an empty store, not an
//! error.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{sha256_hex, PermissionSet};
use crate::error::DeltaError;

/// Prefix carried by every generated key secret.
pub const KEY_PREFIX: &str = "dk_";

/// API-key subsystem failures.
#[derive(Error, Debug)]
pub enum ApiKeyError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key store corrupted")]
    CorruptStore,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ApiKeyResult<T> = Result<T, ApiKeyError>;

impl From<ApiKeyError> for DeltaError {
    fn from(err: ApiKeyError) -> Self {
        match err {
            ApiKeyError::NotFound(id) => DeltaError::NotFound(format!("api key {}", id)),
            ApiKeyError::CorruptStore | ApiKeyError::Io(_) => DeltaError::Internal,
        }
    }
}

/// Persisted API-key record. The secret itself is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Random 8-byte hex identifier.
    pub id: String,
    pub name: String,
    /// SHA-256 hex of the secret.
    pub key_hash: String,
    pub permissions: PermissionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Client-visible view of a record; excludes the hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    pub permissions: PermissionSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&ApiKeyRecord> for ApiKeySummary {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            permissions: record.permissions.clone(),
            expires_at: record.expires_at,
            enabled: record.enabled,
            created_at: record.created_at,
        }
    }
}

/// Why a presented secret was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRefusal {
    Unknown,
    Disabled,
    Expired,
}

/// Loads, persists, and validates API keys.
pub struct ApiKeyManager {
    path: PathBuf,
    keys: RwLock<Vec<ApiKeyRecord>>,
}

impl ApiKeyManager {
    /// Open the store at `path`, loading existing records. A missing file
    /// yields an empty store.
    pub fn open(path: impl AsRef<Path>) -> ApiKeyResult<Self> {
        let path = path.as_ref().to_path_buf();
        let keys = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<Vec<ApiKeyRecord>>(&bytes)
                    .map_err(|_| ApiKeyError::CorruptStore)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            keys: RwLock::new(keys),
        })
    }

    /// Atomic persist: write a temp file next to the store, then rename.
    fn persist(&self, keys: &[ApiKeyRecord]) -> ApiKeyResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(keys).map_err(|_| ApiKeyError::CorruptStore)?;

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Create a key. Returns the stored record and the secret, which is
    /// never recoverable afterwards.
    pub fn create_key(
        &self,
        name: &str,
        permissions: PermissionSet,
        expires_at: Option<DateTime<Utc>>,
    ) -> ApiKeyResult<(ApiKeyRecord, String)> {
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        let secret = format!("{}{}", KEY_PREFIX, hex::encode(secret_bytes));

        let mut id_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut id_bytes);

        let record = ApiKeyRecord {
            id: hex::encode(id_bytes),
            name: name.to_string(),
            key_hash: sha256_hex(&secret),
            permissions,
            expires_at,
            enabled: true,
            created_at: Utc::now(),
        };

        let mut keys = self.keys.write();
        keys.push(record.clone());
        self.persist(&keys)?;
        Ok((record, secret))
    }

    /// Validate a presented secret against the store.
    pub fn validate_key(&self, secret: &str) -> Result<ApiKeyRecord, KeyRefusal> {
        let hash = sha256_hex(secret);
        let keys = self.keys.read();
        let record = keys
            .iter()
            .find(|k| k.key_hash == hash)
            .ok_or(KeyRefusal::Unknown)?;
        if !record.enabled {
            return Err(KeyRefusal::Disabled);
        }
        if record.is_expired(Utc::now()) {
            return Err(KeyRefusal::Expired);
        }
        Ok(record.clone())
    }

    /// All records as client-visible summaries, creation order.
    pub fn list_keys(&self) -> Vec<ApiKeySummary> {
        self.keys.read().iter().map(ApiKeySummary::from).collect()
    }

    /// Delete a key by id.
    pub fn delete_key(&self, id: &str) -> ApiKeyResult<()> {
        let mut keys = self.keys.write();
        let before = keys.len();
        keys.retain(|k| k.id != id);
        if keys.len() == before {
            return Err(ApiKeyError::NotFound(id.to_string()));
        }
        self.persist(&keys)
    }

    /// Enable or disable a key without deleting it.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> ApiKeyResult<()> {
        let mut keys = self.keys.write();
        let record = keys
            .iter_mut()
            .find(|k| k.id == id)
            .ok_or_else(|| ApiKeyError::NotFound(id.to_string()))?;
        record.enabled = enabled;
        self.persist(&keys)
    }
}

//! # Storage Backends
//!
//! Narrow contract over the shared persistence layer. Two backends exist:
//! a POSIX shared filesystem and an S3-compatible object store. Both store
//! an entity as a `(blob, metadata)` pair:
//!
//! - blob: `files/<entityID>.json.enc` — the AES-GCM ciphertext.
//! - metadata: `files/<entityID>.meta.json` — the sidecar record carrying
//!   the nonce, tag, schema id, and version.
//!
//! Schema templates live under `templates/<schemaID>.json`.
//!
//! Writes of the pair are atomic: both pieces become visible or neither
//! does. A blob without its sidecar (or vice versa) reads as `NotFound`.

pub mod filesystem;
pub mod lock;
pub mod s3;

pub use filesystem::FilesystemBackend;
pub use lock::{FsLockBackend, LockBackend, LockGuard, LockMode, MemoryLockBackend};
pub use s3::{S3Backend, S3Config};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DeltaError;

/// Encryption algorithm recorded in every metadata sidecar.
pub const ALGORITHM_AES_GCM: &str = "AES-GCM";

/// Storage failure modes.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Entity or template does not exist. Callers rely on this kind to map
    /// misses onto the public `NotFound` taxonomy.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("metadata corrupted for {0}")]
    CorruptMetadata(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for DeltaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => DeltaError::NotFound(what),
            StorageError::InvalidIdentifier(detail) => DeltaError::InvalidArgument(detail),
            StorageError::CorruptMetadata(_)
            | StorageError::Io(_)
            | StorageError::ObjectStore(_) => DeltaError::Internal,
        }
    }
}

/// Sidecar record written atomically with every entity blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMetadata {
    /// Identifier of the master-key generation the blob was sealed under.
    pub key_id: String,

    /// Always [`ALGORITHM_AES_GCM`].
    pub algorithm: String,

    /// Base64-encoded 12-byte GCM nonce, unique per key_id.
    pub iv: String,

    /// Base64-encoded 16-byte authentication tag.
    pub tag: String,

    /// Schema the plaintext was validated against.
    pub schema_id: String,

    /// Strictly increasing per entity across successful writes.
    pub version: u64,

    /// Worker that produced this version.
    pub writer_id: String,

    /// Write time.
    pub timestamp: DateTime<Utc>,

    pub database: String,

    pub entity_key: String,
}

/// Compose the storage identifier for `(database, key)`.
pub fn entity_id(database: &str, entity_key: &str) -> String {
    format!("{}_{}", database, entity_key)
}

/// Validate a name used as a path component (database, entity key, schema
/// id). Rejects empty names and path metacharacters so identifiers can
/// never escape the storage prefix.
pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidIdentifier("empty name".to_string()));
    }
    if name.len() > 256 {
        return Err(StorageError::InvalidIdentifier("name too long".to_string()));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok || name.starts_with('.') {
        return Err(StorageError::InvalidIdentifier(format!(
            "invalid characters in name: {}",
            name
        )));
    }
    Ok(())
}

/// Contract shared by the filesystem and object-store backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist blob and metadata atomically.
    async fn write_file(
        &self,
        entity_id: &str,
        blob: &[u8],
        metadata: &EntityMetadata,
    ) -> StorageResult<()>;

    /// Read both pieces, or [`StorageError::NotFound`].
    async fn read_file(&self, entity_id: &str) -> StorageResult<(Vec<u8>, EntityMetadata)>;

    /// Read only the metadata sidecar; used for version revalidation.
    async fn read_metadata(&self, entity_id: &str) -> StorageResult<EntityMetadata>;

    /// All stored entity ids, derived from blob presence, sorted.
    async fn list_files(&self) -> StorageResult<Vec<String>>;

    /// Store a schema template.
    async fn write_template(&self, schema_id: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Read a schema template, or [`StorageError::NotFound`].
    async fn read_template(&self, schema_id: &str) -> StorageResult<Vec<u8>>;

    /// All stored template ids, sorted.
    async fn list_templates(&self) -> StorageResult<Vec<String>>;

    /// Backend-defined locator of the blob, for diagnostics only.
    fn blob_path(&self, entity_id: &str) -> String;

    /// Backend-defined locator of the metadata sidecar.
    fn meta_path(&self, entity_id: &str) -> String;
}

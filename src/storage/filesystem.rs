//! # Filesystem Backend
//!
//! Stores entities on a POSIX shared filesystem. Atomicity comes from the
//! classic write-to-temp + fsync + rename sequence, applied to the blob
//! first and the metadata sidecar last: a reader either sees the new pair
//! or treats the entity as absent, never a torn write.
//!
//! Startup recovery removes orphaned temp files left by a crashed writer.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::task;
use uuid::Uuid;

use super::{validate_name, EntityMetadata, StorageBackend, StorageError, StorageResult};

const BLOB_SUFFIX: &str = ".json.enc";
const META_SUFFIX: &str = ".meta.json";
const TMP_MARKER: &str = ".tmp-";

/// Shared-filesystem storage backend.
pub struct FilesystemBackend {
    files_dir: PathBuf,
    templates_dir: PathBuf,
}

impl FilesystemBackend {
    /// Open (creating directories as needed) and run crash recovery.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        let files_dir = root.join("files");
        let templates_dir = root.join("templates");
        std::fs::create_dir_all(&files_dir)?;
        std::fs::create_dir_all(&templates_dir)?;

        let backend = Self {
            files_dir,
            templates_dir,
        };
        backend.remove_orphan_temps()?;
        Ok(backend)
    }

    /// Delete temp files left behind by writers that died mid-publish.
    fn remove_orphan_temps(&self) -> StorageResult<()> {
        for dir in [&self.files_dir, &self.templates_dir] {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                if name.to_string_lossy().contains(TMP_MARKER) {
                    tracing::debug!(file = %name.to_string_lossy(), "removing orphan temp file");
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    fn blob_file(&self, entity_id: &str) -> PathBuf {
        self.files_dir.join(format!("{}{}", entity_id, BLOB_SUFFIX))
    }

    fn meta_file(&self, entity_id: &str) -> PathBuf {
        self.files_dir.join(format!("{}{}", entity_id, META_SUFFIX))
    }

    fn template_file(&self, schema_id: &str) -> PathBuf {
        self.templates_dir.join(format!("{}.json", schema_id))
    }

    /// Write `bytes` to a temp file in the target directory, fsync, rename.
    fn publish(target: &Path, bytes: &[u8]) -> StorageResult<()> {
        let dir = target
            .parent()
            .ok_or_else(|| StorageError::ObjectStore("target has no parent".to_string()))?;
        let tmp = dir.join(format!(
            "{}{}{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            TMP_MARKER,
            Uuid::new_v4().simple()
        ));

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = std::fs::rename(&tmp, target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn read_all(path: &Path, what: &str) -> StorageResult<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(what.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn write_file(
        &self,
        entity_id: &str,
        blob: &[u8],
        metadata: &EntityMetadata,
    ) -> StorageResult<()> {
        validate_name(entity_id)?;
        let blob_path = self.blob_file(entity_id);
        let meta_path = self.meta_file(entity_id);
        let blob = blob.to_vec();
        let meta_bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|_| StorageError::CorruptMetadata(entity_id.to_string()))?;

        task::spawn_blocking(move || {
            Self::publish(&blob_path, &blob)?;
            Self::publish(&meta_path, &meta_bytes)
        })
        .await
        .map_err(|e| StorageError::ObjectStore(e.to_string()))?
    }

    async fn read_file(&self, entity_id: &str) -> StorageResult<(Vec<u8>, EntityMetadata)> {
        validate_name(entity_id)?;
        let blob_path = self.blob_file(entity_id);
        let meta_path = self.meta_file(entity_id);
        let id = entity_id.to_string();

        task::spawn_blocking(move || {
            // Either half missing means the pair is not (yet) published.
            let blob = Self::read_all(&blob_path, &id)?;
            let meta_bytes = Self::read_all(&meta_path, &id)?;
            let metadata: EntityMetadata = serde_json::from_slice(&meta_bytes)
                .map_err(|_| StorageError::CorruptMetadata(id.clone()))?;
            Ok((blob, metadata))
        })
        .await
        .map_err(|e| StorageError::ObjectStore(e.to_string()))?
    }

    async fn read_metadata(&self, entity_id: &str) -> StorageResult<EntityMetadata> {
        validate_name(entity_id)?;
        let meta_path = self.meta_file(entity_id);
        let id = entity_id.to_string();

        task::spawn_blocking(move || {
            let meta_bytes = Self::read_all(&meta_path, &id)?;
            serde_json::from_slice(&meta_bytes).map_err(|_| StorageError::CorruptMetadata(id))
        })
        .await
        .map_err(|e| StorageError::ObjectStore(e.to_string()))?
    }

    async fn list_files(&self) -> StorageResult<Vec<String>> {
        let dir = self.files_dir.clone();
        task::spawn_blocking(move || {
            let mut ids = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if name.contains(TMP_MARKER) {
                    continue;
                }
                if let Some(id) = name.strip_suffix(BLOB_SUFFIX) {
                    ids.push(id.to_string());
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
        .map_err(|e| StorageError::ObjectStore(e.to_string()))?
    }

    async fn write_template(&self, schema_id: &str, bytes: &[u8]) -> StorageResult<()> {
        validate_name(schema_id)?;
        let path = self.template_file(schema_id);
        let bytes = bytes.to_vec();
        task::spawn_blocking(move || Self::publish(&path, &bytes))
            .await
            .map_err(|e| StorageError::ObjectStore(e.to_string()))?
    }

    async fn read_template(&self, schema_id: &str) -> StorageResult<Vec<u8>> {
        validate_name(schema_id)?;
        let path = self.template_file(schema_id);
        let id = schema_id.to_string();
        task::spawn_blocking(move || Self::read_all(&path, &id))
            .await
            .map_err(|e| StorageError::ObjectStore(e.to_string()))?
    }

    async fn list_templates(&self) -> StorageResult<Vec<String>> {
        let dir = self.templates_dir.clone();
        task::spawn_blocking(move || {
            let mut ids = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if name.contains(TMP_MARKER) {
                    continue;
                }
                if let Some(id) = name.strip_suffix(".json") {
                    ids.push(id.to_string());
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
        .map_err(|e| StorageError::ObjectStore(e.to_string()))?
    }

    fn blob_path(&self, entity_id: &str) -> String {
        self.blob_file(entity_id).to_string_lossy().into_owned()
    }

    fn meta_path(&self, entity_id: &str) -> String {
        self.meta_file(entity_id).to_string_lossy().into_owned()
    }
}

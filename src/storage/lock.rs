//! # Per-Entity Lock Backends
//!
//! Readers take `Shared`, writers take `Exclusive`; multiple shared holders
//! may coexist and exclusive excludes everyone. Acquisition returns a guard
//! that releases on drop, so the lock is freed on every exit path.
//!
//! Two backends with identical semantics:
//!
//! - **Filesystem**: advisory `flock` on a `.lock` sidecar file, shared
//!   across processes on the same filesystem.
//! - **In-process**: a `tokio::sync::RwLock` registry keyed by entity id.
//!   Used with the object store, where write visibility is already
//!   total-order per object and cross-process coordination is not a goal.
//!
//! Acquisition may block; callers that need a bound wrap the call in
//! `tokio::time::timeout`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fs2::FileExt;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task;

use super::{validate_name, StorageError, StorageResult};

/// Lock mode for an entity operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Concurrent readers.
    Shared,
    /// Single writer, excludes readers.
    Exclusive,
}

/// Held lock; released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    _inner: GuardInner,
}

enum GuardInner {
    // Dropping the file closes the descriptor, which releases the flock.
    File(std::fs::File),
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Backend-neutral per-entity locking contract.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Block until the lock is held in the requested mode.
    async fn acquire(&self, entity_id: &str, mode: LockMode) -> StorageResult<LockGuard>;
}

/// Advisory file locks on a `.lock` sidecar per entity.
pub struct FsLockBackend {
    locks_dir: PathBuf,
}

impl FsLockBackend {
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let locks_dir = root.as_ref().join("files");
        std::fs::create_dir_all(&locks_dir)?;
        Ok(Self { locks_dir })
    }

    fn lock_file(&self, entity_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", entity_id))
    }
}

#[async_trait]
impl LockBackend for FsLockBackend {
    async fn acquire(&self, entity_id: &str, mode: LockMode) -> StorageResult<LockGuard> {
        validate_name(entity_id)?;
        let path = self.lock_file(entity_id);

        // flock blocks the calling thread, so it runs on the blocking pool.
        let file = task::spawn_blocking(move || -> StorageResult<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            match mode {
                LockMode::Shared => file.lock_shared()?,
                LockMode::Exclusive => file.lock_exclusive()?,
            }
            Ok(file)
        })
        .await
        .map_err(|e| StorageError::ObjectStore(e.to_string()))??;

        Ok(LockGuard {
            _inner: GuardInner::File(file),
        })
    }
}

/// In-process read/write mutex registry keyed by entity id.
#[derive(Default)]
pub struct MemoryLockBackend {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, entity_id: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn acquire(&self, entity_id: &str, mode: LockMode) -> StorageResult<LockGuard> {
        validate_name(entity_id)?;
        let lock = self.entry(entity_id);
        let inner = match mode {
            LockMode::Shared => GuardInner::Read(lock.read_owned().await),
            LockMode::Exclusive => GuardInner::Write(lock.write_owned().await),
        };
        Ok(LockGuard { _inner: inner })
    }
}

//! # Processing Worker Data Path
//!
//! The entity read/write engine: LRU cache in front of the storage
//! backend, per-entity locks for serialization, AES-GCM seal/open with the
//! in-memory master key, and strict version monotonicity on writes.
//!
//! The gRPC `Process` service is a thin shell around [`WorkerContext`];
//! every request authenticates with a worker token issued during the
//! subscribe handshake.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::RwLock;
use tonic::{Request, Response, Status};

use crate::cache::{CacheEntry, EntityCache};
use crate::crypto::{symmetric, MasterKeyCell};
use crate::error::{DeltaError, DeltaResult};
use crate::proto::processing_worker_server::ProcessingWorker;
use crate::proto::{Operation, ProcessRequest, ProcessResponse};
use crate::schema::SchemaValidator;
use crate::storage::{
    entity_id, validate_name, EntityMetadata, LockBackend, LockMode, StorageBackend, StorageError,
    ALGORITHM_AES_GCM,
};

/// Shared state of one Processing Worker process.
pub struct WorkerContext {
    pub worker_id: String,
    pub storage: Arc<dyn StorageBackend>,
    pub locks: Arc<dyn LockBackend>,
    pub cache: EntityCache,
    pub master_key: MasterKeyCell,
    pub validator: SchemaValidator,
    /// Worker tokens this process will accept on `Process` calls. Every
    /// successful (re-)subscription adds one; old tokens stay accepted
    /// until the Main Worker's expiry removes them from circulation.
    accepted_tokens: RwLock<HashSet<String>>,
    /// In-flight `Process` calls, reported with heartbeats.
    active_requests: AtomicU32,
}

impl WorkerContext {
    pub fn new(
        worker_id: String,
        storage: Arc<dyn StorageBackend>,
        locks: Arc<dyn LockBackend>,
        cache: EntityCache,
    ) -> Self {
        let validator = SchemaValidator::new(storage.clone());
        Self {
            worker_id,
            storage,
            locks,
            cache,
            master_key: MasterKeyCell::new(),
            validator,
            accepted_tokens: RwLock::new(HashSet::new()),
            active_requests: AtomicU32::new(0),
        }
    }

    pub fn accept_token(&self, token: String) {
        self.accepted_tokens.write().insert(token);
    }

    pub fn is_token_accepted(&self, token: &str) -> bool {
        self.accepted_tokens.read().contains(token)
    }

    pub fn active_requests(&self) -> u32 {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Zeroize key material and drop cached plaintext; called on shutdown.
    pub fn shutdown(&self) {
        self.master_key.clear();
        self.cache.close();
    }

    fn decrypt_entity(&self, eid: &str, blob: &[u8], metadata: &EntityMetadata) -> DeltaResult<Vec<u8>> {
        let key = self
            .master_key
            .snapshot()
            .map_err(|_| DeltaError::Unavailable("master key not yet distributed".to_string()))?;

        let iv = BASE64.decode(&metadata.iv).map_err(|_| {
            tracing::error!(entity_id = %eid, "metadata iv is not valid base64");
            DeltaError::Internal
        })?;
        let tag = BASE64.decode(&metadata.tag).map_err(|_| {
            tracing::error!(entity_id = %eid, "metadata tag is not valid base64");
            DeltaError::Internal
        })?;

        symmetric::decrypt(key.as_ref(), blob, &iv, &tag).map_err(|_| {
            // Never log the key, nonce, or any plaintext here.
            tracing::error!(entity_id = %eid, "entity decryption failed");
            DeltaError::Internal
        })
    }

    /// Load an entity from storage under a shared lock and refresh the
    /// cache.
    async fn load_entity(&self, eid: &str) -> DeltaResult<(Vec<u8>, u64)> {
        let _guard = self
            .locks
            .acquire(eid, LockMode::Shared)
            .await
            .map_err(DeltaError::from)?;

        let (blob, metadata) = self.storage.read_file(eid).await.map_err(DeltaError::from)?;
        let plaintext = self.decrypt_entity(eid, &blob, &metadata)?;

        self.cache.set(
            eid,
            CacheEntry {
                plaintext: plaintext.clone(),
                version: metadata.version,
            },
        );
        Ok((plaintext, metadata.version))
    }

    /// GET path: cache hit with version revalidation, else locked load.
    pub async fn get_entity(&self, database: &str, entity_key: &str) -> DeltaResult<(Vec<u8>, u64)> {
        validate_name(database).map_err(DeltaError::from)?;
        validate_name(entity_key).map_err(DeltaError::from)?;
        let eid = entity_id(database, entity_key);

        if let Some(entry) = self.cache.get(&eid) {
            match self.storage.read_metadata(&eid).await {
                Ok(metadata) if metadata.version == entry.version => {
                    return Ok((entry.plaintext, entry.version));
                }
                Ok(_) => {
                    // Another worker moved the entity forward; refresh.
                    return self.load_entity(&eid).await;
                }
                Err(StorageError::NotFound(_)) => {
                    return Err(DeltaError::NotFound(eid));
                }
                Err(e) => {
                    // Storage hiccup during revalidation: the cached copy
                    // is still the best answer available.
                    tracing::debug!(entity_id = %eid, error = %e, "revalidation failed, serving cached copy");
                    return Ok((entry.plaintext, entry.version));
                }
            }
        }

        self.load_entity(&eid).await
    }

    /// PUT path: validate, lock, bump version, encrypt, persist, cache.
    pub async fn put_entity(
        &self,
        database: &str,
        entity_key: &str,
        payload: &[u8],
        schema_id: &str,
    ) -> DeltaResult<u64> {
        validate_name(database).map_err(DeltaError::from)?;
        validate_name(entity_key).map_err(DeltaError::from)?;
        if payload.is_empty() {
            return Err(DeltaError::InvalidArgument("empty payload".to_string()));
        }

        let schema_id = if schema_id.is_empty() {
            database
        } else {
            schema_id
        };

        // Validation happens before the lock; a rejected document must
        // leave storage untouched.
        match self.validator.validate_strict(schema_id, payload).await {
            Ok(()) => {}
            Err(DeltaError::NotFound(what)) => {
                return Err(DeltaError::ValidationFailed(format!("{} is not stored", what)));
            }
            Err(e) => return Err(e),
        }

        let eid = entity_id(database, entity_key);
        let _guard = self
            .locks
            .acquire(&eid, LockMode::Exclusive)
            .await
            .map_err(DeltaError::from)?;

        let version = match self.storage.read_metadata(&eid).await {
            Ok(metadata) => metadata.version + 1,
            Err(StorageError::NotFound(_)) => 1,
            Err(e) => return Err(DeltaError::from(e)),
        };

        let key = self
            .master_key
            .snapshot()
            .map_err(|_| DeltaError::Unavailable("master key not yet distributed".to_string()))?;
        let key_id = self
            .master_key
            .key_id()
            .map_err(|_| DeltaError::Unavailable("master key not yet distributed".to_string()))?;

        let sealed = symmetric::encrypt(key.as_ref(), payload).map_err(|_| DeltaError::Internal)?;

        let metadata = EntityMetadata {
            key_id,
            algorithm: ALGORITHM_AES_GCM.to_string(),
            iv: BASE64.encode(sealed.nonce),
            tag: BASE64.encode(sealed.tag),
            schema_id: schema_id.to_string(),
            version,
            writer_id: self.worker_id.clone(),
            timestamp: Utc::now(),
            database: database.to_string(),
            entity_key: entity_key.to_string(),
        };

        self.storage
            .write_file(&eid, &sealed.ciphertext, &metadata)
            .await
            .map_err(DeltaError::from)?;

        self.cache.set(
            &eid,
            CacheEntry {
                plaintext: payload.to_vec(),
                version,
            },
        );

        tracing::debug!(entity_id = %eid, version, "entity written");
        Ok(version)
    }
}

/// gRPC data-plane endpoint of a Processing Worker.
pub struct ProcessingWorkerService {
    ctx: Arc<WorkerContext>,
}

impl ProcessingWorkerService {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[tonic::async_trait]
impl ProcessingWorker for ProcessingWorkerService {
    async fn process(
        &self,
        request: Request<ProcessRequest>,
    ) -> Result<Response<ProcessResponse>, Status> {
        let request = request.into_inner();

        if !self.ctx.is_token_accepted(&request.token) {
            return Err(Status::unauthenticated("invalid worker token"));
        }

        self.ctx.active_requests.fetch_add(1, Ordering::Relaxed);
        let result = self.process_inner(request).await;
        self.ctx.active_requests.fetch_sub(1, Ordering::Relaxed);
        result.map(Response::new)
    }
}

impl ProcessingWorkerService {
    async fn process_inner(&self, request: ProcessRequest) -> Result<ProcessResponse, Status> {
        if request.database_name.is_empty() || request.entity_key.is_empty() {
            return Err(Status::invalid_argument(
                "database_name and entity_key are required",
            ));
        }

        tracing::debug!(
            client_id = %request.client_id,
            operation = request.operation,
            database = %request.database_name,
            entity_key = %request.entity_key,
            "process request"
        );

        match Operation::try_from(request.operation) {
            Ok(Operation::Get) => {
                let (plaintext, version) = self
                    .ctx
                    .get_entity(&request.database_name, &request.entity_key)
                    .await
                    .map_err(Status::from)?;
                Ok(ProcessResponse {
                    result: plaintext,
                    version,
                })
            }
            Ok(Operation::Put) => {
                let version = self
                    .ctx
                    .put_entity(
                        &request.database_name,
                        &request.entity_key,
                        &request.payload,
                        &request.schema_id,
                    )
                    .await
                    .map_err(Status::from)?;
                Ok(ProcessResponse {
                    result: Vec::new(),
                    version,
                })
            }
            _ => Err(Status::invalid_argument("unsupported operation")),
        }
    }
}

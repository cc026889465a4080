//! # Process Forwarding
//!
//! The Main Worker never touches entity data itself; every entity
//! operation is routed to a Processing Worker and forwarded over gRPC.
//! Channels are cached per worker address so repeated requests to the same
//! worker reuse one HTTP/2 connection.
//!
//! Routing per operation: the affinity worker when it is available and
//! under the overload threshold, otherwise the least-loaded worker,
//! otherwise the caller gets `Unavailable`. Load is incremented around the
//! forward and affinity is updated only on success.

use std::collections::HashMap;
use std::error::Error as _;

use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::error::{DeltaError, DeltaResult};
use crate::proto::processing_worker_client::ProcessingWorkerClient;
use crate::proto::{Operation, ProcessRequest, ProcessResponse};
use crate::registry::WorkerRecord;
use crate::storage::{entity_id, validate_name};

use super::state::AppState;

/// Why a forward did not produce a worker response.
#[derive(Debug)]
pub enum ForwardError {
    /// The worker could not be reached at all.
    Connect(String),
    /// The worker answered with an error status.
    Status(tonic::Status),
}

/// Cached gRPC clients, keyed by worker address.
pub struct Forwarder {
    clients: Mutex<HashMap<String, ProcessingWorkerClient<Channel>>>,
    max_message_size: usize,
}

impl Forwarder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            max_message_size,
        }
    }

    async fn client_for(
        &self,
        address: &str,
    ) -> Result<ProcessingWorkerClient<Channel>, ForwardError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(address) {
            return Ok(client.clone());
        }
        let channel = Channel::from_shared(address.to_string())
            .map_err(|e| ForwardError::Connect(e.to_string()))?
            .connect()
            .await
            .map_err(|e| ForwardError::Connect(e.to_string()))?;
        let client = ProcessingWorkerClient::new(channel)
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size);
        clients.insert(address.to_string(), client.clone());
        Ok(client)
    }

    /// Drop the cached channel for an address after a transport failure.
    async fn evict(&self, address: &str) {
        self.clients.lock().await.remove(address);
    }

    /// Send one Process call to a specific worker.
    pub async fn process(
        &self,
        worker: &WorkerRecord,
        request: ProcessRequest,
    ) -> Result<ProcessResponse, ForwardError> {
        let mut client = self.client_for(&worker.grpc_address).await?;
        match client.process(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                // Transport-level breakage surfaces as Unavailable with a
                // connect-ish source; drop the channel so the next call
                // redials.
                if status.code() == tonic::Code::Unavailable && status.source().is_some() {
                    self.evict(&worker.grpc_address).await;
                    return Err(ForwardError::Connect(status.message().to_string()));
                }
                Err(ForwardError::Status(status))
            }
        }
    }
}

/// Route one entity operation to a worker and forward it.
pub async fn dispatch(
    state: &AppState,
    operation: Operation,
    database: &str,
    entity_key: &str,
    payload: Vec<u8>,
    schema_id: String,
    client_id: &str,
) -> DeltaResult<ProcessResponse> {
    validate_name(database).map_err(DeltaError::from)?;
    validate_name(entity_key).map_err(DeltaError::from)?;
    let eid = entity_id(database, entity_key);

    let worker = state
        .registry
        .select_worker(&eid)
        .ok_or_else(|| DeltaError::Unavailable("no processing worker available".to_string()))?;

    let request = ProcessRequest {
        operation: operation as i32,
        database_name: database.to_string(),
        entity_key: entity_key.to_string(),
        payload,
        schema_id,
        token: worker.token.clone(),
        client_id: client_id.to_string(),
    };

    state.registry.increment_load(&worker.worker_id);
    let result = state.forwarder.process(&worker, request).await;
    state.registry.decrement_load(&worker.worker_id);

    match result {
        Ok(response) => {
            state.registry.update_entity_location(&eid, &worker.worker_id);
            Ok(response)
        }
        Err(ForwardError::Connect(reason)) => {
            tracing::warn!(
                worker_id = %worker.worker_id,
                %reason,
                "worker unreachable, marking unavailable"
            );
            state.registry.unregister(&worker.worker_id);
            Err(DeltaError::Unavailable(
                "processing worker unreachable".to_string(),
            ))
        }
        Err(ForwardError::Status(status)) => Err(DeltaError::from(status)),
    }
}

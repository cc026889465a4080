//! # Main Worker Control Service
//!
//! The tonic service Processing Workers dial: `Subscribe` performs the key
//! distribution handshake, `Heartbeat` keeps registry liveness fresh.
//!
//! Subscribe never sees the master key in the clear on the wire: the
//! worker sends an ephemeral RSA public key and receives the key wrapped
//! under RSA-OAEP/SHA-256. Re-subscription with the same worker id is
//! idempotent; it refreshes the registry record and yields a fresh token,
//! and the previous token stays valid until it expires.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::auth::tokens::TokenPool;
use crate::crypto::keywrap;
use crate::proto::main_worker_server::MainWorker;
use crate::proto::{HeartbeatRequest, HeartbeatResponse, SubscribeRequest, SubscribeResponse};

use super::state::AppState;

/// gRPC control-plane endpoint of the Main Worker.
pub struct MainWorkerService {
    state: Arc<AppState>,
}

impl MainWorkerService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl MainWorker for MainWorkerService {
    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<SubscribeResponse>, Status> {
        let request = request.into_inner();

        if request.worker_id.is_empty() {
            return Err(Status::invalid_argument("worker_id is required"));
        }
        if request.grpc_address.is_empty() {
            return Err(Status::invalid_argument("grpc_address is required"));
        }

        let public_key = keywrap::parse_public_key_pem(&request.public_key_pem)
            .map_err(|e| Status::invalid_argument(format!("public key rejected: {}", e)))?;

        let master_key = self
            .state
            .master_key
            .snapshot()
            .map_err(|_| Status::unavailable("master key not initialized"))?;
        let key_id = self
            .state
            .master_key
            .key_id()
            .map_err(|_| Status::unavailable("master key not initialized"))?;

        let wrapped_key = keywrap::wrap_master_key(&public_key, &master_key)
            .map_err(|_| Status::internal("key wrapping failed"))?;

        let token = self.state.tokens.issue_worker_token(&request.worker_id);
        self.state.registry.register(
            &request.worker_id,
            &key_id,
            &token,
            &request.grpc_address,
            request.tags,
        );

        tracing::info!(
            worker_id = %request.worker_id,
            grpc_address = %request.grpc_address,
            "worker subscribed"
        );

        Ok(Response::new(SubscribeResponse {
            token,
            wrapped_key,
            key_id,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let request = request.into_inner();

        let record = self
            .state
            .tokens
            .validate_in_pool(&request.token, TokenPool::Worker)
            .map_err(|_| Status::unauthenticated("invalid worker token"))?;
        if record.subject != request.worker_id {
            return Err(Status::unauthenticated("token does not match worker"));
        }

        let known = self.state.registry.heartbeat(&request.worker_id);
        Ok(Response::new(HeartbeatResponse { known }))
    }
}

//! # Main Worker
//!
//! The stateless control plane: terminates client REST traffic, runs the
//! subscribe/heartbeat control service for Processing Workers, and routes
//! entity operations to the data plane. The master key lives in RAM here
//! and reaches workers only wrapped under their ephemeral RSA keys.

pub mod forward;
pub mod grpc;
pub mod rest;
pub mod state;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::auth::{ApiKeyManager, AuthGate, TokenManager};
use crate::config::MainConfig;
use crate::crypto::MasterKeyCell;
use crate::proto::main_worker_server::MainWorkerServer;
use crate::registry::WorkerRegistry;
use crate::schema::SchemaValidator;

use forward::Forwarder;
use grpc::MainWorkerService;
use state::AppState;

/// Run the Main Worker until `cancel` fires.
pub async fn run(config: MainConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let (storage, _locks) = config.storage.build()?;

    let master_key = config.resolve_master_key()?;
    let key_id = format!("key-{}", crate::crypto::random_id(8));
    if config.master_key.is_none() {
        tracing::warn!(
            %key_id,
            "no --master-key supplied; generated an ephemeral key, data will be \
             unreadable after restart unless the same key is passed again"
        );
    }

    let api_keys = Arc::new(
        ApiKeyManager::open(config.storage.auth_store_path())
            .context("opening api key store")?,
    );
    let tokens = Arc::new(TokenManager::new(
        config.worker_token_ttl(),
        config.client_token_ttl(),
    ));
    let registry = Arc::new(WorkerRegistry::new());

    let state = Arc::new(AppState {
        master_key: MasterKeyCell::with_key(master_key, key_id.clone()),
        gate: AuthGate::new(config.admin_key.as_deref(), api_keys.clone(), tokens.clone()),
        tokens: tokens.clone(),
        api_keys,
        registry: registry.clone(),
        storage: storage.clone(),
        validator: Arc::new(SchemaValidator::new(storage)),
        forwarder: Forwarder::new(config.max_message_size),
    });

    let sweeper = tokens.clone().start_sweeper(cancel.clone());
    let reaper = registry
        .clone()
        .start_reaper(config.heartbeat_window(), cancel.clone());

    // REST surface.
    let rest_listener = tokio::net::TcpListener::bind(&config.rest_address)
        .await
        .with_context(|| format!("binding rest address {}", config.rest_address))?;
    tracing::info!(address = %config.rest_address, "rest surface listening");
    let rest_state = state.clone();
    let rest_cancel = cancel.clone();
    let rest_server = tokio::spawn(async move {
        axum::serve(rest_listener, rest::create_router(rest_state))
            .with_graceful_shutdown(async move { rest_cancel.cancelled().await })
            .await
    });

    // gRPC control plane.
    let grpc_addr = config
        .grpc_address
        .parse()
        .with_context(|| format!("parsing grpc address {}", config.grpc_address))?;
    tracing::info!(address = %config.grpc_address, %key_id, "control plane listening");
    let grpc_state = state.clone();
    let grpc_cancel = cancel.clone();
    let max_message_size = config.max_message_size;
    let grpc_server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(
                MainWorkerServer::new(MainWorkerService::new(grpc_state))
                    .max_decoding_message_size(max_message_size)
                    .max_encoding_message_size(max_message_size),
            )
            .serve_with_shutdown(grpc_addr, async move { grpc_cancel.cancelled().await })
            .await
    });

    let (rest_result, grpc_result) = tokio::try_join!(rest_server, grpc_server)?;
    rest_result.context("rest server failed")?;
    grpc_result.context("grpc server failed")?;

    sweeper.abort();
    reaper.abort();
    state.master_key.clear();
    Ok(())
}

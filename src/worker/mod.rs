//! # Processing Worker
//!
//! The data plane: subscribes to a Main Worker, holds the unwrapped master
//! key in RAM, and serves GET/PUT entity operations over gRPC against
//! shared storage with a local LRU cache.

pub mod service;
pub mod subscribe;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::cache::EntityCache;
use crate::config::WorkerConfig;
use crate::proto::processing_worker_server::ProcessingWorkerServer;

use service::{ProcessingWorkerService, WorkerContext};
use subscribe::SubscribeConfig;

/// Run a Processing Worker until `cancel` fires.
pub async fn run(config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let (storage, locks) = config.storage.build()?;
    let worker_id = config.resolve_worker_id();

    let ctx = Arc::new(WorkerContext::new(
        worker_id.clone(),
        storage,
        locks,
        EntityCache::new(config.cache_config()),
    ));

    // Data-plane gRPC server.
    let grpc_addr = config
        .grpc_address
        .parse()
        .with_context(|| format!("parsing grpc address {}", config.grpc_address))?;
    tracing::info!(%worker_id, address = %config.grpc_address, "processing worker listening");
    let server_ctx = ctx.clone();
    let server_cancel = cancel.clone();
    let max_message_size = config.max_message_size;
    let server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(
                ProcessingWorkerServer::new(ProcessingWorkerService::new(server_ctx))
                    .max_decoding_message_size(max_message_size)
                    .max_encoding_message_size(max_message_size),
            )
            .serve_with_shutdown(grpc_addr, async move { server_cancel.cancelled().await })
            .await
    });

    // Subscribe handshake and heartbeats.
    let subscribe_config = SubscribeConfig {
        main_address: config.main_address.clone(),
        advertise_address: config.resolve_advertise_address(),
        tags: config.tags.clone(),
        heartbeat_interval: config.heartbeat_interval(),
        max_message_size: config.max_message_size,
    };
    let driver = tokio::spawn(subscribe::run(ctx.clone(), subscribe_config, cancel.clone()));

    let (server_result, ()) = tokio::try_join!(server, driver)?;
    server_result.context("grpc server failed")?;

    ctx.shutdown();
    tracing::info!(%worker_id, "processing worker stopped");
    Ok(())
}

//! # Subscribe Handshake & Heartbeats
//!
//! How a Processing Worker obtains the master key:
//!
//! 1. Generate an ephemeral RSA keypair (in RAM only).
//! 2. Call `Subscribe` on the Main Worker with the public half as PEM.
//! 3. Unwrap the returned master key with the private half, install it in
//!    the key cell, and discard the keypair.
//!
//! Failures retry with capped exponential backoff, bounded by the process
//! cancellation token. After a successful handshake the worker heartbeats
//! on a fixed interval; a heartbeat answered with `known = false` (or an
//! authentication failure after a Main Worker restart) triggers a fresh
//! subscribe.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::crypto::keywrap::WorkerKeyPair;
use crate::proto::main_worker_client::MainWorkerClient;
use crate::proto::{HeartbeatRequest, SubscribeRequest};

use super::service::WorkerContext;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Parameters of the subscribe/heartbeat driver.
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    /// Main Worker gRPC endpoint.
    pub main_address: String,
    /// Address the Main Worker dials back for Process calls.
    pub advertise_address: String,
    pub tags: Vec<String>,
    pub heartbeat_interval: Duration,
    pub max_message_size: usize,
}

async fn connect(config: &SubscribeConfig) -> anyhow::Result<MainWorkerClient<Channel>> {
    let channel = Channel::from_shared(config.main_address.clone())?
        .connect()
        .await?;
    Ok(MainWorkerClient::new(channel)
        .max_decoding_message_size(config.max_message_size)
        .max_encoding_message_size(config.max_message_size))
}

/// One handshake attempt. Returns the issued worker token.
async fn subscribe_once(
    ctx: &WorkerContext,
    config: &SubscribeConfig,
) -> anyhow::Result<String> {
    // RSA keygen is CPU-bound; keep it off the runtime threads.
    let keypair = tokio::task::spawn_blocking(WorkerKeyPair::generate).await??;
    let public_key_pem = keypair.public_key_pem()?;

    let mut client = connect(config).await?;
    let response = client
        .subscribe(SubscribeRequest {
            worker_id: ctx.worker_id.clone(),
            public_key_pem,
            grpc_address: config.advertise_address.clone(),
            tags: config.tags.clone(),
        })
        .await?
        .into_inner();

    let master_key = keypair.unwrap_master_key(&response.wrapped_key)?;
    ctx.master_key.install(*master_key, response.key_id.clone());
    ctx.accept_token(response.token.clone());
    // `keypair` drops here; the ephemeral RSA key never outlives the
    // handshake.

    tracing::info!(
        worker_id = %ctx.worker_id,
        key_id = %response.key_id,
        "subscribed to main worker"
    );
    Ok(response.token)
}

/// Subscribe with exponential backoff until success or cancellation.
async fn subscribe_with_retry(
    ctx: &WorkerContext,
    config: &SubscribeConfig,
    cancel: &CancellationToken,
) -> Option<String> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match subscribe_once(ctx, config).await {
            Ok(token) => return Some(token),
            Err(error) => {
                tracing::warn!(
                    worker_id = %ctx.worker_id,
                    %error,
                    retry_in_ms = backoff.as_millis() as u64,
                    "subscribe failed"
                );
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Drive subscription and heartbeats until `cancel` fires.
pub async fn run(ctx: Arc<WorkerContext>, config: SubscribeConfig, cancel: CancellationToken) {
    'resubscribe: loop {
        let Some(token) = subscribe_with_retry(&ctx, &config, &cancel).await else {
            return;
        };

        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it, we just subscribed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let heartbeat = async {
                let mut client = connect(&config).await?;
                let response = client
                    .heartbeat(HeartbeatRequest {
                        worker_id: ctx.worker_id.clone(),
                        token: token.clone(),
                        active_requests: ctx.active_requests(),
                    })
                    .await?;
                Ok::<bool, anyhow::Error>(response.into_inner().known)
            };

            match heartbeat.await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(worker_id = %ctx.worker_id, "main worker lost our registration, re-subscribing");
                    continue 'resubscribe;
                }
                Err(error) => {
                    // Covers both transport failures and token rejection
                    // after a Main Worker restart.
                    tracing::warn!(worker_id = %ctx.worker_id, %error, "heartbeat failed, re-subscribing");
                    continue 'resubscribe;
                }
            }
        }
    }
}

//! DeltaDatabase entry point.
//!
//! One binary, two roles: `deltadb main` runs the control plane (REST
//! surface, subscribe endpoint, router) and `deltadb worker` runs a data
//! plane worker. Both honor ctrl-c for graceful shutdown.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use deltadb::config::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    tracing::info!(version = deltadb::VERSION, "starting deltadb");

    match cli.command {
        Command::Main(config) => deltadb::server::run(config, cancel).await,
        Command::Worker(config) => deltadb::worker::run(config, cancel).await,
    }
}

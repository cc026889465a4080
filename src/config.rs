//! # Operator Configuration
//!
//! Startup parameters for both roles. Every flag has a `DELTADB_*`
//! environment equivalent; object-store credentials use the conventional
//! `AWS_*` names. The binary exits non-zero on any fatal init failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::storage::{
    FilesystemBackend, FsLockBackend, LockBackend, MemoryLockBackend, S3Backend, S3Config,
    StorageBackend,
};

/// DeltaDatabase - encrypted-at-rest JSON document store.
#[derive(Debug, Parser)]
#[command(name = "deltadb", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the Main Worker: REST surface, subscribe endpoint, router.
    Main(MainConfig),
    /// Run a Processing Worker: subscribe to a Main Worker and serve
    /// entity operations.
    Worker(WorkerConfig),
}

/// Shared-storage selection; exactly one of filesystem or S3 must be
/// configured.
#[derive(Debug, Clone, Args)]
pub struct StorageOptions {
    /// Root directory of the shared filesystem storage.
    #[arg(long, env = "DELTADB_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// S3-compatible endpoint URL (enables the object-store backend).
    #[arg(long, env = "DELTADB_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "DELTADB_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, env = "DELTADB_S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Path-style object addressing (required by MinIO).
    #[arg(long, env = "DELTADB_S3_PATH_STYLE", default_value_t = false)]
    pub s3_path_style: bool,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,
}

impl StorageOptions {
    /// Construct the storage and lock backends this configuration selects.
    pub fn build(&self) -> anyhow::Result<(Arc<dyn StorageBackend>, Arc<dyn LockBackend>)> {
        match (&self.storage_path, &self.s3_endpoint) {
            (Some(path), None) => {
                let storage = Arc::new(FilesystemBackend::open(path)?);
                let locks = Arc::new(FsLockBackend::open(path)?);
                Ok((storage, locks))
            }
            (None, Some(endpoint)) => {
                let bucket = self
                    .s3_bucket
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--s3-bucket is required with --s3-endpoint"))?;
                let access_key = self.aws_access_key_id.clone().ok_or_else(|| {
                    anyhow::anyhow!("AWS_ACCESS_KEY_ID is required with --s3-endpoint")
                })?;
                let secret_key = self.aws_secret_access_key.clone().ok_or_else(|| {
                    anyhow::anyhow!("AWS_SECRET_ACCESS_KEY is required with --s3-endpoint")
                })?;
                let storage = Arc::new(S3Backend::new(S3Config {
                    endpoint: endpoint.trim_end_matches('/').to_string(),
                    bucket,
                    region: self.s3_region.clone(),
                    access_key,
                    secret_key,
                    path_style: self.s3_path_style,
                }));
                let locks = Arc::new(MemoryLockBackend::new());
                Ok((storage, locks))
            }
            (Some(_), Some(_)) => anyhow::bail!(
                "--storage-path and --s3-endpoint are mutually exclusive"
            ),
            (None, None) => anyhow::bail!(
                "one of --storage-path or --s3-endpoint must be configured"
            ),
        }
    }

    /// Local path for stores that must live on the Main Worker's disk
    /// (the API-key store), regardless of the entity backend.
    pub fn auth_store_path(&self) -> PathBuf {
        match &self.storage_path {
            Some(root) => root.join("_auth").join("keys.json"),
            None => PathBuf::from("_auth").join("keys.json"),
        }
    }
}

/// Main Worker parameters.
#[derive(Debug, Args)]
pub struct MainConfig {
    /// Client-facing REST listen address.
    #[arg(long, env = "DELTADB_REST_ADDRESS", default_value = "0.0.0.0:8440")]
    pub rest_address: String,

    /// Internal gRPC listen address (Subscribe/Heartbeat).
    #[arg(long, env = "DELTADB_GRPC_ADDRESS", default_value = "0.0.0.0:8441")]
    pub grpc_address: String,

    #[command(flatten)]
    pub storage: StorageOptions,

    /// Hex-encoded 32-byte master key; generated fresh when omitted.
    #[arg(long, env = "DELTADB_MASTER_KEY", hide_env_values = true)]
    pub master_key: Option<String>,

    /// Operator admin key; dev-mode login is enabled when omitted.
    #[arg(long, env = "DELTADB_ADMIN_KEY", hide_env_values = true)]
    pub admin_key: Option<String>,

    /// Worker token lifetime in seconds.
    #[arg(long, env = "DELTADB_WORKER_TOKEN_TTL", default_value_t = 3600)]
    pub worker_token_ttl: u64,

    /// Client session token lifetime in seconds.
    #[arg(long, env = "DELTADB_CLIENT_TOKEN_TTL", default_value_t = 86400)]
    pub client_token_ttl: u64,

    /// Seconds without a heartbeat before a worker is marked unavailable.
    #[arg(long, env = "DELTADB_HEARTBEAT_WINDOW", default_value_t = 30)]
    pub heartbeat_window: u64,

    /// Maximum gRPC message size in bytes.
    #[arg(long, env = "DELTADB_MAX_MESSAGE_SIZE", default_value_t = 16 * 1024 * 1024)]
    pub max_message_size: usize,
}

impl MainConfig {
    pub fn worker_token_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_token_ttl)
    }

    pub fn client_token_ttl(&self) -> Duration {
        Duration::from_secs(self.client_token_ttl)
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_window)
    }

    /// Decode `--master-key`, or generate a fresh key when omitted.
    pub fn resolve_master_key(&self) -> anyhow::Result<[u8; crate::crypto::MASTER_KEY_SIZE]> {
        match &self.master_key {
            None => Ok(crate::crypto::generate_master_key()),
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)
                    .map_err(|_| anyhow::anyhow!("--master-key must be hex"))?;
                let key: [u8; crate::crypto::MASTER_KEY_SIZE] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("--master-key must decode to 32 bytes"))?;
                Ok(key)
            }
        }
    }
}

/// Processing Worker parameters.
#[derive(Debug, Args)]
pub struct WorkerConfig {
    /// Stable identifier of this worker; generated when omitted.
    #[arg(long, env = "DELTADB_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Main Worker gRPC endpoint, e.g. `http://10.0.0.1:8441`.
    #[arg(long, env = "DELTADB_MAIN_ADDRESS")]
    pub main_address: String,

    /// Local gRPC listen address (Process).
    #[arg(long, env = "DELTADB_WORKER_GRPC_ADDRESS", default_value = "0.0.0.0:8450")]
    pub grpc_address: String,

    /// Address the Main Worker should dial back; defaults to
    /// `http://<grpc-address>`.
    #[arg(long, env = "DELTADB_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<String>,

    #[command(flatten)]
    pub storage: StorageOptions,

    /// Entity cache capacity (number of entities).
    #[arg(long, env = "DELTADB_CACHE_SIZE", default_value_t = 1024)]
    pub cache_size: usize,

    /// Entity cache TTL in seconds; 0 disables expiry.
    #[arg(long, env = "DELTADB_CACHE_TTL", default_value_t = 0)]
    pub cache_ttl: u64,

    /// Free-form scheduling tags reported at subscription.
    #[arg(long, env = "DELTADB_TAGS", value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Seconds between heartbeats to the Main Worker.
    #[arg(long, env = "DELTADB_HEARTBEAT_INTERVAL", default_value_t = 10)]
    pub heartbeat_interval: u64,

    /// Maximum gRPC message size in bytes.
    #[arg(long, env = "DELTADB_MAX_MESSAGE_SIZE", default_value_t = 16 * 1024 * 1024)]
    pub max_message_size: usize,
}

impl WorkerConfig {
    pub fn cache_config(&self) -> crate::cache::CacheConfig {
        crate::cache::CacheConfig {
            capacity: self.cache_size,
            ttl: Duration::from_secs(self.cache_ttl),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn resolve_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", crate::crypto::random_id(4)))
    }

    pub fn resolve_advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.grpc_address.replace("0.0.0.0", "127.0.0.1")))
    }
}

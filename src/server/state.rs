//! Shared state of the Main Worker process.

use std::sync::Arc;

use crate::auth::{ApiKeyManager, AuthGate, TokenManager};
use crate::crypto::MasterKeyCell;
use crate::registry::WorkerRegistry;
use crate::schema::SchemaValidator;
use crate::storage::StorageBackend;

use super::forward::Forwarder;

/// Everything the REST handlers and the gRPC control service share.
pub struct AppState {
    /// Master key held in RAM for wrapping during Subscribe.
    pub master_key: MasterKeyCell,
    pub gate: AuthGate,
    pub tokens: Arc<TokenManager>,
    pub api_keys: Arc<ApiKeyManager>,
    pub registry: Arc<WorkerRegistry>,
    pub storage: Arc<dyn StorageBackend>,
    pub validator: Arc<SchemaValidator>,
    pub forwarder: Forwarder,
}

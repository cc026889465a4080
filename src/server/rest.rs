//! # Client-Facing REST Surface
//!
//! Thin translation layer between HTTP and the core: the auth middleware
//! resolves every bearer credential to a [`Principal`], handlers enforce
//! the per-endpoint permission, and entity operations are dispatched to a
//! Processing Worker through the router. Only `/health` and `/api/login`
//! are public.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{read_write, Permission, PermissionSet, Principal};
use crate::error::{DeltaError, DeltaResult};
use crate::proto::Operation;
use crate::storage::StorageBackend as _;

use super::forward::dispatch;
use super::state::AppState;

/// Build the complete application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/login", post(login))
        .route("/entity/:database", get(get_entity).put(put_entities))
        .route("/schema/:schema_id", put(put_schema))
        .route("/api/keys", get(list_keys).post(create_key))
        .route("/api/keys/:id", delete(delete_key))
        .route("/api/databases", get(list_databases))
        .route("/api/schemas", get(list_schemas))
        .route("/api/workers", get(list_workers))
        .route("/api/me", get(me))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Paths served without a credential.
fn is_public(path: &str) -> bool {
    matches!(path, "/health" | "/api/login")
}

/// Resolve `Authorization: Bearer` and stash the principal in extensions.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if is_public(request.uri().path()) {
        return next.run(request).await;
    }

    let credential = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(credential) = credential else {
        return DeltaError::Unauthenticated.into_response();
    };

    match state.gate.resolve(&credential) {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

fn require(principal: &Principal, permission: Permission) -> DeltaResult<()> {
    if principal.allows(permission) {
        Ok(())
    } else {
        Err(DeltaError::PermissionDenied(format!(
            "requires {:?} permission",
            permission
        )))
    }
}

fn sorted_permissions(set: &PermissionSet) -> Vec<Permission> {
    let mut list: Vec<Permission> = set.iter().copied().collect();
    list.sort_by_key(|p| match p {
        Permission::Read => 0,
        Permission::Write => 1,
        Permission::Admin => 2,
    });
    list
}

// ============================================================================
// Public endpoints
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    /// Admin key or API key secret.
    key: Option<String>,
    /// Dev-mode identity; accepted only when no admin key is configured.
    client_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    client_id: String,
    expires_at: DateTime<Utc>,
    permissions: Vec<Permission>,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> DeltaResult<Json<LoginResponse>> {
    let (client_id, permissions) = match (body.key, body.client_id) {
        (Some(key), _) => {
            let principal = state.gate.authenticate_key(&key)?;
            (principal.client_id, principal.permissions)
        }
        (None, Some(client_id)) => {
            if state.gate.has_admin_key() {
                // Dev-mode identities are only honored on unsecured
                // deployments.
                return Err(DeltaError::Unauthenticated);
            }
            if client_id.is_empty() {
                return Err(DeltaError::InvalidArgument("client_id is empty".to_string()));
            }
            (client_id, read_write())
        }
        (None, None) => {
            return Err(DeltaError::InvalidArgument(
                "either key or client_id is required".to_string(),
            ))
        }
    };

    let (token, expires_at) = state
        .tokens
        .issue_client_token(&client_id, permissions.clone());

    Ok(Json(LoginResponse {
        token,
        client_id,
        expires_at,
        permissions: sorted_permissions(&permissions),
    }))
}

// ============================================================================
// Entity operations
// ============================================================================

#[derive(Debug, Deserialize)]
struct EntityQuery {
    key: String,
}

async fn get_entity(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(database): Path<String>,
    Query(query): Query<EntityQuery>,
) -> DeltaResult<Response> {
    require(&principal, Permission::Read)?;

    let response = dispatch(
        &state,
        Operation::Get,
        &database,
        &query.key,
        Vec::new(),
        String::new(),
        &principal.client_id,
    )
    .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::HeaderName::from_static("x-entity-version"),
                response.version.to_string(),
            ),
        ],
        response.result,
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct PutResponse {
    ok: bool,
    versions: BTreeMap<String, u64>,
}

async fn put_entities(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(database): Path<String>,
    Query(query): Query<PutQuery>,
    Json(body): Json<BTreeMap<String, serde_json::Value>>,
) -> DeltaResult<Json<PutResponse>> {
    require(&principal, Permission::Write)?;

    if body.is_empty() {
        return Err(DeltaError::InvalidArgument(
            "request body contains no entities".to_string(),
        ));
    }

    let schema_id = query.schema.unwrap_or_else(|| database.clone());
    let mut versions = BTreeMap::new();

    // Each entity is validated and routed independently; the batch fails
    // fast on the first rejection.
    for (entity_key, document) in &body {
        let payload =
            serde_json::to_vec(document).map_err(|_| DeltaError::Internal)?;
        let response = dispatch(
            &state,
            Operation::Put,
            &database,
            entity_key,
            payload,
            schema_id.clone(),
            &principal.client_id,
        )
        .await?;
        versions.insert(entity_key.clone(), response.version);
    }

    Ok(Json(PutResponse {
        ok: true,
        versions,
    }))
}

#[derive(Debug, Deserialize)]
struct PutQuery {
    schema: Option<String>,
}

// ============================================================================
// Schema management
// ============================================================================

async fn put_schema(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(schema_id): Path<String>,
    body: axum::body::Bytes,
) -> DeltaResult<Json<serde_json::Value>> {
    require(&principal, Permission::Write)?;
    crate::storage::validate_name(&schema_id).map_err(DeltaError::from)?;

    state.validator.save_template(&schema_id, &body).await?;
    tracing::info!(schema_id = %schema_id, "schema template stored");
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn list_schemas(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> DeltaResult<Json<Vec<String>>> {
    require(&principal, Permission::Read)?;
    Ok(Json(state.validator.list_available_templates().await?))
}

// ============================================================================
// API-key management
// ============================================================================

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> DeltaResult<Json<Vec<crate::auth::ApiKeySummary>>> {
    require(&principal, Permission::Admin)?;
    Ok(Json(state.api_keys.list_keys()))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    permissions: Vec<Permission>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateKeyResponse {
    id: String,
    name: String,
    /// Shown exactly once; only a hash is stored.
    secret: String,
    permissions: Vec<Permission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    enabled: bool,
    created_at: DateTime<Utc>,
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateKeyRequest>,
) -> DeltaResult<Json<CreateKeyResponse>> {
    require(&principal, Permission::Admin)?;

    if body.name.is_empty() {
        return Err(DeltaError::InvalidArgument("name is empty".to_string()));
    }
    if body.permissions.is_empty() {
        return Err(DeltaError::InvalidArgument(
            "permissions must not be empty".to_string(),
        ));
    }

    let permissions: PermissionSet = body.permissions.iter().copied().collect();
    let (record, secret) = state
        .api_keys
        .create_key(&body.name, permissions, body.expires_at)
        .map_err(DeltaError::from)?;

    tracing::info!(key_id = %record.id, name = %record.name, "api key created");

    Ok(Json(CreateKeyResponse {
        id: record.id,
        name: record.name,
        secret,
        permissions: sorted_permissions(&record.permissions),
        expires_at: record.expires_at,
        enabled: record.enabled,
        created_at: record.created_at,
    }))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> DeltaResult<Json<serde_json::Value>> {
    require(&principal, Permission::Admin)?;
    state.api_keys.delete_key(&id).map_err(DeltaError::from)?;
    tracing::info!(key_id = %id, "api key deleted");
    Ok(Json(serde_json::json!({"ok": true})))
}

// ============================================================================
// Introspection
// ============================================================================

async fn list_databases(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> DeltaResult<Json<Vec<String>>> {
    require(&principal, Permission::Read)?;

    let ids = state.storage.list_files().await.map_err(DeltaError::from)?;
    let databases: BTreeSet<String> = ids
        .iter()
        .filter_map(|id| id.split_once('_').map(|(db, _)| db.to_string()))
        .collect();
    Ok(Json(databases.into_iter().collect()))
}

async fn list_workers(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> DeltaResult<Json<Vec<crate::registry::WorkerView>>> {
    require(&principal, Permission::Admin)?;
    Ok(Json(state.registry.list_workers()))
}

#[derive(Debug, Serialize)]
struct MeResponse {
    client_id: String,
    permissions: Vec<Permission>,
    is_admin: bool,
}

async fn me(Extension(principal): Extension<Principal>) -> Json<MeResponse> {
    Json(MeResponse {
        client_id: principal.client_id.clone(),
        permissions: sorted_permissions(&principal.permissions),
        is_admin: principal.is_admin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyManager, AuthGate, TokenManager};
    use crate::crypto::MasterKeyCell;
    use crate::registry::WorkerRegistry;
    use crate::schema::SchemaValidator;
    use crate::server::forward::Forwarder;
    use crate::storage::FilesystemBackend;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(admin_key: Option<&str>) -> (TempDir, Arc<AppState>) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FilesystemBackend::open(dir.path()).unwrap());
        let api_keys =
            Arc::new(ApiKeyManager::open(dir.path().join("_auth/keys.json")).unwrap());
        let tokens = Arc::new(TokenManager::new(
            Duration::from_secs(3600),
            Duration::from_secs(86400),
        ));
        let state = Arc::new(AppState {
            master_key: MasterKeyCell::with_key(crate::crypto::generate_master_key(), "key-1"),
            gate: AuthGate::new(admin_key, api_keys.clone(), tokens.clone()),
            tokens,
            api_keys,
            registry: Arc::new(WorkerRegistry::new()),
            storage: storage.clone(),
            validator: Arc::new(SchemaValidator::new(storage)),
            forwarder: Forwarder::new(16 * 1024 * 1024),
        });
        (dir, state)
    }

    async fn request(
        router: &Router,
        method: &str,
        path: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = HttpRequest::builder().method(method).uri(path);
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (_dir, state) = test_state(None);
        let router = create_router(state);
        let (status, body) = request(&router, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_protected_routes_reject_anonymous() {
        let (_dir, state) = test_state(Some("admin-secret"));
        let router = create_router(state);
        for path in ["/entity/chatdb?key=x", "/api/keys", "/api/me", "/api/databases"] {
            let (status, _) = request(&router, "GET", path, None, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "path {}", path);
        }
    }

    #[tokio::test]
    async fn test_admin_login_grants_all_permissions() {
        let (_dir, state) = test_state(Some("admin-secret"));
        let router = create_router(state);

        let (status, body) = request(
            &router,
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({"key": "admin-secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["permissions"], serde_json::json!(["read", "write", "admin"]));

        let token = body["token"].as_str().unwrap().to_string();
        let (status, body) = request(&router, "GET", "/api/keys", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_dev_login_only_without_admin_key() {
        let (_dir, state) = test_state(Some("admin-secret"));
        let router = create_router(state);
        let (status, _) = request(
            &router,
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({"client_id": "dev"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_dir, state) = test_state(None);
        let router = create_router(state);
        let (status, body) = request(
            &router,
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({"client_id": "dev"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["client_id"], "dev");
        assert_eq!(body["permissions"], serde_json::json!(["read", "write"]));
    }

    #[tokio::test]
    async fn test_key_lifecycle_over_rest() {
        let (_dir, state) = test_state(Some("admin-secret"));
        let router = create_router(state);

        let (_, login) = request(
            &router,
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({"key": "admin-secret"})),
        )
        .await;
        let admin = login["token"].as_str().unwrap().to_string();

        let (status, created) = request(
            &router,
            "POST",
            "/api/keys",
            Some(&admin),
            Some(serde_json::json!({"name": "ci", "permissions": ["read"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let secret = created["secret"].as_str().unwrap().to_string();
        let key_id = created["id"].as_str().unwrap().to_string();
        assert!(secret.starts_with("dk_"));

        // Listing never exposes secrets.
        let (_, listed) = request(&router, "GET", "/api/keys", Some(&admin), None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert!(!listed.to_string().contains(&secret));

        // The read-only key can read but cannot manage keys or write.
        let (status, me) = request(&router, "GET", "/api/me", Some(&secret), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["permissions"], serde_json::json!(["read"]));
        let (status, _) = request(&router, "GET", "/api/keys", Some(&secret), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = request(
            &router,
            "PUT",
            "/entity/chatdb",
            Some(&secret),
            Some(serde_json::json!({"Doc_1": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = request(
            &router,
            "DELETE",
            &format!("/api/keys/{}", key_id),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (status, _) = request(&router, "GET", "/api/me", Some(&secret), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_entity_ops_without_workers_are_unavailable() {
        let (_dir, state) = test_state(None);
        let router = create_router(state);
        let (_, login) = request(
            &router,
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({"client_id": "dev"})),
        )
        .await;
        let token = login["token"].as_str().unwrap().to_string();

        let (status, body) =
            request(&router, "GET", "/entity/chatdb?key=Chat_42", Some(&token), None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "unavailable");
    }

    #[tokio::test]
    async fn test_schema_upload_and_listing() {
        let (_dir, state) = test_state(None);
        let router = create_router(state);
        let (_, login) = request(
            &router,
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({"client_id": "dev"})),
        )
        .await;
        let token = login["token"].as_str().unwrap().to_string();

        let (status, body) = request(
            &router,
            "PUT",
            "/schema/chat.v1",
            Some(&token),
            Some(serde_json::json!({"type": "object"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (status, body) = request(&router, "GET", "/api/schemas", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!(["chat.v1"]));
    }

    #[tokio::test]
    async fn test_databases_listing_empty() {
        let (_dir, state) = test_state(None);
        let router = create_router(state);
        let (_, login) = request(
            &router,
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({"client_id": "dev"})),
        )
        .await;
        let token = login["token"].as_str().unwrap().to_string();

        let (status, body) = request(&router, "GET", "/api/databases", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }
}

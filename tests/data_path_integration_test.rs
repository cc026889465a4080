//! End-to-end tests over the real wire: a Main Worker (REST + control
//! plane) and Processing Workers connected through the actual subscribe
//! handshake, exchanging entity operations over gRPC against shared
//! filesystem storage.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use deltadb::auth::{ApiKeyManager, AuthGate, TokenManager};
use deltadb::cache::{CacheConfig, EntityCache};
use deltadb::crypto::{generate_master_key, MasterKeyCell};
use deltadb::proto::main_worker_server::MainWorkerServer;
use deltadb::proto::processing_worker_server::ProcessingWorkerServer;
use deltadb::registry::WorkerRegistry;
use deltadb::schema::SchemaValidator;
use deltadb::server::forward::Forwarder;
use deltadb::server::grpc::MainWorkerService;
use deltadb::server::rest::create_router;
use deltadb::server::state::AppState;
use deltadb::storage::{FilesystemBackend, FsLockBackend, StorageBackend};
use deltadb::worker::service::{ProcessingWorkerService, WorkerContext};
use deltadb::worker::subscribe::{self, SubscribeConfig};

const CHAT_SCHEMA: &str = r#"{
    "type": "object",
    "required": ["chat"],
    "properties": {
        "chat": {
            "type": "array",
            "items": {
                "type": "object",
                "required": ["type", "text"],
                "properties": {
                    "type": {"enum": ["user", "assistant"]},
                    "text": {"type": "string", "minLength": 1}
                }
            }
        }
    }
}"#;

struct Cluster {
    _dir: TempDir,
    state: Arc<AppState>,
    router: axum::Router,
    cancel: CancellationToken,
    workers: Vec<Arc<WorkerContext>>,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}

async fn serve_main_grpc(
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpListenerStream::new(listener);
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(MainWorkerServer::new(MainWorkerService::new(state)))
            .serve_with_incoming_shutdown(incoming, async move { cancel.cancelled().await })
            .await
            .unwrap();
    });
    addr
}

async fn serve_worker_grpc(
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpListenerStream::new(listener);
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(ProcessingWorkerServer::new(ProcessingWorkerService::new(ctx)))
            .serve_with_incoming_shutdown(incoming, async move { cancel.cancelled().await })
            .await
            .unwrap();
    });
    addr
}

/// Boot a Main Worker and `worker_count` Processing Workers over real
/// sockets, sharing one filesystem storage root.
async fn start_cluster(admin_key: Option<&str>, worker_count: usize) -> Cluster {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let storage: Arc<dyn StorageBackend> = Arc::new(FilesystemBackend::open(dir.path()).unwrap());
    storage
        .write_template("chat.v1", CHAT_SCHEMA.as_bytes())
        .await
        .unwrap();

    let api_keys = Arc::new(ApiKeyManager::open(dir.path().join("_auth/keys.json")).unwrap());
    let tokens = Arc::new(TokenManager::new(
        Duration::from_secs(3600),
        Duration::from_secs(86400),
    ));
    let state = Arc::new(AppState {
        master_key: MasterKeyCell::with_key(generate_master_key(), "key-itest"),
        gate: AuthGate::new(admin_key, api_keys.clone(), tokens.clone()),
        tokens,
        api_keys,
        registry: Arc::new(WorkerRegistry::new()),
        storage: storage.clone(),
        validator: Arc::new(SchemaValidator::new(storage)),
        forwarder: Forwarder::new(16 * 1024 * 1024),
    });

    let main_addr = serve_main_grpc(state.clone(), cancel.clone()).await;

    let mut workers = Vec::new();
    for i in 0..worker_count {
        let worker_storage = Arc::new(FilesystemBackend::open(dir.path()).unwrap());
        let locks = Arc::new(FsLockBackend::open(dir.path()).unwrap());
        let ctx = Arc::new(WorkerContext::new(
            format!("itest-worker-{}", i),
            worker_storage,
            locks,
            EntityCache::new(CacheConfig::default()),
        ));

        let worker_addr = serve_worker_grpc(ctx.clone(), cancel.clone()).await;

        tokio::spawn(subscribe::run(
            ctx.clone(),
            SubscribeConfig {
                main_address: format!("http://{}", main_addr),
                advertise_address: format!("http://{}", worker_addr),
                tags: vec![],
                heartbeat_interval: Duration::from_secs(5),
                max_message_size: 16 * 1024 * 1024,
            },
            cancel.clone(),
        ));

        // Wait for the handshake to distribute the key.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !ctx.master_key.is_ready() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker {} never completed the subscribe handshake",
                i
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        workers.push(ctx);
    }

    let router = create_router(state.clone());
    Cluster {
        _dir: dir,
        state,
        router,
        cancel,
        workers,
    }
}

async fn call(
    cluster: &Cluster,
    method: &str,
    path: &str,
    bearer: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(path);
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
    let response = cluster.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, bytes)
}

async fn dev_login(cluster: &Cluster) -> String {
    let (status, body) = call(
        cluster,
        "POST",
        "/api/login",
        None,
        Some(serde_json::json!({"client_id": "itest"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    json["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_subscribe_then_get_miss_is_404() {
    let cluster = start_cluster(None, 1).await;
    let token = dev_login(&cluster).await;

    let (status, _) = call(
        &cluster,
        "GET",
        "/entity/chatdb?key=Chat_42",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_put_then_get_round_trip() {
    let cluster = start_cluster(None, 1).await;
    let token = dev_login(&cluster).await;

    let document = serde_json::json!({"chat": [{"type": "user", "text": "hi"}]});
    let (status, body) = call(
        &cluster,
        "PUT",
        "/entity/chatdb?schema=chat.v1",
        Some(&token),
        Some(serde_json::json!({"Chat_42": document})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["versions"]["Chat_42"], 1);

    let request = Request::builder()
        .method("GET")
        .uri("/entity/chatdb?key=Chat_42")
        .header("Authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let response = cluster.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-entity-version")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let returned: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(returned, document);

    // Second write bumps the version.
    let (status, body) = call(
        &cluster,
        "PUT",
        "/entity/chatdb?schema=chat.v1",
        Some(&token),
        Some(serde_json::json!({"Chat_42": document})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["versions"]["Chat_42"], 2);
}

#[tokio::test]
async fn test_schema_rejection_writes_nothing() {
    let cluster = start_cluster(None, 1).await;
    let token = dev_login(&cluster).await;

    let (status, _) = call(
        &cluster,
        "PUT",
        "/entity/chatdb?schema=chat.v1",
        Some(&token),
        Some(serde_json::json!({"Chat_42": {"chat": [{"type": "bogus", "text": ""}]}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(
        &cluster,
        "GET",
        "/entity/chatdb?key=Chat_42",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ciphertext_tampering_is_opaque_internal_error() {
    let cluster = start_cluster(None, 1).await;
    let token = dev_login(&cluster).await;

    let (status, _) = call(
        &cluster,
        "PUT",
        "/entity/chatdb?schema=chat.v1",
        Some(&token),
        Some(serde_json::json!({"Chat_42": {"chat": [{"type": "user", "text": "hi"}]}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Drop worker caches, then corrupt one byte of the blob out of band.
    for worker in &cluster.workers {
        worker.cache.close();
    }
    let blob_path = cluster._dir.path().join("files/chatdb_Chat_42.json.enc");
    let mut blob = std::fs::read(&blob_path).unwrap();
    blob[0] ^= 1;
    std::fs::write(&blob_path, blob).unwrap();

    let (status, body) = call(
        &cluster,
        "GET",
        "/entity/chatdb?key=Chat_42",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    // Opaque to clients: no plaintext, no key material, no paths.
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "internal");
    assert!(json.get("detail").is_none());
}

#[tokio::test]
async fn test_affinity_routes_repeat_reads_to_same_worker() {
    let cluster = start_cluster(None, 2).await;
    let token = dev_login(&cluster).await;

    let (status, _) = call(
        &cluster,
        "PUT",
        "/entity/chatdb?schema=chat.v1",
        Some(&token),
        Some(serde_json::json!({"Doc_7": {"chat": [{"type": "user", "text": "x"}]}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let first = cluster
        .state
        .registry
        .find_worker_for_entity("chatdb_Doc_7")
        .expect("affinity recorded after the write")
        .worker_id;

    // Repeat reads stick to the affinity worker even though the other
    // worker is idle.
    for _ in 0..4 {
        let (status, _) = call(
            &cluster,
            "GET",
            "/entity/chatdb?key=Doc_7",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let current = cluster
            .state
            .registry
            .find_worker_for_entity("chatdb_Doc_7")
            .unwrap()
            .worker_id;
        assert_eq!(current, first);
    }
}

#[tokio::test]
async fn test_admin_login_and_key_management() {
    let cluster = start_cluster(Some("it-admin-key"), 1).await;

    let (status, body) = call(
        &cluster,
        "POST",
        "/api/login",
        None,
        Some(serde_json::json!({"key": "it-admin-key"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let login: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        login["permissions"],
        serde_json::json!(["read", "write", "admin"])
    );
    let session = login["token"].as_str().unwrap().to_string();

    let (status, body) = call(&cluster, "GET", "/api/keys", Some(&session), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
        serde_json::json!([])
    );

    let (status, body) = call(&cluster, "GET", "/api/workers", Some(&session), None).await;
    assert_eq!(status, StatusCode::OK);
    let workers: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(workers.as_array().unwrap().len(), 1);
    assert_eq!(workers[0]["status"], "available");
}

#[tokio::test]
async fn test_databases_listing_after_writes() {
    let cluster = start_cluster(None, 1).await;
    let token = dev_login(&cluster).await;

    for db in ["beta", "alpha"] {
        let (status, _) = call(
            &cluster,
            "PUT",
            &format!("/entity/{}?schema=chat.v1", db),
            Some(&token),
            Some(serde_json::json!({"Doc_1": {"chat": []}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(&cluster, "GET", "/api/databases", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let databases: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(databases, vec!["alpha", "beta"]);
}

//! Integration tests for the docpipe-server API routes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tower::ServiceExt;

use docpipe_core::config::Config;
use docpipe_core::events::{user_topic, EventBus, EventKind};
use docpipe_core::object_store::{MemoryObjectStore, ObjectStore};
use docpipe_core::pipeline::UploadJob;
use docpipe_core::storage::{self, audit, documents, DbPool};

use docpipe_server::state::AppState;

/// Alice's API token used across the tests.
const ALICE_TOKEN: &str = "token-alice-abc123";
/// Bob's API token, for ownership checks.
const BOB_TOKEN: &str = "token-bob-xyz789";

struct TestServer {
    router: axum::Router,
    db: DbPool,
    bus: Arc<EventBus>,
    store: Arc<MemoryObjectStore>,
    ingest: mpsc::Receiver<UploadJob>,
}

async fn test_server() -> TestServer {
    test_server_with(|_| {}).await
}

async fn test_server_with(mutate: impl FnOnce(&mut Config)) -> TestServer {
    let db = storage::init_test_db().await.expect("init test db");
    let bus = EventBus::new();
    let store = Arc::new(MemoryObjectStore::new());
    let (ingest_tx, ingest_rx) = docpipe_core::pipeline::ingest_channel();

    let mut config = Config::default();
    config.database.url = "sqlite::memory:".to_string();
    config.object_store.bucket = "docs".to_string();
    config
        .server
        .api_tokens
        .insert(ALICE_TOKEN.to_string(), "alice".to_string());
    config
        .server
        .api_tokens
        .insert(BOB_TOKEN.to_string(), "bob".to_string());
    mutate(&mut config);

    let state = Arc::new(AppState {
        db: db.clone(),
        config,
        bus: Arc::clone(&bus),
        store: Arc::clone(&store) as Arc<dyn ObjectStore>,
        ingest: ingest_tx,
    });

    TestServer {
        router: docpipe_server::build_router(state),
        db,
        bus,
        store,
        ingest: ingest_rx,
    }
}

async fn send(
    router: &axum::Router,
    request: Request<Body>,
) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.expect("send request");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("read body");
    let json = serde_json::from_slice(&bytes.to_bytes()).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("build request")
}

fn post_json(path: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).expect("serialize")))
        .expect("build request")
}

fn put_json(path: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(path)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).expect("serialize")))
        .expect("build request")
}

const BOUNDARY: &str = "X-DOCPIPE-TEST-BOUNDARY";

fn multipart_upload(
    token: &str,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/documents")
        .header("Authorization", format!("Bearer {token}"))
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("build request")
}

/// Seed a document directly in the store, bypassing upload.
async fn seed_document(db: &DbPool, id: &str, user: &str) {
    documents::insert(
        db,
        &documents::NewDocument {
            id,
            user_id: user,
            object_key: &format!("documents/{user}/1_{id}.pdf"),
            bucket: "docs",
            file_size: 1024,
            mime_type: "application/pdf",
            original_filename: "scan.pdf",
        },
    )
    .await
    .expect("seed document");
}

// ── Auth ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_needs_no_auth() {
    let server = test_server().await;
    let request = Request::builder()
        .uri("/api/health")
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let server = test_server().await;
    let request = Request::builder()
        .uri("/api/documents")
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let server = test_server().await;
    let (status, _) = send(&server.router, get("/api/documents", "bogus")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn event_stream_requires_auth() {
    let server = test_server().await;
    let request = Request::builder()
        .uri("/api/events")
        .body(Body::empty())
        .expect("build request");
    let response = server
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("send request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ── Upload ───────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_rejects_unsupported_mime() {
    let server = test_server().await;
    let request = multipart_upload(ALICE_TOKEN, "notes.txt", "text/plain", b"hello");
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .expect("error text")
        .contains("unsupported content type"));
}

#[tokio::test]
async fn upload_rejects_oversize_file() {
    let server = test_server_with(|config| {
        config.limits.max_file_size = 1024;
    })
    .await;
    let request = multipart_upload(
        ALICE_TOKEN,
        "scan.pdf",
        "application/pdf",
        &vec![0u8; 4096],
    );
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .expect("error text")
        .contains("maximum size"));
}

#[tokio::test]
async fn upload_rejects_empty_file() {
    let server = test_server().await;
    let request = multipart_upload(ALICE_TOKEN, "scan.pdf", "application/pdf", b"");
    let (status, _) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_stores_inserts_and_enqueues() {
    let mut server = test_server().await;
    let mut events = server
        .bus
        .subscribe(&user_topic("alice"))
        .expect("subscribe");

    let request = multipart_upload(ALICE_TOKEN, "Q1 invoice.pdf", "application/pdf", b"%PDF-1.4");
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "PROCESSING");
    assert_eq!(body["filename"], "Q1 invoice.pdf");
    let id = body["id"].as_str().expect("id").to_string();

    // Bytes landed in the object store under the sanitized key.
    assert_eq!(server.store.len(), 1);

    // The ingest event carries the same identifiers.
    let job = server.ingest.recv().await.expect("ingest job");
    assert_eq!(job.document_id, id);
    assert_eq!(job.user_id, "alice");
    assert_eq!(job.mime_type, "application/pdf");
    assert!(job.object_key.starts_with("documents/alice/"));
    assert!(job.object_key.ends_with("_Q1_invoice.pdf"));

    // And the created event reached the subscriber.
    let event = events.try_recv().expect("created event");
    assert_eq!(event.kind, EventKind::Created);
    assert_eq!(event.document.id, id);
}

// ── Fetch / list / ownership ─────────────────────────────────────────

#[tokio::test]
async fn fetch_is_owner_scoped() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;

    let (status, body) = send(&server.router, get("/api/documents/doc-1", ALICE_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "doc-1");

    // Bob sees a 404, not a 403, so ids cannot be probed.
    let (status, _) = send(&server.router, get("/api/documents/doc-1", BOB_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_returns_only_own_documents() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;
    seed_document(&server.db, "doc-2", "bob").await;

    let (status, body) = send(&server.router, get("/api/documents", ALICE_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    let docs = body["documents"].as_array().expect("array");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["id"], "doc-1");
}

#[tokio::test]
async fn download_url_is_owner_scoped() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;

    let (status, body) = send(
        &server.router,
        get("/api/documents/doc-1/download", ALICE_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().expect("url").contains("doc-1"));
    assert_eq!(body["expires_in_secs"], 900);

    let (status, _) = send(
        &server.router,
        get("/api/documents/doc-1/download", BOB_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── Retry ────────────────────────────────────────────────────────────

#[tokio::test]
async fn retry_rejected_while_processing() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;

    let (status, _) = send(
        &server.router,
        post_json("/api/documents/doc-1/retry", ALICE_TOKEN, serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn retry_resets_and_republishes() {
    let mut server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;
    documents::mark_failed(&server.db, "doc-1", "provider exhausted")
        .await
        .expect("fail");

    let (status, body) = send(
        &server.router,
        post_json("/api/documents/doc-1/retry", ALICE_TOKEN, serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PROCESSING");
    assert!(body["error_message"].is_null());

    let job = server.ingest.recv().await.expect("ingest job");
    assert_eq!(job.document_id, "doc-1");
}

// ── Review flow ──────────────────────────────────────────────────────

#[tokio::test]
async fn save_corrected_rejected_unless_under_review() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;

    let (status, _) = send(
        &server.router,
        put_json(
            "/api/documents/doc-1/data",
            ALICE_TOKEN,
            serde_json::json!({"data": {"total": 12}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn save_corrected_then_approve_completes_at_full_confidence() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;
    documents::finalize(&server.db, "doc-1", r#"{"total": 10}"#, 0.42, true)
        .await
        .expect("finalize");

    let (status, body) = send(
        &server.router,
        put_json(
            "/api/documents/doc-1/data",
            ALICE_TOKEN,
            serde_json::json!({"data": {"total": 12, "currency": "USD"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "NEEDS_REVIEW");
    assert_eq!(body["confidence"], 0.95);
    assert_eq!(body["parsed_data"]["total"], 12);

    // Approve with no further edits.
    let request = Request::builder()
        .method("POST")
        .uri("/api/documents/doc-1/approve")
        .header("Authorization", format!("Bearer {ALICE_TOKEN}"))
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["confidence"], 1.0);
    assert_eq!(body["parsed_data"]["total"], 12);
    assert!(!body["reviewed_at"].is_null());
}

#[tokio::test]
async fn approve_with_edits_overwrites_data() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;
    documents::finalize(&server.db, "doc-1", r#"{"total": 10}"#, 0.42, true)
        .await
        .expect("finalize");

    let (status, body) = send(
        &server.router,
        post_json(
            "/api/documents/doc-1/approve",
            ALICE_TOKEN,
            serde_json::json!({"data": {"total": 99}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["parsed_data"]["total"], 99);
    assert_eq!(body["confidence"], 1.0);
}

#[tokio::test]
async fn approve_rejected_unless_under_review() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;

    let (status, _) = send(
        &server.router,
        post_json("/api/documents/doc-1/approve", ALICE_TOKEN, serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ── Delete ───────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_archives_and_removes_bytes() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;
    server
        .store
        .put("documents/alice/1_doc-1.pdf", b"%PDF".to_vec(), "application/pdf")
        .await
        .expect("seed bytes");

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/documents/doc-1")
        .header("Authorization", format!("Bearer {ALICE_TOKEN}"))
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ARCHIVED");

    let row = documents::get(&server.db, "doc-1")
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.status, "ARCHIVED");

    // Object deletion is async best-effort; give it a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.store.is_empty());
}

// ── Audit ────────────────────────────────────────────────────────────

#[tokio::test]
async fn audit_trail_is_owner_scoped() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;
    audit::insert(
        &server.db,
        &audit::NewAuditRecord {
            document_id: "doc-1".to_string(),
            stage: "CLASSIFICATION".to_string(),
            provider: "anthropic".to_string(),
            model: "stub-model".to_string(),
            prompt_id: "classify.v1".to_string(),
            prompt_text: "prompt".to_string(),
            raw_response: "{}".to_string(),
            extracted_data: None,
            confidence: Some(0.9),
            processing_ms: 120,
            input_tokens: 1000,
            output_tokens: 50,
            cost_estimate: 0.004,
        },
    )
    .await
    .expect("insert audit");

    let (status, body) = send(
        &server.router,
        get("/api/documents/doc-1/audit", ALICE_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"].as_array().expect("records").len(), 1);
    assert_eq!(body["records"][0]["stage"], "CLASSIFICATION");
    assert_eq!(body["stages"][0]["calls"], 1);

    let (status, _) = send(&server.router, get("/api/documents/doc-1/audit", BOB_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn audit_summary_reports_totals() {
    let server = test_server().await;
    seed_document(&server.db, "doc-1", "alice").await;
    for provider in ["anthropic", "anthropic", "openai"] {
        audit::insert(
            &server.db,
            &audit::NewAuditRecord {
                document_id: "doc-1".to_string(),
                stage: "VALIDATION".to_string(),
                provider: provider.to_string(),
                model: "stub-model".to_string(),
                prompt_id: "validate.v1".to_string(),
                prompt_text: "prompt".to_string(),
                raw_response: "{}".to_string(),
                extracted_data: None,
                confidence: Some(0.8),
                processing_ms: 100,
                input_tokens: 500,
                output_tokens: 20,
                cost_estimate: 0.002,
            },
        )
        .await
        .expect("insert audit");
    }

    let (status, body) = send(&server.router, get("/api/audit/summary", ALICE_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_calls"], 3);
    assert_eq!(body["total_input_tokens"], 1500);
    assert_eq!(body["by_provider"][0]["provider"], "anthropic");
    assert_eq!(body["by_provider"][0]["calls"], 2);

    let (status, body) = send(
        &server.router,
        get("/api/audit/summary?provider=openai", ALICE_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_calls"], 1);
}

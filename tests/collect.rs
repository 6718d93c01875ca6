//! End-to-end collection tests against an in-process stub of the remote
//! mail API: token endpoint, paged user and message listings, mailbox
//! probes, MIME and attachment fetches.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use mailvault::collector::{collect_tenant, CollectOptions};
use mailvault::config::{
    CollectionConfig, Config, DbConfig, GraphConfig, ServerConfig, TenantEntry,
};
use mailvault::error::CollectError;
use mailvault::indexer::DisabledIndexer;
use mailvault::models::Tenant;
use mailvault::runner::{run_collection, RunOptions};
use mailvault::store::SnapshotStore;
use mailvault::task::{TaskRegistry, TaskState};
use mailvault::{db, migrate};

/// Five messages per mailbox, served in `$top`-sized pages.
const MESSAGES_PER_USER: usize = 5;

#[derive(Clone)]
struct StubState {
    base: String,
    /// Raw query string of every message-listing request, per user.
    message_requests: Arc<Mutex<Vec<String>>>,
    fail_user_listing: Arc<AtomicBool>,
}

async fn spawn_stub() -> (SocketAddr, StubState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let state = StubState {
        base: format!("http://{}", addr),
        message_requests: Arc::new(Mutex::new(Vec::new())),
        fail_user_listing: Arc::new(AtomicBool::new(false)),
    };

    let app = Router::new()
        .route("/{tenant}/oauth2/v2.0/token", post(stub_token))
        .route("/v1.0/users", get(stub_users))
        .route("/v1.0/users/{uid}/mailFolders/Inbox", get(stub_inbox))
        .route("/v1.0/users/{uid}/messages", get(stub_messages))
        .route("/v1.0/users/{uid}/messages/{mid}/$value", get(stub_mime))
        .route(
            "/v1.0/users/{uid}/messages/{mid}/attachments",
            get(stub_attachments),
        )
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn stub_token(
    Path(tenant): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let secret_ok = form.get("client_secret").map(String::as_str) == Some("good-secret");
    if tenant == "bad-tenant" || !secret_ok {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"access_token": "stub-token", "token_type": "Bearer"})).into_response()
}

/// Two pages of users: alice and bob (no mailbox), then carol.
async fn stub_users(
    State(state): State<StubState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if state.fail_user_listing.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match query.get("page").map(String::as_str) {
        Some("2") => Json(json!({
            "value": [
                {"id": "u3", "displayName": "Carol", "userPrincipalName": "carol@contoso.com"},
            ],
        }))
        .into_response(),
        _ => Json(json!({
            "value": [
                {"id": "u1", "displayName": "Alice", "userPrincipalName": "alice@contoso.com"},
                {"id": "u2", "displayName": "Bob", "userPrincipalName": "bob@contoso.com"},
            ],
            "@odata.nextLink": format!("{}/v1.0/users?page=2", state.base),
        }))
        .into_response(),
    }
}

async fn stub_inbox(Path(uid): Path<String>) -> StatusCode {
    if uid == "u2" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    }
}

async fn stub_messages(
    State(state): State<StubState>,
    Path(uid): Path<String>,
    RawQuery(raw): RawQuery,
) -> Json<Value> {
    let raw = raw.unwrap_or_default();
    state
        .message_requests
        .lock()
        .unwrap()
        .push(format!("{}?{}", uid, raw));

    let mut top = 10usize;
    let mut skip = 0usize;
    for param in raw.split('&') {
        if let Some(v) = param.strip_prefix("$top=") {
            top = v.parse().unwrap_or(10);
        }
        if let Some(v) = param.strip_prefix("$skip=") {
            skip = v.parse().unwrap_or(0);
        }
    }

    let end = (skip + top).min(MESSAGES_PER_USER);
    let value: Vec<Value> = (skip..end)
        .map(|i| {
            json!({
                "id": format!("{}-m{}", uid, i + 1),
                "subject": format!("Report {} for {}", i + 1, uid),
                "from": {"emailAddress": {"address": "reports@contoso.com"}},
                "to": [{"emailAddress": {"address": format!("{}@contoso.com", uid)}}],
                "receivedDateTime": format!("2024-03-0{}T08:00:00Z", i + 1),
                "bodyPreview": "weekly report",
                "importance": "normal",
                "hasAttachments": true,
            })
        })
        .collect();

    let mut body = json!({ "value": value });
    if end < MESSAGES_PER_USER {
        body["@odata.nextLink"] = json!(format!(
            "{}/v1.0/users/{}/messages?$top={}&$skip={}",
            state.base, uid, top, end
        ));
    }
    Json(body)
}

async fn stub_mime(Path((_uid, mid)): Path<(String, String)>) -> Response {
    if mid == "u1-m2" {
        return StatusCode::NOT_FOUND.into_response();
    }
    format!("MIME-Version: 1.0\r\nSubject: {}\r\n\r\nbody\r\n", mid).into_response()
}

async fn stub_attachments(Path((_uid, _mid)): Path<(String, String)>) -> Json<Value> {
    Json(json!({
        "value": [
            {
                "id": "att-1",
                "name": "report.txt",
                "contentType": "text/plain",
                "contentBytes": "aGVsbG8gd29ybGQ=",
            },
            {
                "id": "att-2",
                "name": "archive.bin",
                "contentType": "application/octet-stream",
                "contentBytes": null,
            },
        ],
    }))
}

fn stub_graph_config(addr: SocketAddr, page_size: u64) -> GraphConfig {
    GraphConfig {
        base_url: format!("http://{}/v1.0", addr),
        authority: format!("http://{}", addr),
        page_size,
        timeout_secs: 5,
        ..Default::default()
    }
}

fn good_tenant() -> Tenant {
    Tenant {
        name: "contoso".to_string(),
        tenant_id: "tenant-1".to_string(),
        client_id: "app-1".to_string(),
        client_secret: "good-secret".to_string(),
    }
}

#[tokio::test]
async fn collects_mailbox_users_up_to_quota_with_partial_fetches() {
    let (addr, stub) = spawn_stub().await;
    let tmp = TempDir::new().unwrap();
    let graph_cfg = stub_graph_config(addr, 2);

    let opts = CollectOptions {
        mails_per_user: Some(3),
        include_attachments: true,
        page_size: 2,
        blob_dir: Some(tmp.path().join("blobs")),
    };

    let task = TaskRegistry::new().create();
    let outcome = collect_tenant(&graph_cfg, &good_tenant(), &opts, &task, (10, 80)).await;

    // Two mailbox users (bob has none), three messages each.
    assert_eq!(outcome.messages.len(), 6);
    let principals: Vec<&str> = outcome
        .messages
        .iter()
        .map(|m| m.user_principal.as_str())
        .collect();
    assert!(!principals.contains(&"bob@contoso.com"));

    // Remote listing order is preserved.
    let u1_ids: Vec<&str> = outcome
        .messages
        .iter()
        .filter(|m| m.user_principal == "alice@contoso.com")
        .map(|m| m.message_id.as_str())
        .collect();
    assert_eq!(u1_ids, vec!["u1-m1", "u1-m2", "u1-m3"]);

    // The failed MIME fetch is isolated: the message ships without a blob
    // reference and the error is recorded.
    let broken = outcome
        .messages
        .iter()
        .find(|m| m.message_id == "u1-m2")
        .unwrap();
    assert!(broken.eml_path.is_none());
    let intact = outcome
        .messages
        .iter()
        .find(|m| m.message_id == "u1-m1")
        .unwrap();
    let eml = intact.eml_path.as_ref().unwrap();
    assert!(eml.exists());
    let fetch_errors: Vec<&CollectError> = outcome
        .errors
        .iter()
        .filter(|e| matches!(e, CollectError::Fetch { .. }))
        .collect();
    assert_eq!(fetch_errors.len(), 1);

    // Attachments: content bytes stored, metadata-only kept as metadata.
    assert_eq!(intact.attachments.len(), 2);
    let stored = &intact.attachments[0];
    assert_eq!(stored.size, 11);
    assert!(stored.stored_path.as_ref().unwrap().exists());
    let meta_only = &intact.attachments[1];
    assert_eq!(meta_only.size, 0);
    assert!(meta_only.stored_path.is_none());

    // Quota truncation: two listing requests per user, the second rewritten
    // to the remaining quota, and no request for items past it.
    let requests = stub.message_requests.lock().unwrap().clone();
    let u1_requests: Vec<&String> = requests.iter().filter(|r| r.starts_with("u1?")).collect();
    assert_eq!(u1_requests.len(), 2);
    assert!(u1_requests[0].contains("$top=2"));
    assert!(u1_requests[1].contains("$top=1"));
    assert!(!requests.iter().any(|r| r.contains("$skip=3")));
}

#[tokio::test]
async fn auth_failure_yields_empty_outcome_without_aborting() {
    let (addr, _stub) = spawn_stub().await;
    let graph_cfg = stub_graph_config(addr, 10);

    let mut bad = good_tenant();
    bad.name = "fabrikam".to_string();
    bad.client_secret = "wrong".to_string();

    let opts = CollectOptions {
        mails_per_user: Some(2),
        include_attachments: false,
        page_size: 10,
        blob_dir: None,
    };

    let task = TaskRegistry::new().create();
    let outcome = collect_tenant(&graph_cfg, &bad, &opts, &task, (0, 50)).await;
    assert!(outcome.messages.is_empty());
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(&outcome.errors[0], CollectError::Auth { tenant, .. } if tenant == "fabrikam"));
    assert!(outcome.errors[0].is_tenant_fatal());

    // The same remote is still collectable by a healthy tenant.
    let good = collect_tenant(&graph_cfg, &good_tenant(), &opts, &task, (50, 100)).await;
    assert_eq!(good.messages.len(), 4);
}

#[tokio::test]
async fn user_listing_failure_aborts_the_tenant() {
    let (addr, stub) = spawn_stub().await;
    let graph_cfg = stub_graph_config(addr, 10);
    stub.fail_user_listing.store(true, Ordering::SeqCst);

    let opts = CollectOptions {
        mails_per_user: None,
        include_attachments: false,
        page_size: 10,
        blob_dir: None,
    };

    let task = TaskRegistry::new().create();
    let outcome = collect_tenant(&graph_cfg, &good_tenant(), &opts, &task, (0, 100)).await;
    assert!(outcome.messages.is_empty());
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(&outcome.errors[0], CollectError::Listing { .. }));
    assert!(outcome.errors[0].is_tenant_fatal());
}

fn run_config(addr: SocketAddr, tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("mailvault.sqlite"),
        },
        graph: stub_graph_config(addr, 2),
        collection: CollectionConfig {
            mails_per_user: Some(3),
            include_attachments: false,
            blob_dir: None,
            max_retries: 0,
            retry_delay_secs: 0,
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
        indexer: Default::default(),
        scheduler: Default::default(),
        tenants: vec![
            TenantEntry {
                name: "contoso".to_string(),
                tenant_id: Some("tenant-1".to_string()),
                client_id: Some("app-1".to_string()),
                client_secret: Some("good-secret".to_string()),
            },
            TenantEntry {
                name: "fabrikam".to_string(),
                tenant_id: Some("bad-tenant".to_string()),
                client_id: Some("app-2".to_string()),
                client_secret: Some("good-secret".to_string()),
            },
        ],
    }
}

#[tokio::test]
async fn full_run_dedups_across_runs_and_isolates_bad_tenants() {
    let (addr, _stub) = spawn_stub().await;
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(run_config(addr, &tmp));

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = SnapshotStore::new(pool);
    let indexer: Arc<dyn mailvault::indexer::SearchIndexer> = Arc::new(DisabledIndexer);
    let registry = TaskRegistry::new();

    let task = registry.create();
    run_collection(
        config.clone(),
        store.clone(),
        indexer.clone(),
        task.clone(),
        RunOptions {
            label: Some("first".to_string()),
            ..Default::default()
        },
    )
    .await;

    let result = match registry.get(task.id()).unwrap().status().state {
        TaskState::Success { result } => result,
        other => panic!("first run did not succeed: {:?}", other),
    };
    assert_eq!(result["messages_collected"], 6);
    assert_eq!(result["messages_inserted"], 6);

    // The bad tenant contributed nothing but did not fail the run.
    let tenants = result["tenants"].as_array().unwrap();
    let bad = tenants.iter().find(|t| t["name"] == "fabrikam").unwrap();
    assert_eq!(bad["messages"], 0);
    assert_eq!(bad["errors"].as_array().unwrap().len(), 1);

    // The tracker went through the expected stages before the terminal
    // state, and the terminal state is retained for later polling.
    let stages: Vec<String> = task
        .transitions()
        .iter()
        .filter_map(|state| match state {
            TaskState::Progress { stage, .. } => Some(stage.clone()),
            _ => None,
        })
        .collect();
    assert!(stages.contains(&"starting".to_string()));
    assert!(stages.contains(&"collecting".to_string()));
    assert!(stages.contains(&"storing".to_string()));
    assert!(task.status().state.is_terminal());

    // Second run re-observes identical content: a new snapshot with zero
    // insertions.
    let task2 = registry.create();
    run_collection(
        config.clone(),
        store.clone(),
        indexer,
        task2.clone(),
        RunOptions {
            label: Some("second".to_string()),
            ..Default::default()
        },
    )
    .await;

    let result2 = match task2.status().state {
        TaskState::Success { result } => result,
        other => panic!("second run did not succeed: {:?}", other),
    };
    assert_eq!(result2["messages_collected"], 6);
    assert_eq!(result2["messages_inserted"], 0);
    assert_ne!(result2["snapshot_id"], result["snapshot_id"]);

    let snapshots = store.list_snapshots(10).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots.iter().map(|s| s.message_count).sum::<i64>(), 6);
}

#[tokio::test]
async fn single_tenant_restriction_and_unknown_tenant_failure() {
    let (addr, _stub) = spawn_stub().await;
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(run_config(addr, &tmp));

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = SnapshotStore::new(pool);
    let indexer: Arc<dyn mailvault::indexer::SearchIndexer> = Arc::new(DisabledIndexer);
    let registry = TaskRegistry::new();

    // Unknown tenant name: the run fails (after the configured zero
    // retries) instead of silently collecting nothing.
    let task = registry.create();
    run_collection(
        config.clone(),
        store.clone(),
        indexer.clone(),
        task.clone(),
        RunOptions {
            tenant: Some("nonexistent".to_string()),
            ..Default::default()
        },
    )
    .await;
    assert!(matches!(task.status().state, TaskState::Failure { .. }));

    // Restricting to the good tenant collects only it.
    let task2 = registry.create();
    run_collection(
        config,
        store,
        indexer,
        task2.clone(),
        RunOptions {
            tenant: Some("contoso".to_string()),
            ..Default::default()
        },
    )
    .await;
    match task2.status().state {
        TaskState::Success { result } => {
            assert_eq!(result["messages_collected"], 6);
            assert_eq!(result["tenants"].as_array().unwrap().len(), 1);
        }
        other => panic!("restricted run did not succeed: {:?}", other),
    }
}

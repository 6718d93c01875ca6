//! JSON HTTP API.
//!
//! Thin presentation layer over the pipeline: snapshot browsing, the tenant
//! registry, and run submission/inspection. Adds no semantics of its own —
//! every handler delegates to the store, the registry, or the runner.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/snapshots` | List recent snapshots |
//! | `GET`    | `/snapshots/{id}` | Messages first seen in a snapshot |
//! | `DELETE` | `/snapshots/{id}` | Delete a snapshot (messages cascade) |
//! | `GET`    | `/messages/{id}` | One message with its raw payload |
//! | `GET`    | `/tenants` | List registered tenants (secrets redacted) |
//! | `POST`   | `/tenants` | Register a tenant |
//! | `DELETE` | `/tenants/{id}` | Deactivate a tenant (soft delete) |
//! | `POST`   | `/runs` | Submit a collection run, returns a task id |
//! | `GET`    | `/runs/{id}` | Poll run status |
//! | `GET`    | `/runs/{id}/events` | SSE stream of status transitions |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no snapshot with id 42" } }
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::indexer::SearchIndexer;
use crate::models::Tenant;
use crate::runner::{run_collection, RunOptions};
use crate::store::SnapshotStore;
use crate::task::{TaskRegistry, TaskStatus};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: SnapshotStore,
    tasks: Arc<TaskRegistry>,
    indexer: Arc<dyn SearchIndexer>,
}

/// Start the HTTP server. Runs until the process is terminated.
pub async fn run_server(
    config: Arc<Config>,
    store: SnapshotStore,
    tasks: Arc<TaskRegistry>,
    indexer: Arc<dyn SearchIndexer>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let state = AppState {
        config,
        store,
        tasks,
        indexer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/snapshots", get(handle_list_snapshots))
        .route("/snapshots/{id}", get(handle_snapshot_detail))
        .route("/snapshots/{id}", delete(handle_delete_snapshot))
        .route("/messages/{id}", get(handle_message_detail))
        .route("/tenants", get(handle_list_tenants))
        .route("/tenants", post(handle_create_tenant))
        .route("/tenants/{id}", get(handle_tenant_detail))
        .route("/tenants/{id}", delete(handle_deactivate_tenant))
        .route("/runs", post(handle_submit_run))
        .route("/runs/{id}", get(handle_run_status))
        .route("/runs/{id}/events", get(handle_run_events))
        .layer(cors)
        .with_state(state);

    info!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Snapshots ============

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

async fn handle_list_snapshots(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let snapshots = state
        .store
        .list_snapshots(limit)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "snapshots": snapshots })))
}

async fn handle_snapshot_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let messages = state
        .store
        .snapshot_messages(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("no snapshot with id {}", id)))?;
    Ok(Json(serde_json::json!({
        "snapshot_id": id,
        "messages": messages,
    })))
}

async fn handle_delete_snapshot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.store.delete_snapshot(id).await.map_err(internal)?;
    if !deleted {
        return Err(not_found(format!("no snapshot with id {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn handle_message_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let detail = state
        .store
        .message(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("no message with id {}", id)))?;
    Ok(Json(serde_json::to_value(&detail).map_err(|e| internal(e.into()))?))
}

// ============ Tenants ============

async fn handle_list_tenants(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenants = state.store.list_tenants().await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "tenants": tenants })))
}

#[derive(Deserialize)]
struct CreateTenantRequest {
    name: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

async fn handle_create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }

    let tenant = Tenant {
        name: req.name,
        tenant_id: req.tenant_id,
        client_id: req.client_id,
        client_secret: req.client_secret,
    };

    let id = state.store.create_tenant(&tenant).await.map_err(|e| {
        let unique = e
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .is_some_and(|db| db.is_unique_violation());
        if unique {
            bad_request(format!("tenant_id '{}' is already registered", tenant.tenant_id))
        } else {
            internal(e)
        }
    })?;

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn handle_tenant_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = state
        .store
        .get_tenant(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("no tenant with id {}", id)))?;
    Ok(Json(serde_json::json!({ "tenant": tenant })))
}

async fn handle_deactivate_tenant(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deactivated = state
        .store
        .deactivate_tenant(id)
        .await
        .map_err(internal)?;
    if !deactivated {
        return Err(not_found(format!("no active tenant with id {}", id)));
    }
    Ok(Json(serde_json::json!({ "deactivated": true })))
}

// ============ Runs ============

#[derive(Deserialize, Default)]
struct SubmitRunRequest {
    label: Option<String>,
    tenant: Option<String>,
    mails_per_user: Option<u64>,
    include_attachments: Option<bool>,
}

/// Submit a collection run. Returns `202 Accepted` with the task id; the run
/// executes on the runtime and is observed via `/runs/{id}`. The body is
/// optional — a bare POST runs with config defaults.
async fn handle_submit_run(
    State(state): State<AppState>,
    body: Result<Json<SubmitRunRequest>, axum::extract::rejection::JsonRejection>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Json(req) = body.unwrap_or_else(|_| Json(SubmitRunRequest::default()));
    let task = state.tasks.create();
    let task_id = task.id().to_string();

    let opts = RunOptions {
        label: req.label,
        tenant: req.tenant,
        mails_per_user: req.mails_per_user,
        include_attachments: req.include_attachments,
    };

    tokio::spawn(run_collection(
        state.config.clone(),
        state.store.clone(),
        state.indexer.clone(),
        task,
        opts,
    ));

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    )
}

async fn handle_run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatus>, AppError> {
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| not_found(format!("no run with task id {}", id)))?;
    Ok(Json(task.status()))
}

/// SSE stream of status transitions. Emits the current status immediately,
/// then one event per transition, and closes after the terminal state.
async fn handle_run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| not_found(format!("no run with task id {}", id)))?;

    enum StreamState {
        Initial(watch::Receiver<TaskStatus>),
        Waiting(watch::Receiver<TaskStatus>),
    }

    let stream = futures::stream::unfold(
        Some(StreamState::Initial(task.subscribe())),
        |seed| async move {
            let mut rx = match seed? {
                StreamState::Initial(rx) => rx,
                StreamState::Waiting(mut rx) => match rx.changed().await {
                    Ok(()) => rx,
                    Err(_) => return None,
                },
            };
            let status = rx.borrow_and_update().clone();
            let event = Event::default().json_data(&status).ok()?;
            let next = if status.state.is_terminal() {
                None
            } else {
                Some(StreamState::Waiting(rx))
            };
            Some((Ok::<_, Infallible>(event), next))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

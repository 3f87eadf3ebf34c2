//! REST endpoints for the management API.
//!
//! Everything except the liveness probe sits behind the shared-secret
//! layer. Wire field names are camelCase to match the worker contract.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::dispatch::Dispatcher;
use crate::error::ProvisionError;
use crate::orchestrator::session::{SessionSummary, WorkerSession};
use crate::orchestrator::{LifecycleManager, SessionRegistry};
use crate::store::Database;

use super::auth::require_api_key;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub db: Arc<dyn Database>,
    pub config: OrchestratorConfig,
}

/// Build the management API router.
pub fn api_routes(state: AppState) -> Router {
    let authed = Router::new()
        .route("/stats", get(get_stats))
        .route("/workers", get(list_workers).post(create_worker))
        .route("/workers/{tenant_id}", get(get_worker))
        .route("/workers/{tenant_id}", delete(delete_worker))
        .route("/workers/{tenant_id}/heartbeat", post(heartbeat))
        .route(
            "/workers/{tenant_id}/companion",
            post(create_companion).delete(delete_companion),
        )
        .route("/cleanup", post(trigger_cleanup))
        .route("/dispatch", post(trigger_dispatch))
        .route("/config/automation", put(set_automation))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkerRequest {
    tenant_id: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerResponse {
    tenant_id: String,
    worker_id: String,
    name: String,
    status: String,
    control_url: String,
    view_url: String,
    port_index: usize,
    created_at: chrono::DateTime<chrono::Utc>,
    last_activity: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    companion_url: Option<String>,
}

impl From<&WorkerSession> for WorkerResponse {
    fn from(s: &WorkerSession) -> Self {
        Self {
            tenant_id: s.tenant_id.clone(),
            worker_id: s.worker_id.clone(),
            name: s.name.clone(),
            status: s.status.to_string(),
            control_url: s.control_url.clone(),
            view_url: s.view_url.clone(),
            port_index: s.port_index,
            created_at: s.created_at,
            last_activity: s.last_activity,
            companion_url: s.companion.as_ref().map(|c| c.url.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupRequest {
    #[serde(default)]
    max_inactive_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AutomationRequest {
    paused: bool,
}

fn error_body(error: &str, message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": error,
        "message": message.into(),
    }))
}

fn provision_error_response(err: ProvisionError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        ProvisionError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        ProvisionError::NotFound { .. } | ProvisionError::NoPrimary { .. } => {
            StatusCode::NOT_FOUND
        }
        ProvisionError::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error_body("Provision failed", err.to_string()))
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /health — orchestrator liveness + capacity stats. Unauthenticated.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    Json(serde_json::json!({
        "status": "healthy",
        "service": "browser-orchestrator",
        "timestamp": chrono::Utc::now(),
        "stats": stats,
    }))
}

/// GET /stats — registry counters plus session summaries.
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    let sessions: Vec<SessionSummary> = state
        .registry
        .all()
        .await
        .iter()
        .map(SessionSummary::from)
        .collect();
    Json(serde_json::json!({
        "stats": stats,
        "sessions": sessions,
    }))
}

/// POST /workers — provision a worker for a tenant (idempotent per tenant).
async fn create_worker(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkerRequest>,
) -> impl IntoResponse {
    if request.tenant_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("Bad Request", "tenantId is required"),
        )
            .into_response();
    }
    let user_id = request.user_id.as_deref().unwrap_or("anonymous");

    match state.manager.provision(&request.tenant_id, user_id).await {
        Ok(session) => {
            (StatusCode::CREATED, Json(WorkerResponse::from(&session))).into_response()
        }
        Err(err) => provision_error_response(err).into_response(),
    }
}

/// GET /workers — session summaries only.
async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.all().await;
    let summaries: Vec<SessionSummary> = sessions.iter().map(SessionSummary::from).collect();
    Json(serde_json::json!({
        "count": summaries.len(),
        "workers": summaries,
    }))
}

/// GET /workers/{tenant_id} — current session or 404.
async fn get_worker(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&tenant_id).await {
        Some(session) => Json(WorkerResponse::from(&session)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            error_body(
                "Not Found",
                format!("No worker found for tenant {tenant_id}"),
            ),
        )
            .into_response(),
    }
}

/// DELETE /workers/{tenant_id} — idempotent teardown.
async fn delete_worker(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    state.manager.deprovision(&tenant_id).await;
    Json(serde_json::json!({
        "success": true,
        "message": format!("Worker for tenant {tenant_id} destroyed"),
    }))
}

/// POST /workers/{tenant_id}/heartbeat — refresh last_activity.
async fn heartbeat(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&tenant_id).await {
        Some(session) => Json(serde_json::json!({
            "success": true,
            "lastActivity": session.last_activity,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            error_body(
                "Not Found",
                format!("No worker found for tenant {tenant_id}"),
            ),
        )
            .into_response(),
    }
}

/// POST /workers/{tenant_id}/companion — lazily attach the live-view worker.
async fn create_companion(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.provision_companion(&tenant_id).await {
        Ok(companion) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "tenantId": tenant_id,
                "status": companion.status,
                "viewUrl": companion.url,
            })),
        )
            .into_response(),
        Err(err) => provision_error_response(err).into_response(),
    }
}

/// DELETE /workers/{tenant_id}/companion — idempotent.
async fn delete_companion(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    state.manager.deprovision_companion(&tenant_id).await;
    Json(serde_json::json!({ "success": true }))
}

/// POST /cleanup — manually trigger an idle-reaper pass.
async fn trigger_cleanup(
    State(state): State<AppState>,
    Json(request): Json<CleanupRequest>,
) -> impl IntoResponse {
    let max_inactive = request
        .max_inactive_minutes
        .map(|m| std::time::Duration::from_secs(m * 60))
        .unwrap_or(state.config.session_timeout);

    info!("manual cleanup triggered");
    let reaped = state.manager.cleanup_inactive(max_inactive).await;
    let stats = state.registry.stats().await;
    Json(serde_json::json!({
        "success": true,
        "reaped": reaped,
        "stats": stats,
    }))
}

/// POST /dispatch — fire one dispatcher tick.
///
/// Dispatch failures are internal (retry machinery); the caller only
/// learns whether the tick itself could run.
async fn trigger_dispatch(State(state): State<AppState>) -> impl IntoResponse {
    match state.dispatcher.tick().await {
        Ok(outcome) => Json(serde_json::to_value(outcome).unwrap_or_default()).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("Dispatch tick failed", err.to_string()),
        )
            .into_response(),
    }
}

/// PUT /config/automation — flip the global dispatch pause flag.
async fn set_automation(
    State(state): State<AppState>,
    Json(request): Json<AutomationRequest>,
) -> impl IntoResponse {
    match state.db.set_automation_paused(request.paused).await {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "paused": request.paused,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("Config update failed", err.to_string()),
        )
            .into_response(),
    }
}

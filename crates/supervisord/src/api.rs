//! HTTP API for the daemon and the watchdog
//!
//! The daemon serves health, readiness, metrics, container health and
//! capacity. The watchdog serves its own status and task counters on a
//! separate port so it stays reachable while the daemon restarts.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, Timelike};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use supervisor_lib::{
    capacity::{TaskEstimate, UsageSnapshot},
    health::ComponentStatus,
    observability::gather_text,
    watchdog::{TaskOutcome, Watchdog},
    CapacityMode, SupervisorContext,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared daemon state
#[derive(Clone)]
pub struct DaemonState {
    pub context: Arc<SupervisorContext>,
}

impl DaemonState {
    pub fn new(context: Arc<SupervisorContext>) -> Self {
        Self { context }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<DaemonState>) -> impl IntoResponse {
    let health = state.context.components.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<DaemonState>) -> impl IntoResponse {
    let readiness = state.context.components.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        gather_text(),
    )
}

async fn status(State(state): State<DaemonState>) -> impl IntoResponse {
    Json(state.context.status(&Local::now()))
}

async fn list_health(State(state): State<DaemonState>) -> impl IntoResponse {
    Json(state.context.monitor.records())
}

async fn container_health(State(state): State<DaemonState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.context.monitor.get_container_health(&id) {
        Some(record) => (StatusCode::OK, Json(serde_json::json!(record))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("container {id} is not monitored") })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct CapacityQuery {
    /// Resolve for this local hour instead of the current one
    pub hour: Option<u32>,
}

async fn capacity(State(state): State<DaemonState>, Query(query): Query<CapacityQuery>) -> impl IntoResponse {
    let now = Local::now();
    let at = match query.hour {
        None => Some(now),
        Some(hour) => now.with_hour(hour),
    };

    match at {
        Some(at) => (StatusCode::OK, Json(serde_json::json!(state.context.active_capacity(&at)))),
        None => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "hour must be between 0 and 23" })),
        ),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub usage: UsageSnapshot,
    #[serde(default)]
    pub task: TaskEstimate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub admitted: bool,
    pub mode: CapacityMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

async fn admission(State(state): State<DaemonState>, Json(request): Json<AdmissionRequest>) -> impl IntoResponse {
    let active = state.context.active_capacity(&Local::now());

    match active.check_admission(&request.usage, &request.task) {
        Ok(()) => (
            StatusCode::OK,
            Json(AdmissionResponse {
                admitted: true,
                mode: active.mode,
                reason: None,
            }),
        ),
        Err(e) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(AdmissionResponse {
                admitted: false,
                mode: active.mode,
                reason: Some(e.to_string()),
            }),
        ),
    }
}

pub fn daemon_router(state: DaemonState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/containers/health", get(list_health))
        .route("/containers/health/:id", get(container_health))
        .route("/capacity", get(capacity))
        .route("/capacity/admission", post(admission))
        .with_state(state)
}

async fn watchdog_healthz(State(watchdog): State<Arc<Watchdog>>) -> impl IntoResponse {
    let metrics = watchdog.metrics();
    let status_code = if metrics.circuit_open {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status_code, Json(serde_json::json!({ "circuit_open": metrics.circuit_open })))
}

async fn watchdog_status(State(watchdog): State<Arc<Watchdog>>) -> impl IntoResponse {
    Json(watchdog.metrics())
}

async fn task_started(State(watchdog): State<Arc<Watchdog>>) -> impl IntoResponse {
    watchdog.record_task_started();
    Json(watchdog.metrics().task_counts)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFinished {
    pub outcome: TaskOutcome,
}

async fn task_finished(State(watchdog): State<Arc<Watchdog>>, Json(body): Json<TaskFinished>) -> impl IntoResponse {
    watchdog.record_task_finished(body.outcome);
    Json(watchdog.metrics().task_counts)
}

pub fn watchdog_router(watchdog: Arc<Watchdog>) -> Router {
    Router::new()
        .route("/healthz", get(watchdog_healthz))
        .route("/status", get(watchdog_status))
        .route("/metrics", get(metrics))
        .route("/tasks/started", post(task_started))
        .route("/tasks/finished", post(task_finished))
        .with_state(watchdog)
}

/// Serve `app` until `cancel` fires
pub async fn serve(port: u16, app: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

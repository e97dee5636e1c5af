//! HTTP route handlers.

use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::job::JobSnapshot;
use crate::model::ModelId;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::version::VersionInfo;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub version: VersionInfo,
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            scheduler,
            version: VersionInfo::new(),
            shutdown_tx,
        }
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Idle,
    Training,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub version: VersionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct TrainServerRequest {
    pub id: Option<i64>,
    #[serde(default)]
    pub start_fresh: bool,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    let job = state.scheduler.snapshot().await;
    let status = if job.is_some() {
        HealthStatus::Training
    } else {
        HealthStatus::Idle
    };
    Json(HealthCheckResponse {
        status,
        version: state.version.clone(),
        job,
    })
}

/// Every body that fails to yield an integer `id` gets the same 400 answer.
async fn request_server(
    State(state): State<AppState>,
    body: Result<Json<TrainServerRequest>, JsonRejection>,
) -> Response {
    let id = match body {
        Ok(Json(TrainServerRequest {
            id: Some(id),
            start_fresh,
        })) => Some((id, start_fresh)),
        Ok(_) => None,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected server request body");
            None
        }
    };
    let Some((id, start_fresh)) = id else {
        return (StatusCode::BAD_REQUEST, Json("Model ID not specified")).into_response();
    };

    let model = ModelId(id);
    match state.scheduler.request_server(model, start_fresh).await {
        Ok(grant) => {
            tracing::debug!(model = %model, status = ?grant.status, "Server request answered");
            (StatusCode::OK, Json(grant)).into_response()
        }
        Err(SchedulerError::UnknownModel(_)) => {
            (StatusCode::NOT_FOUND, Json("Model not found")).into_response()
        }
        Err(e) => {
            tracing::error!(model = %model, error = %e, "Failed to provide training server");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    state.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/train/server", post(request_server))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

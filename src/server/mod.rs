//! HTTP + WebSocket surface over the execution coordinator.

mod auth;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use secrecy::SecretString;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ExecError;
use crate::exec::ExecCoordinator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExecCoordinator>,
    /// Shared API token. Every route except `/health` requires it when set.
    pub api_token: Option<SecretString>,
}

/// Build the router: `/health`, `/run`, `/api/eval`, `/restart` and `/ws`.
pub fn routes(coordinator: Arc<ExecCoordinator>, api_token: Option<SecretString>) -> Router {
    let state = AppState {
        coordinator,
        api_token,
    };

    Router::new()
        .route("/health", get(health))
        .route("/run", post(run))
        .route("/api/eval", post(eval))
        .route("/restart", post(restart))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.worker_status().await)
}

// ── Execution ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RunRequest {
    #[serde(default)]
    code: String,
}

async fn run(State(state): State<AppState>, Json(body): Json<RunRequest>) -> impl IntoResponse {
    let exec_id = Uuid::new_v4();
    match state.coordinator.submit(&body.code).await {
        Ok(submission) => {
            info!(exec_id = %exec_id, msg_id = %submission.correlation_id, "Run accepted");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "execId": exec_id,
                    "msgId": submission.correlation_id,
                })),
            )
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct EvalRequest {
    #[serde(default)]
    code: String,
    /// How long to wait for output; the configured collect timeout when absent.
    wait_ms: Option<u64>,
}

/// Run `code` and answer with the first line it prints on stdout, without
/// its line terminator.
async fn eval(State(state): State<AppState>, Json(body): Json<EvalRequest>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let wait_timeout = body
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or(coordinator.config().collect_timeout);

    let result = coordinator
        .submit_and_collect(
            &body.code,
            |event| {
                Ok(event
                    .stream_text("stdout")
                    .map(|text| {
                        let line = text.trim_end_matches(['\r', '\n']);
                        (event.parent_correlation_id.clone(), line.to_string())
                    }))
            },
            true,
            wait_timeout,
        )
        .await;

    match result {
        Ok(Some((msg_id, output))) => (
            StatusCode::OK,
            Json(serde_json::json!({ "msgId": msg_id, "output": output })),
        ),
        Ok(None) => (
            StatusCode::OK,
            Json(serde_json::json!({ "output": null })),
        ),
        Err(e) => error_response(&e),
    }
}

// ── Administration ──────────────────────────────────────────────────────

async fn restart(State(state): State<AppState>) -> impl IntoResponse {
    match state.coordinator.restart_worker().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "ok": false, "error": e.to_string() })),
        ),
    }
}

fn error_response(e: &ExecError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        ExecError::InvalidSubmission(_) => StatusCode::BAD_REQUEST,
        ExecError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        ExecError::Worker(_) => {
            warn!(error = %e, "Submission failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let message = match e {
        ExecError::InvalidSubmission(reason) => reason.clone(),
        other => other.to_string(),
    };
    (status, Json(serde_json::json!({ "error": message })))
}

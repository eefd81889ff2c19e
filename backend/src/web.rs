use crate::state::AppState;
use crate::store::Reading;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{
    Json, Router,
    routing::{get, post},
};
use engine_control_shared::{LogEntry, OperatorCommand, Stage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const DEFAULT_LOG_LIMIT: usize = 100;

/// Public router constructor
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/logs", get(get_logs))
        .route("/api/command", post(send_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
pub struct StateEntry<K> {
    pub key: K,
    #[serde(flatten)]
    pub reading: Reading,
}

/// DTO returned by /api/state
#[derive(Serialize)]
pub struct StateResponse<R, F> {
    pub stage: Option<Stage>,
    pub status: Option<f64>,
    pub registry: Vec<StateEntry<R>>,
    pub flag: Vec<StateEntry<F>>,
}

fn entries<K>(snapshot: Vec<(K, Reading)>) -> Vec<StateEntry<K>> {
    snapshot
        .into_iter()
        .map(|(key, reading)| StateEntry { key, reading })
        .collect()
}

async fn get_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stage = state.registry.stage().ok().flatten();
    let status = state.registry.stage_status().ok().flatten();
    Json(StateResponse {
        stage,
        status,
        registry: entries(state.registry.snapshot()),
        flag: entries(state.flag.snapshot()),
    })
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn get_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let rb = state
        .logs
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Json(rb.recent(limit).into_iter().cloned().collect())
}

async fn send_command(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<OperatorCommand>,
) -> impl IntoResponse {
    match state.cmd_tx.send(cmd).await {
        Ok(()) => (StatusCode::ACCEPTED, "ok"),
        Err(e) => {
            tracing::error!(cmd = ?e.0, "actuation task is gone, command dropped");
            (StatusCode::SERVICE_UNAVAILABLE, "actuation task unavailable")
        }
    }
}

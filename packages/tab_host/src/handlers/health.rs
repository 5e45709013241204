use axum::{Json, extract::State, response::IntoResponse};

use super::HostState;
use crate::error::HostError;
use crate::metrics::HealthStatus;

/// Health check endpoint - returns host status
pub async fn health_handler(
    State(state): State<HostState>,
) -> Result<Json<HealthStatus>, HostError> {
    let metrics = state.apps.metrics().snapshot();
    let apps = state.apps.app_names().await?;
    let sessions = state.apps.session_count().await?;

    let status = if apps.is_empty() { "idle" } else { "healthy" };
    Ok(Json(HealthStatus {
        status: status.to_string(),
        apps,
        sessions,
        active_tabs: metrics.tabs.active,
        uptime_secs: metrics.uptime_secs,
    }))
}

/// Metrics endpoint - returns detailed host metrics
pub async fn metrics_handler(State(state): State<HostState>) -> impl IntoResponse {
    Json(state.apps.metrics().snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Live tab table for operators
pub async fn tab_status_handler(State(state): State<HostState>) -> impl IntoResponse {
    Json(state.board.snapshot())
}

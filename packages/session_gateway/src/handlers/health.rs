use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;
use crate::session::SessionState;

/// Health check endpoint - returns gateway status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.list().await;
    let connected = sessions
        .iter()
        .filter(|s| s.state == SessionState::Connected)
        .count() as u64;
    let metrics = state.metrics.snapshot();

    let status = if metrics.errors.bridge == 0 && metrics.errors.frames == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sessions: metrics::SessionHealth {
            total: sessions.len() as u64,
            connected,
        },
        push_connections: metrics.push.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed gateway metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

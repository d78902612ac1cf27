//! Liveness and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use crate::health::{readiness_state, HealthResponse, HealthStatus};
use crate::state::AppState;

/// Always UP while the process serves requests.
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Up,
        components: None,
    })
}

/// Aggregates the component indicators; 503 as soon as one is DOWN.
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let readiness = readiness_state(&state.health_indicators).await;
    info!(status = ?readiness.status, "readiness");

    let status_code = match readiness.status {
        HealthStatus::Up => StatusCode::OK,
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(readiness))
}

//! HTTP API endpoints.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod files;
pub mod health;
pub mod jobs;

/// Builds the application router. Business endpoints live under
/// `/api/v1.0`; health stays at the root for probes.
pub fn router(state: AppState) -> Router {
    let upload_limit = state.settings.max_upload_bytes + 64 * 1024;

    let api = Router::new()
        .route("/jobs", post(jobs::create_job))
        .route("/jobexecutions", post(jobs::execute_job))
        .route(
            "/files",
            post(files::upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        );

    Router::new()
        .route("/health/liveness", get(health::liveness))
        .route("/health/readiness", get(health::readiness))
        .nest("/api/v1.0", api)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

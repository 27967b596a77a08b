// ABOUTME: HTTP API layer for the Stratus control plane
// ABOUTME: Router construction for the runner job endpoints

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod error;
pub mod runner_handlers;

pub use error::ApiError;
pub use runner_handlers::RunnerApiState;

/// Creates the runner job router
pub fn create_runner_router(state: RunnerApiState) -> Router {
    Router::new()
        .route("/api/runners/jobs", get(runner_handlers::poll_jobs))
        .route(
            "/api/runners/jobs/{run_id}/claim",
            post(runner_handlers::claim_job),
        )
        .route(
            "/api/runners/jobs/{run_id}/heartbeat",
            post(runner_handlers::heartbeat),
        )
        .route(
            "/api/runners/jobs/{run_id}/complete",
            post(runner_handlers::complete_job),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

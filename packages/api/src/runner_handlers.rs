// ABOUTME: HTTP request handlers for runner job operations
// ABOUTME: Claim, poll, heartbeat, and completion endpoints authenticated by runner bearer tokens

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use stratus_core::{JobOutcome, RunnerAuthScope};
use stratus_executions::{ClaimError, ClaimService, RunnerAuthenticator};
use tracing::{debug, info};

use crate::error::ApiError;

/// Shared state for runner job operations
#[derive(Clone)]
pub struct RunnerApiState {
    pub authenticator: RunnerAuthenticator,
    pub claims: ClaimService,
}

#[derive(Deserialize)]
pub struct PollQuery {
    pub group: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub run_ids: Vec<String>,
}

async fn authenticate(
    state: &RunnerApiState,
    headers: &HeaderMap,
) -> Result<RunnerAuthScope, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ClaimError::Unauthorized)?;
    Ok(state.authenticator.authenticate(bearer).await?)
}

/// Claim a queued run
///
/// POST /api/runners/jobs/{run_id}/claim
pub async fn claim_job(
    State(state): State<RunnerApiState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let scope = authenticate(&state, &headers).await?;
    debug!("Runner {} claiming run {}", scope.runner_id(), run_id);

    let context = state.claims.claim(&scope, &run_id).await?;
    Ok(Json(context))
}

/// List claimable runs in a group
///
/// GET /api/runners/jobs?group=<group>
pub async fn poll_jobs(
    State(state): State<RunnerApiState>,
    Query(query): Query<PollQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let scope = authenticate(&state, &headers).await?;
    let run_ids = state.claims.poll(&scope, &query.group).await?;
    Ok(Json(PollResponse { run_ids }))
}

/// Record a heartbeat for a running run
///
/// POST /api/runners/jobs/{run_id}/heartbeat
pub async fn heartbeat(
    State(state): State<RunnerApiState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let scope = authenticate(&state, &headers).await?;
    state.claims.heartbeat(&scope, &run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Report the terminal outcome of a run
///
/// POST /api/runners/jobs/{run_id}/complete
pub async fn complete_job(
    State(state): State<RunnerApiState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<JobOutcome>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = authenticate(&state, &headers).await?;
    let Json(outcome) = body.map_err(|e| ApiError::InvalidBody(e.body_text()))?;

    state.claims.complete(&scope, &run_id, &outcome).await?;
    info!("Run {} reported {}", run_id, outcome.run_status());
    Ok(StatusCode::NO_CONTENT)
}

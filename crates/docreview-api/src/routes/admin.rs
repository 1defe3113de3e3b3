//! Operator endpoints: replay, reset and failure resolution.

use axum::extract::{Path, State};
use axum::{Json, Router, routing::post};
use docreview_core::checkpoint::{FailureRecord, ResolutionStrategy};
use docreview_projections::ReplayReport;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /projections/{name}/replay. Both fields are
/// optional; an empty body replays from the start of the log.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplayRequest {
    /// Global position to replay from.
    pub from_sequence: Option<i64>,
    /// Record failed events and keep going instead of stopping.
    pub skip_failed: bool,
}

/// Request body for POST /failures/{id}/resolve.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// `retry`, `skip` or `manual_fix`.
    pub strategy: ResolutionStrategy,
}

/// Response body for operations without a richer result.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Outcome of the operation.
    pub status: &'static str,
}

/// Response body for POST /failures/{id}/resolve.
#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    /// `retry_scheduled` or `resolved`.
    pub status: &'static str,
    /// The record after the decision.
    pub failure: FailureRecord,
}

/// POST /projections/{name}/replay
#[instrument(skip(state, request), fields(projection = %name))]
async fn replay(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Option<Json<ReplayRequest>>,
) -> Result<Json<ReplayReport>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    info!(
        from_sequence = ?request.from_sequence,
        skip_failed = request.skip_failed,
        "replay requested"
    );
    let report = state
        .admin
        .replay(&name, request.from_sequence, request.skip_failed, &state.shutdown)
        .await?;
    Ok(Json(report))
}

/// POST /projections/{name}/reset
#[instrument(skip(state))]
async fn reset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.admin.reset(&name).await?;
    info!(projection = %name, "projection reset by operator");
    Ok(Json(StatusResponse { status: "reset" }))
}

/// POST /failures/{id}/resolve
#[instrument(skip(state, request), fields(strategy = ?request.strategy))]
async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let failure = state.admin.resolve(id, request.strategy).await?;
    let status = if failure.resolved {
        "resolved"
    } else {
        "retry_scheduled"
    };
    Ok(Json(ResolveResponse { status, failure }))
}

/// Returns the router for the admin surface.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projections/{name}/replay", post(replay))
        .route("/projections/{name}/reset", post(reset))
        .route("/failures/{id}/resolve", post(resolve))
}

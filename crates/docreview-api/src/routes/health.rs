//! Liveness and projection health endpoints.

use axum::extract::{Path, Query, State};
use axum::{Json, Router, routing::get};
use docreview_core::checkpoint::FailureRecord;
use docreview_projections::ProjectionHealth;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service version.
    pub version: String,
}

/// Query string for the failures listing.
#[derive(Debug, Default, Deserialize)]
pub struct FailuresQuery {
    /// Only resolved (`true`) or open (`false`) records; all when absent.
    pub resolved: Option<bool>,
}

/// GET /health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /health/projections
async fn projections(State(state): State<AppState>) -> Result<Json<Vec<ProjectionHealth>>, ApiError> {
    Ok(Json(state.admin.health().await?))
}

/// GET /health/projections/{name}
async fn projection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProjectionHealth>, ApiError> {
    Ok(Json(state.admin.projection_health(&name).await?))
}

/// GET /health/projections/{name}/failures
async fn failures(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<FailuresQuery>,
) -> Result<Json<Vec<FailureRecord>>, ApiError> {
    Ok(Json(state.admin.failures(&name, query.resolved).await?))
}

/// Returns the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/projections", get(projections))
        .route("/health/projections/{name}", get(projection))
        .route("/health/projections/{name}/failures", get(failures))
}

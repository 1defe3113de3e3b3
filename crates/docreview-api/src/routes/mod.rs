//! Route modules and the assembled application router.

pub mod admin;
pub mod documents;
pub mod health;
pub mod metrics;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full router served by the binary.
pub fn app(state: AppState) -> Router {
    // TODO: Replace CorsLayer::permissive() with the web client's origin once it is deployed.
    Router::new()
        .merge(health::router())
        .merge(metrics::router())
        .nest("/admin", admin::router())
        .nest("/api/v1/documents", documents::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

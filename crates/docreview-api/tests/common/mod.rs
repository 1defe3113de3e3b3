//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use docreview_api::config::DispatchMode;
use docreview_api::routes;
use docreview_api::state::{ServiceSettings, Services, Storage};
use docreview_core::aggregate_repository::RepositorySettings;
use docreview_event_store::{PgEventRepository, PgProjectionStore};
use docreview_projections::ProjectionSettings;
use docreview_test_support::{FixedClock, MockRng};
use http_body_util::BodyExt;
use sqlx::PgPool;
use tokio::sync::watch;
use tower::ServiceExt;

/// Build the full app router over PostgreSQL with a fixed clock and inline
/// projection dispatch, so read models are current when a command returns.
///
/// The `document_view` read model lives in the returned router; clone the
/// router to send several requests against the same instance.
pub fn build_test_app(pool: PgPool) -> Router {
    let events = Arc::new(PgEventRepository::new(pool.clone()));
    let storage = Storage {
        events: events.clone(),
        snapshots: events,
        projections: Arc::new(PgProjectionStore::new(pool)),
    };
    let clock = Arc::new(FixedClock(
        chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 1, 15, 10, 0, 0).unwrap(),
    ));
    let settings = ServiceSettings {
        repository: RepositorySettings::default(),
        projections: ProjectionSettings::default(),
        dispatch_mode: DispatchMode::Inline,
    };
    let (_tx, shutdown) = watch::channel(false);
    let services = Services::build(storage, clock, Box::new(MockRng), settings, shutdown).unwrap();
    routes::app(services.state)
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();

    send(app, request).await
}

/// Send a POST request without a body and return the response.
pub async fn post_empty(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    send(app, request).await
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    send(app, request).await
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, json)
}

/// Body for `POST /api/v1/documents`.
pub fn upload_body(document_id: uuid::Uuid) -> serde_json::Value {
    serde_json::json!({
        "document_id": document_id,
        "owner_id": uuid::Uuid::new_v4(),
        "title": "Annual report",
        "content_type": "application/pdf",
        "file_size": 81_920,
    })
}

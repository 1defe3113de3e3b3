//! Routes for the document review bounded context.

use axum::extract::{Path, State};
use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use docreview_documents::application::command_handlers::{self, CommandResult};
use docreview_documents::application::query_handlers::{
    self, DocumentSummaryView, DocumentView,
};
use docreview_documents::domain::commands;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /.
#[derive(Debug, Deserialize)]
pub struct UploadDocumentRequest {
    /// Client-chosen document identifier.
    pub document_id: Uuid,
    /// The uploading user.
    pub owner_id: Uuid,
    /// Display title.
    pub title: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub file_size: u64,
}

/// Request body for POST /{id}/suggestions.
#[derive(Debug, Deserialize)]
pub struct ProposeSuggestionRequest {
    /// Suggestion identifier; generated when absent.
    #[serde(default)]
    pub suggestion_id: Option<Uuid>,
    /// Text to replace.
    pub original_text: String,
    /// Replacement text.
    pub proposed_text: String,
    /// Why the change is suggested.
    #[serde(default)]
    pub rationale: String,
}

/// Request body for POST /{id}/suggestions/{suggestion_id}/reject.
#[derive(Debug, Default, Deserialize)]
pub struct RejectSuggestionRequest {
    /// Why the suggestion was rejected.
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /
#[instrument(skip(state, request), fields(document_id = %request.document_id))]
async fn upload_document(
    State(state): State<AppState>,
    Json(request): Json<UploadDocumentRequest>,
) -> Result<Json<CommandResult>, ApiError> {
    let command = commands::UploadDocument {
        correlation_id: Uuid::new_v4(),
        document_id: request.document_id,
        owner_id: request.owner_id,
        title: request.title,
        content_type: request.content_type,
        file_size: request.file_size,
    };

    info!(correlation_id = %command.correlation_id, "handling upload_document command");

    let result = command_handlers::handle_upload_document(
        &command,
        state.clock.as_ref(),
        &state.documents,
    )
    .await?;
    Ok(Json(result))
}

/// GET /{id}
async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<DocumentView>, ApiError> {
    let view = query_handlers::get_document_by_id(document_id, &state.documents).await?;
    Ok(Json(view))
}

/// GET /{id}/summary
async fn get_summary(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<DocumentSummaryView>, ApiError> {
    let summary = query_handlers::get_document_summary(document_id, &state.document_view)?;
    Ok(Json(summary))
}

/// POST /{id}/suggestions
#[instrument(skip(state, request))]
async fn propose_suggestion(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Json(request): Json<ProposeSuggestionRequest>,
) -> Result<Json<CommandResult>, ApiError> {
    let command = commands::ProposeSuggestion {
        correlation_id: Uuid::new_v4(),
        document_id,
        suggestion_id: request.suggestion_id.unwrap_or_else(Uuid::new_v4),
        original_text: request.original_text,
        proposed_text: request.proposed_text,
        rationale: request.rationale,
    };

    info!(
        correlation_id = %command.correlation_id,
        suggestion_id = %command.suggestion_id,
        "handling propose_suggestion command"
    );

    let result = command_handlers::handle_propose_suggestion(
        &command,
        state.clock.as_ref(),
        &state.documents,
    )
    .await?;
    Ok(Json(result))
}

/// POST /{id}/suggestions/{suggestion_id}/accept
#[instrument(skip(state))]
async fn accept_suggestion(
    State(state): State<AppState>,
    Path((document_id, suggestion_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CommandResult>, ApiError> {
    let command = commands::AcceptSuggestion {
        correlation_id: Uuid::new_v4(),
        document_id,
        suggestion_id,
    };

    info!(correlation_id = %command.correlation_id, "handling accept_suggestion command");

    let result = command_handlers::handle_accept_suggestion(
        &command,
        state.clock.as_ref(),
        &state.documents,
    )
    .await?;
    Ok(Json(result))
}

/// POST /{id}/suggestions/{suggestion_id}/reject
#[instrument(skip(state, request))]
async fn reject_suggestion(
    State(state): State<AppState>,
    Path((document_id, suggestion_id)): Path<(Uuid, Uuid)>,
    request: Option<Json<RejectSuggestionRequest>>,
) -> Result<Json<CommandResult>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let command = commands::RejectSuggestion {
        correlation_id: Uuid::new_v4(),
        document_id,
        suggestion_id,
        reason: request.reason,
    };

    info!(correlation_id = %command.correlation_id, "handling reject_suggestion command");

    let result = command_handlers::handle_reject_suggestion(
        &command,
        state.clock.as_ref(),
        &state.documents,
    )
    .await?;
    Ok(Json(result))
}

/// Returns the router for the document context.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(upload_document))
        .route("/{id}", get(get_document))
        .route("/{id}/summary", get(get_summary))
        .route("/{id}/suggestions", post(propose_suggestion))
        .route(
            "/{id}/suggestions/{suggestion_id}/accept",
            post(accept_suggestion),
        )
        .route(
            "/{id}/suggestions/{suggestion_id}/reject",
            post(reject_suggestion),
        )
}

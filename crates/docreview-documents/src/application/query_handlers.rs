//! Query handlers for the document review context.

use docreview_core::aggregate_repository::AggregateRepository;
use docreview_core::error::DomainError;
use serde::Serialize;
use uuid::Uuid;

use crate::application::projection::{DocumentSummary, DocumentViewProjection, SuggestionCounts};
use crate::domain::aggregates::{Document, Suggestion};

/// Read-only view of a document aggregate.
#[derive(Debug, Serialize)]
pub struct DocumentView {
    /// The document identifier.
    pub document_id: Uuid,
    /// The uploading user.
    pub owner_id: Option<Uuid>,
    /// Display title.
    pub title: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub file_size: u64,
    /// Suggestions in proposal order.
    pub suggestions: Vec<Suggestion>,
    /// Current version (event count).
    pub version: i64,
}

/// Read-model view of a document's review progress.
#[derive(Debug, Serialize)]
pub struct DocumentSummaryView {
    /// The summary row.
    #[serde(flatten)]
    pub summary: DocumentSummary,
    /// Suggestion counts by review state.
    pub counts: SuggestionCounts,
}

/// Retrieves a document by folding its events.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if no events exist for the ID.
/// Returns `DomainError::SchemaIncompatible` if an event cannot be upcast.
pub async fn get_document_by_id(
    document_id: Uuid,
    repo: &AggregateRepository<Document>,
) -> Result<DocumentView, DomainError> {
    let document = repo.get_existing(document_id).await?;
    let state = document.state();
    Ok(DocumentView {
        document_id,
        owner_id: state.owner_id,
        title: state.title.clone(),
        content_type: state.content_type.clone(),
        file_size: state.file_size,
        suggestions: state.suggestions.clone(),
        version: document.version(),
    })
}

/// Retrieves a document's summary from the `document_view` read model.
///
/// The read model is eventually consistent with the log.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the read model has no row for
/// the ID.
pub fn get_document_summary(
    document_id: Uuid,
    view: &DocumentViewProjection,
) -> Result<DocumentSummaryView, DomainError> {
    let summary = view
        .document(document_id)
        .ok_or(DomainError::AggregateNotFound(document_id))?;
    let counts = summary.counts();
    Ok(DocumentSummaryView { summary, counts })
}

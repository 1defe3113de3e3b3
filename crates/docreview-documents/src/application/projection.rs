//! The `document_view` read model.
//!
//! Kept in memory, so it is rebuilt from the start of the log on every
//! process start and by replay after a reset.
//! Every handler is idempotent and tolerates events of one document arriving
//! out of order, which is what retries produce.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use docreview_core::projection::{Projection, ProjectionError};
use docreview_core::repository::StoredEvent;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::SuggestionStatus;
use crate::domain::events::DocumentEventKind;

/// Projection name used for checkpoints and failure records.
pub const DOCUMENT_VIEW: &str = "document_view";

/// Per-document row of the read model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    /// Document identifier.
    pub document_id: Uuid,
    /// Uploading user, once the upload has been applied.
    pub owner_id: Option<Uuid>,
    /// Display title.
    pub title: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub file_size: u64,
    /// Review state of every suggestion.
    pub suggestions: BTreeMap<Uuid, SuggestionStatus>,
}

/// Suggestion counts of one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SuggestionCounts {
    /// Awaiting review.
    pub pending: usize,
    /// Accepted by the user.
    pub accepted: usize,
    /// Rejected by the user.
    pub rejected: usize,
}

impl DocumentSummary {
    /// Counts suggestions by review state.
    #[must_use]
    pub fn counts(&self) -> SuggestionCounts {
        let mut counts = SuggestionCounts::default();
        for status in self.suggestions.values() {
            match status {
                SuggestionStatus::Pending => counts.pending += 1,
                SuggestionStatus::Accepted => counts.accepted += 1,
                SuggestionStatus::Rejected => counts.rejected += 1,
            }
        }
        counts
    }
}

/// Read model listing documents and their review progress.
#[derive(Debug, Default)]
pub struct DocumentViewProjection {
    documents: RwLock<HashMap<Uuid, DocumentSummary>>,
}

impl DocumentViewProjection {
    /// Creates an empty read model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Summary of one document.
    #[must_use]
    pub fn document(&self, document_id: Uuid) -> Option<DocumentSummary> {
        self.documents.read().ok()?.get(&document_id).cloned()
    }

    /// Every summary, ordered by document id.
    #[must_use]
    pub fn all(&self) -> BTreeMap<Uuid, DocumentSummary> {
        self.documents
            .read()
            .map(|documents| {
                documents
                    .iter()
                    .map(|(id, summary)| (*id, summary.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Projection for DocumentViewProjection {
    fn name(&self) -> &str {
        DOCUMENT_VIEW
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn handle(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        let kind =
            DocumentEventKind::decode(&event.event_type, event.schema_version, &event.payload)?;
        let mut documents = self
            .documents
            .write()
            .map_err(|_| ProjectionError::Handler("document view lock poisoned".into()))?;
        let summary = documents
            .entry(event.aggregate_id)
            .or_insert_with(|| DocumentSummary {
                document_id: event.aggregate_id,
                ..DocumentSummary::default()
            });

        match kind {
            DocumentEventKind::DocumentUploaded(payload) => {
                summary.owner_id = Some(payload.owner_id);
                summary.title = payload.title;
                summary.content_type = payload.content_type;
                summary.file_size = payload.file_size;
            }
            DocumentEventKind::SuggestionProposed(payload) => {
                summary
                    .suggestions
                    .entry(payload.suggestion_id)
                    .or_insert(SuggestionStatus::Pending);
            }
            DocumentEventKind::SuggestionAccepted(payload) => {
                summary
                    .suggestions
                    .insert(payload.suggestion_id, SuggestionStatus::Accepted);
            }
            DocumentEventKind::SuggestionRejected(payload) => {
                summary
                    .suggestions
                    .insert(payload.suggestion_id, SuggestionStatus::Rejected);
            }
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), ProjectionError> {
        self.documents
            .write()
            .map_err(|_| ProjectionError::Handler("document view lock poisoned".into()))?
            .clear();
        Ok(())
    }
}

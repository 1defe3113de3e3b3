//! Command handlers for the document review context.
//!
//! Each handler runs the load → decide → save cycle through
//! [`AggregateRepository::execute`], so a concurrent writer only costs a
//! reload and another attempt.

use docreview_core::aggregate_repository::AggregateRepository;
use docreview_core::clock::Clock;
use docreview_core::error::DomainError;
use docreview_core::repository::StoredEvent;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::aggregates::Document;
use crate::domain::commands::{
    AcceptSuggestion, ProposeSuggestion, RejectSuggestion, UploadDocument,
};

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Identifiers of the committed events.
    pub event_ids: Vec<Uuid>,
    /// Aggregate version after the commit.
    pub version: i64,
}

impl CommandResult {
    fn from_committed(version: i64, committed: &[StoredEvent]) -> Self {
        Self {
            event_ids: committed.iter().map(|e| e.event_id).collect(),
            version,
        }
    }
}

/// Handles `UploadDocument`.
///
/// # Errors
///
/// Returns `DomainError::Validation` if the document exists or the command is
/// invalid, or any storage error.
#[instrument(skip(command, clock, repo), fields(document_id = %command.document_id))]
pub async fn handle_upload_document(
    command: &UploadDocument,
    clock: &dyn Clock,
    repo: &AggregateRepository<Document>,
) -> Result<CommandResult, DomainError> {
    let (document, committed) = repo
        .execute(command.document_id, |document| {
            Document::upload(document, command, clock)
        })
        .await?;
    Ok(CommandResult::from_committed(document.version(), &committed))
}

/// Handles `ProposeSuggestion`.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for unknown documents,
/// `DomainError::Validation` for invalid suggestions, or any storage error.
#[instrument(skip(command, clock, repo), fields(document_id = %command.document_id))]
pub async fn handle_propose_suggestion(
    command: &ProposeSuggestion,
    clock: &dyn Clock,
    repo: &AggregateRepository<Document>,
) -> Result<CommandResult, DomainError> {
    let (document, committed) = repo
        .execute(command.document_id, |document| {
            Document::propose_suggestion(document, command, clock)
        })
        .await?;
    Ok(CommandResult::from_committed(document.version(), &committed))
}

/// Handles `AcceptSuggestion`.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for unknown documents,
/// `DomainError::Validation` for unknown or reviewed suggestions, or any
/// storage error.
#[instrument(skip(command, clock, repo), fields(document_id = %command.document_id))]
pub async fn handle_accept_suggestion(
    command: &AcceptSuggestion,
    clock: &dyn Clock,
    repo: &AggregateRepository<Document>,
) -> Result<CommandResult, DomainError> {
    let (document, committed) = repo
        .execute(command.document_id, |document| {
            Document::accept_suggestion(document, command, clock)
        })
        .await?;
    Ok(CommandResult::from_committed(document.version(), &committed))
}

/// Handles `RejectSuggestion`.
///
/// # Errors
///
/// See [`handle_accept_suggestion`].
#[instrument(skip(command, clock, repo), fields(document_id = %command.document_id))]
pub async fn handle_reject_suggestion(
    command: &RejectSuggestion,
    clock: &dyn Clock,
    repo: &AggregateRepository<Document>,
) -> Result<CommandResult, DomainError> {
    let (document, committed) = repo
        .execute(command.document_id, |document| {
            Document::reject_suggestion(document, command, clock)
        })
        .await?;
    Ok(CommandResult::from_committed(document.version(), &committed))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use docreview_core::repository::EventRepository;
    use docreview_test_support::{FailingEventRepository, FixedClock, InMemoryEventStore};
    use uuid::Uuid;

    use super::*;
    use crate::domain::events::upcasters;

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
    }

    fn repository(store: Arc<dyn EventRepository>) -> AggregateRepository<Document> {
        AggregateRepository::new(store, Arc::new(upcasters()), Arc::new(clock()))
    }

    fn upload(document_id: Uuid) -> UploadDocument {
        UploadDocument {
            correlation_id: Uuid::new_v4(),
            document_id,
            owner_id: Uuid::new_v4(),
            title: "Thesis draft".into(),
            content_type: "application/pdf".into(),
            file_size: 10_240,
        }
    }

    #[tokio::test]
    async fn test_upload_persists_document_uploaded_event() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let repo = repository(store.clone());
        let command = upload(Uuid::new_v4());

        // Act
        let result = handle_upload_document(&command, &clock(), &repo)
            .await
            .unwrap();

        // Assert
        assert_eq!(result.version, 1);
        assert_eq!(result.event_ids.len(), 1);
        let stored = store.load_events(command.document_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_type, "document.uploaded");
        assert_eq!(stored[0].aggregate_type, "document");
        assert_eq!(stored[0].schema_version, 2);
        assert_eq!(stored[0].payload["file_size"], 10_240);
        assert_eq!(stored[0].correlation_id, command.correlation_id);
        assert_eq!(stored[0].occurred_at, clock().0);
    }

    #[tokio::test]
    async fn test_review_flow_advances_version() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let repo = repository(store);
        let document_id = Uuid::new_v4();
        handle_upload_document(&upload(document_id), &clock(), &repo)
            .await
            .unwrap();
        let suggestion_id = Uuid::new_v4();
        let propose = ProposeSuggestion {
            correlation_id: Uuid::new_v4(),
            document_id,
            suggestion_id,
            original_text: "alot".into(),
            proposed_text: "a lot".into(),
            rationale: "spelling".into(),
        };

        // Act
        let proposed = handle_propose_suggestion(&propose, &clock(), &repo)
            .await
            .unwrap();
        let accepted = handle_accept_suggestion(
            &AcceptSuggestion {
                correlation_id: Uuid::new_v4(),
                document_id,
                suggestion_id,
            },
            &clock(),
            &repo,
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(proposed.version, 2);
        assert_eq!(accepted.version, 3);
    }

    #[tokio::test]
    async fn test_reject_on_unknown_document_is_not_found() {
        let repo = repository(Arc::new(InMemoryEventStore::new()));
        let document_id = Uuid::new_v4();
        let command = RejectSuggestion {
            correlation_id: Uuid::new_v4(),
            document_id,
            suggestion_id: Uuid::new_v4(),
            reason: None,
        };

        let result = handle_reject_suggestion(&command, &clock(), &repo).await;

        match result {
            Err(DomainError::AggregateNotFound(id)) => assert_eq!(id, document_id),
            other => panic!("expected AggregateNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let repo = repository(Arc::new(FailingEventRepository));

        let result = handle_upload_document(&upload(Uuid::new_v4()), &clock(), &repo).await;

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }
}

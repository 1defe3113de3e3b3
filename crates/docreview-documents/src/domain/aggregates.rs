//! Aggregate root for the document review context.

use docreview_core::aggregate::{Aggregate, AggregateRoot};
use docreview_core::clock::Clock;
use docreview_core::error::DomainError;
use docreview_core::event::EventMetadata;
use docreview_core::repository::StoredEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::commands::{AcceptSuggestion, ProposeSuggestion, RejectSuggestion, UploadDocument};
use super::events::{
    DocumentEvent, DocumentEventKind, DocumentUploaded, SuggestionAccepted, SuggestionProposed,
    SuggestionRejected,
};

/// Review state of a suggested edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    /// Waiting for the user.
    Pending,
    /// The user took the edit.
    Accepted,
    /// The user declined the edit.
    Rejected,
}

/// A suggested edit and its review state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Suggestion identifier.
    pub suggestion_id: Uuid,
    /// Text the suggestion replaces.
    pub original_text: String,
    /// Replacement text.
    pub proposed_text: String,
    /// Why the edit was proposed.
    pub rationale: String,
    /// Review state.
    pub status: SuggestionStatus,
}

/// Folded state of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    /// The uploading user, once uploaded.
    pub owner_id: Option<Uuid>,
    /// Display title.
    pub title: String,
    /// MIME type of the converted document.
    pub content_type: String,
    /// Size in bytes of the uploaded file (`0` for documents uploaded before
    /// sizes were recorded).
    pub file_size: u64,
    /// Suggestions in proposal order.
    pub suggestions: Vec<Suggestion>,
}

impl DocumentState {
    /// Looks up a suggestion by identifier.
    #[must_use]
    pub fn suggestion(&self, suggestion_id: Uuid) -> Option<&Suggestion> {
        self.suggestions
            .iter()
            .find(|s| s.suggestion_id == suggestion_id)
    }
}

/// The document aggregate: a reviewed document and its suggested edits.
#[derive(Debug)]
pub struct Document;

impl AggregateRoot for Document {
    type Event = DocumentEvent;
    type State = DocumentState;
    const AGGREGATE_TYPE: &'static str = "document";

    fn apply(state: &DocumentState, event: &DocumentEvent) -> DocumentState {
        let mut next = state.clone();
        match &event.kind {
            DocumentEventKind::DocumentUploaded(payload) => {
                next.owner_id = Some(payload.owner_id);
                next.title.clone_from(&payload.title);
                next.content_type.clone_from(&payload.content_type);
                next.file_size = payload.file_size;
            }
            DocumentEventKind::SuggestionProposed(payload) => {
                next.suggestions.push(Suggestion {
                    suggestion_id: payload.suggestion_id,
                    original_text: payload.original_text.clone(),
                    proposed_text: payload.proposed_text.clone(),
                    rationale: payload.rationale.clone(),
                    status: SuggestionStatus::Pending,
                });
            }
            DocumentEventKind::SuggestionAccepted(payload) => {
                set_status(&mut next, payload.suggestion_id, SuggestionStatus::Accepted);
            }
            DocumentEventKind::SuggestionRejected(payload) => {
                set_status(&mut next, payload.suggestion_id, SuggestionStatus::Rejected);
            }
        }
        next
    }

    fn decode(stored: &StoredEvent) -> Result<DocumentEvent, DomainError> {
        DocumentEvent::from_stored(stored)
    }
}

fn set_status(state: &mut DocumentState, suggestion_id: Uuid, status: SuggestionStatus) {
    if let Some(suggestion) = state
        .suggestions
        .iter_mut()
        .find(|s| s.suggestion_id == suggestion_id)
    {
        suggestion.status = status;
    }
}

impl Document {
    /// Records the upload of a new document.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the document already exists or
    /// the title is blank.
    pub fn upload(
        document: &mut Aggregate<Self>,
        command: &UploadDocument,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        if !document.is_new() {
            return Err(DomainError::Validation(format!(
                "document {} already exists",
                document.id()
            )));
        }
        if command.title.trim().is_empty() {
            return Err(DomainError::Validation("title must not be blank".into()));
        }
        let kind = DocumentEventKind::DocumentUploaded(DocumentUploaded {
            document_id: document.id(),
            owner_id: command.owner_id,
            title: command.title.clone(),
            content_type: command.content_type.clone(),
            file_size: command.file_size,
        });
        record(document, command.correlation_id, clock, kind);
        Ok(())
    }

    /// Records an edit proposed for the document.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the document was never
    /// uploaded and `DomainError::Validation` for duplicate suggestion ids
    /// or an empty replacement.
    pub fn propose_suggestion(
        document: &mut Aggregate<Self>,
        command: &ProposeSuggestion,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        ensure_uploaded(document)?;
        if document.state().suggestion(command.suggestion_id).is_some() {
            return Err(DomainError::Validation(format!(
                "suggestion {} already exists",
                command.suggestion_id
            )));
        }
        if command.proposed_text.is_empty() && command.original_text.is_empty() {
            return Err(DomainError::Validation(
                "a suggestion must change some text".into(),
            ));
        }
        let kind = DocumentEventKind::SuggestionProposed(SuggestionProposed {
            document_id: document.id(),
            suggestion_id: command.suggestion_id,
            original_text: command.original_text.clone(),
            proposed_text: command.proposed_text.clone(),
            rationale: command.rationale.clone(),
        });
        record(document, command.correlation_id, clock, kind);
        Ok(())
    }

    /// Accepts a pending suggestion.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the document was never
    /// uploaded and `DomainError::Validation` if the suggestion is unknown or
    /// already reviewed.
    pub fn accept_suggestion(
        document: &mut Aggregate<Self>,
        command: &AcceptSuggestion,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        ensure_pending(document, command.suggestion_id)?;
        let kind = DocumentEventKind::SuggestionAccepted(SuggestionAccepted {
            document_id: document.id(),
            suggestion_id: command.suggestion_id,
        });
        record(document, command.correlation_id, clock, kind);
        Ok(())
    }

    /// Rejects a pending suggestion.
    ///
    /// # Errors
    ///
    /// See [`Document::accept_suggestion`].
    pub fn reject_suggestion(
        document: &mut Aggregate<Self>,
        command: &RejectSuggestion,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        ensure_pending(document, command.suggestion_id)?;
        let kind = DocumentEventKind::SuggestionRejected(SuggestionRejected {
            document_id: document.id(),
            suggestion_id: command.suggestion_id,
            reason: command.reason.clone(),
        });
        record(document, command.correlation_id, clock, kind);
        Ok(())
    }
}

fn ensure_uploaded(document: &Aggregate<Document>) -> Result<(), DomainError> {
    if document.is_new() && document.pending_events().is_empty() {
        return Err(DomainError::AggregateNotFound(document.id()));
    }
    Ok(())
}

fn ensure_pending(document: &Aggregate<Document>, suggestion_id: Uuid) -> Result<(), DomainError> {
    ensure_uploaded(document)?;
    match document.state().suggestion(suggestion_id) {
        None => Err(DomainError::Validation(format!(
            "suggestion {suggestion_id} does not exist"
        ))),
        Some(s) if s.status != SuggestionStatus::Pending => Err(DomainError::Validation(format!(
            "suggestion {suggestion_id} was already reviewed"
        ))),
        Some(_) => Ok(()),
    }
}

fn record(
    document: &mut Aggregate<Document>,
    correlation_id: Uuid,
    clock: &dyn Clock,
    kind: DocumentEventKind,
) {
    let event = DocumentEvent {
        metadata: EventMetadata {
            event_id: Uuid::new_v4(),
            event_type: kind.event_type().to_owned(),
            aggregate_id: document.id(),
            sequence_number: document.next_sequence_number(),
            correlation_id,
            causation_id: correlation_id,
            occurred_at: clock.now(),
        },
        kind,
    };
    document.record(event);
}

//! Domain events for the document review context.

use docreview_core::error::DomainError;
use docreview_core::event::{DomainEvent, EventMetadata};
use docreview_core::repository::StoredEvent;
use docreview_core::upcaster::UpcasterRegistry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type of [`DocumentUploaded`].
pub const DOCUMENT_UPLOADED: &str = "document.uploaded";
/// Event type of [`SuggestionProposed`].
pub const SUGGESTION_PROPOSED: &str = "suggestion.proposed";
/// Event type of [`SuggestionAccepted`].
pub const SUGGESTION_ACCEPTED: &str = "suggestion.accepted";
/// Event type of [`SuggestionRejected`].
pub const SUGGESTION_REJECTED: &str = "suggestion.rejected";

/// Emitted when a user uploads a document.
///
/// Schema v2 added `file_size`; v1 payloads are upcast with `file_size = 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUploaded {
    /// The document identifier.
    pub document_id: Uuid,
    /// The uploading user.
    pub owner_id: Uuid,
    /// Display title.
    pub title: String,
    /// MIME type of the converted document.
    pub content_type: String,
    /// Size in bytes of the uploaded file.
    pub file_size: u64,
}

/// Emitted when the assistant proposes an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionProposed {
    /// The document being reviewed.
    pub document_id: Uuid,
    /// The suggestion identifier.
    pub suggestion_id: Uuid,
    /// Text the suggestion replaces.
    pub original_text: String,
    /// Replacement text.
    pub proposed_text: String,
    /// Why the edit was proposed.
    pub rationale: String,
}

/// Emitted when a user accepts a suggested edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionAccepted {
    /// The document being reviewed.
    pub document_id: Uuid,
    /// The accepted suggestion.
    pub suggestion_id: Uuid,
}

/// Emitted when a user rejects a suggested edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionRejected {
    /// The document being reviewed.
    pub document_id: Uuid,
    /// The rejected suggestion.
    pub suggestion_id: Uuid,
    /// Optional reason given by the user.
    pub reason: Option<String>,
}

/// Event payload variants for the document review context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEventKind {
    /// A document was uploaded.
    DocumentUploaded(DocumentUploaded),
    /// An edit was proposed.
    SuggestionProposed(SuggestionProposed),
    /// An edit was accepted.
    SuggestionAccepted(SuggestionAccepted),
    /// An edit was rejected.
    SuggestionRejected(SuggestionRejected),
}

impl DocumentEventKind {
    /// Stored event type of this variant.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::DocumentUploaded(_) => DOCUMENT_UPLOADED,
            Self::SuggestionProposed(_) => SUGGESTION_PROPOSED,
            Self::SuggestionAccepted(_) => SUGGESTION_ACCEPTED,
            Self::SuggestionRejected(_) => SUGGESTION_REJECTED,
        }
    }

    /// Decodes an upcast payload using its stored event type.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::SchemaIncompatible` for unknown event types or
    /// payloads that do not match the type's current shape.
    pub fn decode(
        event_type: &str,
        schema_version: i32,
        payload: &serde_json::Value,
    ) -> Result<Self, DomainError> {
        fn parse<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, String> {
            T::deserialize(payload).map_err(|e| e.to_string())
        }
        let incompatible = |reason: String| DomainError::SchemaIncompatible {
            event_type: event_type.to_owned(),
            schema_version,
            reason,
        };

        match event_type {
            DOCUMENT_UPLOADED => parse(payload).map(Self::DocumentUploaded),
            SUGGESTION_PROPOSED => parse(payload).map(Self::SuggestionProposed),
            SUGGESTION_ACCEPTED => parse(payload).map(Self::SuggestionAccepted),
            SUGGESTION_REJECTED => parse(payload).map(Self::SuggestionRejected),
            other => Err(format!("unknown event type {other}")),
        }
        .map_err(incompatible)
    }
}

/// Domain event envelope for the document review context.
#[derive(Debug, Clone)]
pub struct DocumentEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: DocumentEventKind,
}

impl DocumentEvent {
    /// Rebuilds a domain event from an already upcast stored event.
    ///
    /// # Errors
    ///
    /// See [`DocumentEventKind::decode`].
    pub fn from_stored(stored: &StoredEvent) -> Result<Self, DomainError> {
        let kind =
            DocumentEventKind::decode(&stored.event_type, stored.schema_version, &stored.payload)?;
        Ok(Self {
            metadata: EventMetadata {
                event_id: stored.event_id,
                event_type: stored.event_type.clone(),
                aggregate_id: stored.aggregate_id,
                sequence_number: stored.aggregate_sequence,
                correlation_id: stored.correlation_id,
                causation_id: stored.causation_id,
                occurred_at: stored.occurred_at,
            },
            kind,
        })
    }
}

impl DomainEvent for DocumentEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn schema_version(&self) -> i32 {
        match &self.kind {
            DocumentEventKind::DocumentUploaded(_) => 2,
            _ => 1,
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
        let payload = match &self.kind {
            DocumentEventKind::DocumentUploaded(e) => serde_json::to_value(e),
            DocumentEventKind::SuggestionProposed(e) => serde_json::to_value(e),
            DocumentEventKind::SuggestionAccepted(e) => serde_json::to_value(e),
            DocumentEventKind::SuggestionRejected(e) => serde_json::to_value(e),
        };
        payload.map_err(|e| DomainError::Infrastructure(format!("event serialization failed: {e}")))
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// Upcast chains for every event type of this context.
#[must_use]
pub fn upcasters() -> UpcasterRegistry {
    UpcasterRegistry::new()
        .with_schema(DOCUMENT_UPLOADED, 2, 2)
        .with_upcaster(DOCUMENT_UPLOADED, 1, |mut payload| {
            payload
                .as_object_mut()
                .ok_or_else(|| "payload is not an object".to_owned())?
                .entry("file_size")
                .or_insert(serde_json::json!(0));
            Ok(payload)
        })
        .with_schema(SUGGESTION_PROPOSED, 1, 1)
        .with_schema(SUGGESTION_ACCEPTED, 1, 1)
        .with_schema(SUGGESTION_REJECTED, 1, 1)
}

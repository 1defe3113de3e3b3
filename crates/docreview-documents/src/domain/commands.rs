//! Commands for the document review context.

use uuid::Uuid;

/// Command to register an uploaded document.
#[derive(Debug, Clone)]
pub struct UploadDocument {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The new document's identifier.
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

/// Command to record an edit proposed by the assistant.
#[derive(Debug, Clone)]
pub struct ProposeSuggestion {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The document under review.
    pub document_id: Uuid,
    /// Identifier chosen for the suggestion.
    pub suggestion_id: Uuid,
    /// Text the suggestion replaces.
    pub original_text: String,
    /// Replacement text.
    pub proposed_text: String,
    /// Why the edit was proposed.
    pub rationale: String,
}

/// Command to accept a pending suggestion.
#[derive(Debug, Clone)]
pub struct AcceptSuggestion {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The document under review.
    pub document_id: Uuid,
    /// The suggestion to accept.
    pub suggestion_id: Uuid,
}

/// Command to reject a pending suggestion.
#[derive(Debug, Clone)]
pub struct RejectSuggestion {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The document under review.
    pub document_id: Uuid,
    /// The suggestion to reject.
    pub suggestion_id: Uuid,
    /// Optional reason.
    pub reason: Option<String>,
}

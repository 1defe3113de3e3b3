//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// Optimistic concurrency conflict.
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A stored payload cannot be brought to a schema the running code reads.
    ///
    /// This is a deployment or data bug and is never retried.
    #[error("schema incompatible for {event_type} v{schema_version}: {reason}")]
    SchemaIncompatible {
        /// The stored event type.
        event_type: String,
        /// The stored schema version.
        schema_version: i32,
        /// Why no upcast path exists.
        reason: String,
    },

    /// No projection is registered under the given name.
    #[error("projection not found: {0}")]
    ProjectionNotFound(String),

    /// No failure record exists with the given identifier.
    #[error("failure record not found: {0}")]
    FailureNotFound(i64),

    /// A transient infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` when repeating the operation may succeed.
    ///
    /// Concurrency conflicts are retried by reloading the aggregate; storage
    /// errors are retried with backoff by the calling layer.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Infrastructure(_)
        )
    }
}

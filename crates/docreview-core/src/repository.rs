//! Event repository abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::DomainEvent;

/// An event that has not been committed yet.
///
/// Sequence numbers are assigned by the event log at commit time.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate kind that owns the stream.
    pub aggregate_type: String,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Schema version of `payload`.
    pub schema_version: i32,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Causation ID linking to the causing event/command.
    pub causation_id: Uuid,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// Builds an uncommitted record from a domain event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload cannot be serialized.
    pub fn from_domain_event<E: DomainEvent>(
        aggregate_type: &str,
        event: &E,
    ) -> Result<Self, DomainError> {
        let meta = event.metadata();
        Ok(Self {
            event_id: meta.event_id,
            aggregate_type: aggregate_type.to_owned(),
            event_type: event.event_type().to_owned(),
            schema_version: event.schema_version(),
            payload: event.to_payload()?,
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            occurred_at: meta.occurred_at,
        })
    }
}

/// Stored representation of a committed domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Aggregate kind that owns the stream.
    pub aggregate_type: String,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Schema version of `payload`.
    pub schema_version: i32,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Sequence number within the aggregate stream, `1..=N` without gaps.
    pub aggregate_sequence: i64,
    /// Position in the whole log, strictly increasing and gapless.
    pub global_sequence: i64,
    /// Correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Causation ID linking to the causing event/command.
    pub causation_id: Uuid,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

/// Serialized aggregate state at a given version.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Aggregate the snapshot belongs to.
    pub aggregate_id: Uuid,
    /// Aggregate kind the state was produced by.
    pub aggregate_type: String,
    /// Last aggregate sequence folded into `state`.
    pub version: i64,
    /// Shape version of the serialized state.
    pub state_version: i32,
    /// Serialized state.
    pub state: serde_json::Value,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Repository trait for loading and appending domain events.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Load all events for a given aggregate, ordered by aggregate sequence.
    async fn load_events(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError> {
        self.load_events_after(aggregate_id, 0).await
    }

    /// Load the events of an aggregate whose sequence is greater than `version`.
    async fn load_events_after(
        &self,
        aggregate_id: Uuid,
        version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Append new events to an aggregate stream with optimistic concurrency.
    ///
    /// `expected_version` is the last sequence number the caller observed.
    /// The check and the insert happen under one lock, and the batch is
    /// committed as a unit. Returns the committed events with their assigned
    /// aggregate and global sequence numbers.
    async fn append_events(
        &self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[NewEvent],
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Reads the global stream after `after_global_sequence`, at most `limit`
    /// events, in global order.
    async fn read_all(
        &self,
        after_global_sequence: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Loads a single event by its global position.
    async fn load_by_global_sequence(
        &self,
        global_sequence: i64,
    ) -> Result<Option<StoredEvent>, DomainError>;

    /// Highest committed global sequence, `0` for an empty log.
    async fn head_global_sequence(&self) -> Result<i64, DomainError>;
}

/// Storage for aggregate snapshots.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Most recent snapshot with `version <= max_version` (any version when
    /// `max_version` is `None`).
    async fn load_latest_snapshot(
        &self,
        aggregate_id: Uuid,
        max_version: Option<i64>,
    ) -> Result<Option<Snapshot>, DomainError>;

    /// Persists a snapshot. Writing the same version twice is a no-op.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError>;
}

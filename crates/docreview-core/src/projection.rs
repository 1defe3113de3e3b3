//! Projection and publisher contracts.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::DomainError;
use crate::repository::StoredEvent;

/// Error returned by a projection handler.
///
/// Handler errors never reach the command caller: they are recorded per
/// projection and retried with backoff.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The handler rejected or could not apply the event.
    #[error("projection handler failed: {0}")]
    Handler(String),

    /// The event payload did not match the shape the handler expects.
    #[error("event payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    /// The stored payload could not be upcast for this handler.
    #[error(transparent)]
    Schema(#[from] DomainError),

    /// The handler panicked.
    #[error("projection handler panicked: {0}")]
    Panicked(String),
}

/// A consumer that derives a read model from the event log.
///
/// Handlers must tolerate re-delivery (replay, retries after a lost
/// checkpoint write) and must not assume retries arrive in global order.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Unique projection name, used for checkpoints and failure records.
    fn name(&self) -> &str;

    /// Whether the handler wants events of this type. Uninteresting events
    /// still advance the checkpoint.
    fn interested_in(&self, _event_type: &str) -> bool {
        true
    }

    /// Whether the read model outlives the process. Projections that keep
    /// it in memory return `false` and are rebuilt from the start of the log
    /// on every start, whatever their stored checkpoint says.
    fn is_durable(&self) -> bool {
        true
    }

    /// Applies one event to the read model.
    async fn handle(&self, event: &StoredEvent) -> Result<(), ProjectionError>;

    /// Clears the read model ahead of a rebuild.
    async fn reset(&self) -> Result<(), ProjectionError> {
        Ok(())
    }
}

/// Receives events right after they are committed.
///
/// The seam between the write path and event consumers: the in-process
/// dispatcher implements it today, a broker producer could tomorrow.
/// Publishing never fails from the caller's point of view because the
/// events are already durable.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Hands committed events, in global order, to consumers.
    async fn publish(&self, events: &[StoredEvent]);
}

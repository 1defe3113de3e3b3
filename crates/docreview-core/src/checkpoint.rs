//! Projection progress and failure bookkeeping.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Progress of a single projection through the global event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionCheckpoint {
    /// Projection name.
    pub projection_name: String,
    /// Every event at or below this position has been applied (or resolved
    /// by an operator). Never moves backwards except through replay/reset.
    pub last_applied_global_sequence: i64,
    /// Highest position handed to the projection on the first pass.
    pub dispatched_through: i64,
    /// Last modification time.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectionCheckpoint {
    /// Checkpoint of a projection that has not processed anything.
    #[must_use]
    pub fn empty(projection_name: &str) -> Self {
        Self {
            projection_name: projection_name.to_owned(),
            last_applied_global_sequence: 0,
            dispatched_through: 0,
            updated_at: None,
        }
    }
}

/// How a failure record was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A later attempt succeeded.
    Retried,
    /// An operator skipped the event for this projection.
    Skipped,
    /// An operator repaired the read model out-of-band.
    ManualFix,
}

impl Resolution {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retried => "retried",
            Self::Skipped => "skipped",
            Self::ManualFix => "manual_fix",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retried" => Ok(Self::Retried),
            "skipped" => Ok(Self::Skipped),
            "manual_fix" => Ok(Self::ManualFix),
            other => Err(DomainError::Infrastructure(format!(
                "invalid failure resolution: {other}"
            ))),
        }
    }
}

/// Operator action on an unresolved failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Give the event one more attempt through the retry worker.
    Retry,
    /// Close the record without reapplying the event.
    Skip,
    /// Close the record; the read model was fixed by hand.
    ManualFix,
}

/// A (projection, event) pair that failed to apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Record identifier.
    pub id: i64,
    /// Projection that failed.
    pub projection_name: String,
    /// Global position of the failed event.
    pub event_global_sequence: i64,
    /// Aggregate the event belongs to.
    pub aggregate_id: Uuid,
    /// Type of the failed event.
    pub event_type: String,
    /// Number of failed attempts so far.
    pub retry_count: i32,
    /// When the retry worker may pick the record up again.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Error message of the latest attempt.
    pub last_error: String,
    /// Whether the record is closed.
    pub resolved: bool,
    /// How the record was closed.
    pub resolution: Option<Resolution>,
    /// Retries are exhausted; only an operator can move it on.
    pub permanently_failed: bool,
    /// Lease held by a retry worker, if any.
    pub claimed_until: Option<DateTime<Utc>>,
    /// First failure time.
    pub first_failed_at: DateTime<Utc>,
    /// Latest failure time.
    pub last_failed_at: DateTime<Utc>,
    /// When the record was closed.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input for recording one failed attempt.
#[derive(Debug, Clone)]
pub struct FailureAttempt {
    /// Projection that failed.
    pub projection_name: String,
    /// Global position of the failed event.
    pub event_global_sequence: i64,
    /// Aggregate the event belongs to.
    pub aggregate_id: Uuid,
    /// Type of the failed event.
    pub event_type: String,
    /// Error message.
    pub error: String,
    /// Time of the attempt.
    pub failed_at: DateTime<Utc>,
}

/// Counts of open failures for one projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    /// Unresolved records, permanent ones included.
    pub unresolved: i64,
    /// Unresolved records whose retries are exhausted.
    pub permanent: i64,
}

/// Storage for checkpoints and failure records.
///
/// Only the dispatcher and the failure tracker write through this trait.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Loads the checkpoint, returning an empty one for unknown projections.
    async fn load_checkpoint(&self, projection: &str)
    -> Result<ProjectionCheckpoint, DomainError>;

    /// Moves the first-pass position forward to `global_sequence`. Never
    /// moves it backwards.
    async fn advance_dispatch_position(
        &self,
        projection: &str,
        global_sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError>;

    /// Recomputes the applied watermark as
    /// `max(current, min(dispatched_through, lowest_unresolved_failure - 1))`
    /// in one atomic step.
    async fn refresh_checkpoint(
        &self,
        projection: &str,
        now: DateTime<Utc>,
    ) -> Result<ProjectionCheckpoint, DomainError>;

    /// Sets both positions to `global_sequence` (operator replay).
    async fn reset_checkpoint(
        &self,
        projection: &str,
        global_sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError>;

    /// Deletes the checkpoint and every failure record of a projection.
    async fn clear_projection(&self, projection: &str) -> Result<(), DomainError>;

    /// Upserts the failure record for `(projection, event)`: a new or
    /// previously resolved record starts at `retry_count = 1`, an open one is
    /// incremented. Any claim is released.
    async fn record_failure_attempt(
        &self,
        attempt: &FailureAttempt,
    ) -> Result<FailureRecord, DomainError>;

    /// Stores the retry schedule of an open record.
    async fn schedule_retry(
        &self,
        failure_id: i64,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        permanently_failed: bool,
    ) -> Result<FailureRecord, DomainError>;

    /// Closes an open record. Returns `None` if it does not exist or was
    /// already closed.
    async fn resolve_failure(
        &self,
        failure_id: i64,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureRecord>, DomainError>;

    /// Looks up the record for `(projection, event)`.
    async fn find_failure(
        &self,
        projection: &str,
        event_global_sequence: i64,
    ) -> Result<Option<FailureRecord>, DomainError>;

    /// Looks up a record by identifier.
    async fn get_failure(&self, failure_id: i64) -> Result<Option<FailureRecord>, DomainError>;

    /// Lists the records of a projection ordered by event position,
    /// optionally filtered on `resolved`.
    async fn list_failures(
        &self,
        projection: &str,
        resolved: Option<bool>,
    ) -> Result<Vec<FailureRecord>, DomainError>;

    /// Atomically claims up to `limit` open, non-permanent records that are
    /// due at `now` and not claimed by someone else, leasing them until
    /// `claim_until`. Results are ordered by event position.
    async fn claim_due_failures(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<FailureRecord>, DomainError>;

    /// Counts open failures of a projection.
    async fn failure_summary(&self, projection: &str) -> Result<FailureSummary, DomainError>;
}

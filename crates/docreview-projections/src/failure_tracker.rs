//! Per-projection failure bookkeeping.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info, instrument, warn};

use docreview_core::checkpoint::{
    FailureAttempt, FailureRecord, ProjectionCheckpoint, ProjectionStore, Resolution,
    ResolutionStrategy,
};
use docreview_core::clock::Clock;
use docreview_core::error::DomainError;
use docreview_core::repository::StoredEvent;
use docreview_core::rng::DeterministicRng;

use crate::backoff::RetryPolicy;

/// Records failures and successes and schedules retries.
pub struct FailureTracker {
    store: Arc<dyn ProjectionStore>,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn DeterministicRng>>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for FailureTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureTracker")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FailureTracker {
    /// Creates a tracker.
    #[must_use]
    pub fn new(
        store: Arc<dyn ProjectionStore>,
        clock: Arc<dyn Clock>,
        rng: Box<dyn DeterministicRng>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            rng: Mutex::new(rng),
            policy,
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records a failed attempt of `projection` at `event` and schedules the
    /// next retry, or marks the record permanent once retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store is unavailable.
    #[instrument(skip(self, event), fields(global_sequence = event.global_sequence))]
    pub async fn record_failure(
        &self,
        projection: &str,
        event: &StoredEvent,
        error: &str,
    ) -> Result<FailureRecord, DomainError> {
        let now = self.clock.now();
        let attempt = FailureAttempt {
            projection_name: projection.to_owned(),
            event_global_sequence: event.global_sequence,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type.clone(),
            error: error.to_owned(),
            failed_at: now,
        };
        let record = self.store.record_failure_attempt(&attempt).await?;

        let permanent = self.policy.is_exhausted(record.retry_count);
        let next_retry_at = if permanent {
            None
        } else {
            Some(self.next_retry_at(now, record.retry_count))
        };
        let record = self
            .store
            .schedule_retry(record.id, record.retry_count, next_retry_at, permanent)
            .await?;

        metrics::counter!("docreview_projection_failures_total", "projection" => projection.to_owned())
            .increment(1);
        if permanent {
            metrics::counter!(
                "docreview_projection_permanent_failures_total",
                "projection" => projection.to_owned()
            )
            .increment(1);
            error!(
                failure_id = record.id,
                retry_count = record.retry_count,
                error,
                "projection failure is permanent, operator action required"
            );
        } else {
            warn!(
                failure_id = record.id,
                retry_count = record.retry_count,
                next_retry_at = ?record.next_retry_at,
                error,
                "projection handler failed, retry scheduled"
            );
        }
        Ok(record)
    }

    /// Records that `projection` applied the event at `global_sequence`:
    /// closes any open failure for it and recomputes the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store is unavailable.
    pub async fn record_success(
        &self,
        projection: &str,
        global_sequence: i64,
    ) -> Result<ProjectionCheckpoint, DomainError> {
        let now = self.clock.now();
        if let Some(failure) = self.store.find_failure(projection, global_sequence).await? {
            if !failure.resolved
                && self
                    .store
                    .resolve_failure(failure.id, Resolution::Retried, now)
                    .await?
                    .is_some()
            {
                metrics::counter!(
                    "docreview_projection_retries_succeeded_total",
                    "projection" => projection.to_owned()
                )
                .increment(1);
                info!(
                    projection,
                    failure_id = failure.id,
                    global_sequence,
                    retry_count = failure.retry_count,
                    "projection failure resolved by retry"
                );
            }
        }
        self.refresh(projection, now).await
    }

    /// Recomputes the checkpoint of `projection`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store is unavailable.
    pub async fn refresh_checkpoint(
        &self,
        projection: &str,
    ) -> Result<ProjectionCheckpoint, DomainError> {
        self.refresh(projection, self.clock.now()).await
    }

    /// Applies an operator decision to an open failure.
    ///
    /// `Retry` makes the record due immediately with one attempt left;
    /// `Skip` and `ManualFix` close it and let the checkpoint move on.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::FailureNotFound` for unknown ids,
    /// `DomainError::Validation` if the record is already resolved.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        failure_id: i64,
        strategy: ResolutionStrategy,
    ) -> Result<FailureRecord, DomainError> {
        let failure = self
            .store
            .get_failure(failure_id)
            .await?
            .ok_or(DomainError::FailureNotFound(failure_id))?;
        if failure.resolved {
            return Err(already_resolved(failure_id));
        }

        let now = self.clock.now();
        let resolution = match strategy {
            ResolutionStrategy::Retry => {
                let retry_count = failure.retry_count.min(self.policy.max_retries);
                let record = self
                    .store
                    .schedule_retry(failure_id, retry_count, Some(now), false)
                    .await?;
                info!(
                    projection = %record.projection_name,
                    global_sequence = record.event_global_sequence,
                    "operator requested another retry"
                );
                return Ok(record);
            }
            ResolutionStrategy::Skip => Resolution::Skipped,
            ResolutionStrategy::ManualFix => Resolution::ManualFix,
        };

        let record = self
            .store
            .resolve_failure(failure_id, resolution, now)
            .await?
            .ok_or_else(|| already_resolved(failure_id))?;
        self.refresh(&record.projection_name, now).await?;
        info!(
            projection = %record.projection_name,
            global_sequence = record.event_global_sequence,
            %resolution,
            "failure resolved by operator"
        );
        Ok(record)
    }

    #[allow(clippy::cast_precision_loss)]
    async fn refresh(
        &self,
        projection: &str,
        now: DateTime<Utc>,
    ) -> Result<ProjectionCheckpoint, DomainError> {
        let checkpoint = self.store.refresh_checkpoint(projection, now).await?;
        metrics::gauge!("docreview_projection_checkpoint", "projection" => projection.to_owned())
            .set(checkpoint.last_applied_global_sequence as f64);
        Ok(checkpoint)
    }

    fn next_retry_at(&self, now: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
        let fraction = self.rng.lock().map_or(0.0, |mut rng| rng.next_f64());
        let delay = self
            .policy
            .with_jitter(self.policy.delay_for_attempt(retry_count), fraction);
        TimeDelta::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn already_resolved(failure_id: i64) -> DomainError {
    DomainError::Validation(format!("failure {failure_id} is already resolved"))
}

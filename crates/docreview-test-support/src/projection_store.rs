//! In-memory `ProjectionStore` with the same semantics as the PostgreSQL one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docreview_core::checkpoint::{
    FailureAttempt, FailureRecord, FailureSummary, ProjectionCheckpoint, ProjectionStore,
    Resolution,
};
use docreview_core::error::DomainError;

#[derive(Debug, Default)]
struct State {
    checkpoints: HashMap<String, ProjectionCheckpoint>,
    failures: BTreeMap<i64, FailureRecord>,
    next_id: i64,
}

impl State {
    fn checkpoint_mut(&mut self, projection: &str) -> &mut ProjectionCheckpoint {
        self.checkpoints
            .entry(projection.to_owned())
            .or_insert_with(|| ProjectionCheckpoint::empty(projection))
    }
}

/// In-memory checkpoints and failure records guarded by one mutex.
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    state: Mutex<State>,
}

impl InMemoryProjectionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every failure record, open or closed.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_failures(&self) -> Vec<FailureRecord> {
        self.state.lock().unwrap().failures.values().cloned().collect()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn load_checkpoint(
        &self,
        projection: &str,
    ) -> Result<ProjectionCheckpoint, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .checkpoints
            .get(projection)
            .cloned()
            .unwrap_or_else(|| ProjectionCheckpoint::empty(projection)))
    }

    async fn advance_dispatch_position(
        &self,
        projection: &str,
        global_sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        let checkpoint = state.checkpoint_mut(projection);
        checkpoint.dispatched_through = checkpoint.dispatched_through.max(global_sequence);
        checkpoint.updated_at = Some(now);
        Ok(())
    }

    async fn refresh_checkpoint(
        &self,
        projection: &str,
        now: DateTime<Utc>,
    ) -> Result<ProjectionCheckpoint, DomainError> {
        let mut state = self.state.lock().unwrap();
        let lowest_open = state
            .failures
            .values()
            .filter(|failure| failure.projection_name == projection && !failure.resolved)
            .map(|failure| failure.event_global_sequence)
            .min();
        let checkpoint = state.checkpoint_mut(projection);
        let target = match lowest_open {
            Some(sequence) => checkpoint.dispatched_through.min(sequence - 1),
            None => checkpoint.dispatched_through,
        };
        checkpoint.last_applied_global_sequence =
            checkpoint.last_applied_global_sequence.max(target);
        checkpoint.updated_at = Some(now);
        Ok(checkpoint.clone())
    }

    async fn reset_checkpoint(
        &self,
        projection: &str,
        global_sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        let checkpoint = state.checkpoint_mut(projection);
        checkpoint.dispatched_through = global_sequence;
        checkpoint.last_applied_global_sequence = global_sequence;
        checkpoint.updated_at = Some(now);
        Ok(())
    }

    async fn clear_projection(&self, projection: &str) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        state.checkpoints.remove(projection);
        state
            .failures
            .retain(|_, failure| failure.projection_name != projection);
        Ok(())
    }

    async fn record_failure_attempt(
        &self,
        attempt: &FailureAttempt,
    ) -> Result<FailureRecord, DomainError> {
        let mut state = self.state.lock().unwrap();
        let existing = state.failures.values_mut().find(|failure| {
            failure.projection_name == attempt.projection_name
                && failure.event_global_sequence == attempt.event_global_sequence
        });

        if let Some(failure) = existing {
            if failure.resolved {
                failure.retry_count = 1;
                failure.resolved = false;
                failure.resolution = None;
                failure.resolved_at = None;
                failure.permanently_failed = false;
            } else {
                failure.retry_count += 1;
            }
            failure.last_error.clone_from(&attempt.error);
            failure.last_failed_at = attempt.failed_at;
            failure.claimed_until = None;
            return Ok(failure.clone());
        }

        state.next_id += 1;
        let record = FailureRecord {
            id: state.next_id,
            projection_name: attempt.projection_name.clone(),
            event_global_sequence: attempt.event_global_sequence,
            aggregate_id: attempt.aggregate_id,
            event_type: attempt.event_type.clone(),
            retry_count: 1,
            next_retry_at: None,
            last_error: attempt.error.clone(),
            resolved: false,
            resolution: None,
            permanently_failed: false,
            claimed_until: None,
            first_failed_at: attempt.failed_at,
            last_failed_at: attempt.failed_at,
            resolved_at: None,
        };
        state.failures.insert(record.id, record.clone());
        Ok(record)
    }

    async fn schedule_retry(
        &self,
        failure_id: i64,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        permanently_failed: bool,
    ) -> Result<FailureRecord, DomainError> {
        let mut state = self.state.lock().unwrap();
        let failure = state
            .failures
            .get_mut(&failure_id)
            .ok_or(DomainError::FailureNotFound(failure_id))?;
        failure.retry_count = retry_count;
        failure.next_retry_at = next_retry_at;
        failure.permanently_failed = permanently_failed;
        failure.claimed_until = None;
        Ok(failure.clone())
    }

    async fn resolve_failure(
        &self,
        failure_id: i64,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureRecord>, DomainError> {
        let mut state = self.state.lock().unwrap();
        let Some(failure) = state.failures.get_mut(&failure_id) else {
            return Ok(None);
        };
        if failure.resolved {
            return Ok(None);
        }
        failure.resolved = true;
        failure.resolution = Some(resolution);
        failure.resolved_at = Some(now);
        failure.next_retry_at = None;
        failure.claimed_until = None;
        Ok(Some(failure.clone()))
    }

    async fn find_failure(
        &self,
        projection: &str,
        event_global_sequence: i64,
    ) -> Result<Option<FailureRecord>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .failures
            .values()
            .find(|failure| {
                failure.projection_name == projection
                    && failure.event_global_sequence == event_global_sequence
            })
            .cloned())
    }

    async fn get_failure(&self, failure_id: i64) -> Result<Option<FailureRecord>, DomainError> {
        Ok(self.state.lock().unwrap().failures.get(&failure_id).cloned())
    }

    async fn list_failures(
        &self,
        projection: &str,
        resolved: Option<bool>,
    ) -> Result<Vec<FailureRecord>, DomainError> {
        let state = self.state.lock().unwrap();
        let mut failures: Vec<FailureRecord> = state
            .failures
            .values()
            .filter(|failure| failure.projection_name == projection)
            .filter(|failure| resolved.is_none_or(|resolved| failure.resolved == resolved))
            .cloned()
            .collect();
        failures.sort_by_key(|failure| failure.event_global_sequence);
        Ok(failures)
    }

    async fn claim_due_failures(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<FailureRecord>, DomainError> {
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<&mut FailureRecord> = state
            .failures
            .values_mut()
            .filter(|failure| {
                !failure.resolved
                    && !failure.permanently_failed
                    && failure.retry_count <= max_retries
                    && failure.next_retry_at.is_some_and(|at| at <= now)
                    && failure.claimed_until.is_none_or(|until| until <= now)
            })
            .collect();
        due.sort_by_key(|failure| (failure.event_global_sequence, failure.id));

        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|failure| {
                failure.claimed_until = Some(claim_until);
                failure.clone()
            })
            .collect())
    }

    async fn failure_summary(&self, projection: &str) -> Result<FailureSummary, DomainError> {
        let state = self.state.lock().unwrap();
        let mut summary = FailureSummary::default();
        for failure in state
            .failures
            .values()
            .filter(|failure| failure.projection_name == projection && !failure.resolved)
        {
            summary.unresolved += 1;
            if failure.permanently_failed {
                summary.permanent += 1;
            }
        }
        Ok(summary)
    }
}

//! Operator surface over the projection pipeline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::instrument;

use docreview_core::checkpoint::{FailureRecord, ProjectionStore, ResolutionStrategy};
use docreview_core::error::DomainError;
use docreview_core::repository::EventRepository;

use crate::config::HealthThresholds;
use crate::dispatcher::{ProjectionDispatcher, ReplayReport};
use crate::failure_tracker::FailureTracker;
use crate::health::ProjectionHealth;

/// Health, replay, reset and failure resolution for registered projections.
#[derive(Clone)]
pub struct ProjectionAdmin {
    dispatcher: Arc<ProjectionDispatcher>,
    tracker: Arc<FailureTracker>,
    events: Arc<dyn EventRepository>,
    store: Arc<dyn ProjectionStore>,
    thresholds: HealthThresholds,
}

impl std::fmt::Debug for ProjectionAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionAdmin")
            .field("dispatcher", &self.dispatcher)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl ProjectionAdmin {
    /// Creates the admin surface.
    #[must_use]
    pub fn new(
        dispatcher: Arc<ProjectionDispatcher>,
        tracker: Arc<FailureTracker>,
        events: Arc<dyn EventRepository>,
        store: Arc<dyn ProjectionStore>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            dispatcher,
            tracker,
            events,
            store,
            thresholds,
        }
    }

    /// Health of every registered projection, in registration order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the log or store is
    /// unavailable.
    pub async fn health(&self) -> Result<Vec<ProjectionHealth>, DomainError> {
        let head = self.events.head_global_sequence().await?;
        let mut reports = Vec::new();
        for name in self.dispatcher.projection_names() {
            reports.push(self.assess(name, head).await?);
        }
        Ok(reports)
    }

    /// Health of one projection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names.
    pub async fn projection_health(&self, name: &str) -> Result<ProjectionHealth, DomainError> {
        self.ensure_registered(name)?;
        let head = self.events.head_global_sequence().await?;
        self.assess(name, head).await
    }

    /// Failure records of a projection, optionally filtered on `resolved`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names.
    pub async fn failures(
        &self,
        name: &str,
        resolved: Option<bool>,
    ) -> Result<Vec<FailureRecord>, DomainError> {
        self.ensure_registered(name)?;
        self.store.list_failures(name, resolved).await
    }

    /// Rebuilds a projection from `from_sequence` (start of the log when
    /// absent). Failed events stop the replay unless `skip_failed` is set.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names,
    /// `DomainError::Validation` when `from_sequence` is negative or past the
    /// head of the log and `DomainError::Infrastructure` if the log or store
    /// is unavailable.
    #[instrument(skip(self, cancel))]
    pub async fn replay(
        &self,
        name: &str,
        from_sequence: Option<i64>,
        skip_failed: bool,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ReplayReport, DomainError> {
        self.ensure_registered(name)?;
        if let Some(from) = from_sequence {
            if from < 0 {
                return Err(DomainError::Validation(format!(
                    "from_sequence must not be negative, got {from}"
                )));
            }
            let head = self.events.head_global_sequence().await?;
            if from > head {
                return Err(DomainError::Validation(format!(
                    "from_sequence {from} is past the head of the log ({head})"
                )));
            }
        }
        self.dispatcher
            .replay(name, from_sequence.unwrap_or(0), skip_failed, cancel)
            .await
    }

    /// Clears a projection's read model, checkpoint and failure records.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names.
    pub async fn reset(&self, name: &str) -> Result<(), DomainError> {
        self.dispatcher.reset(name).await
    }

    /// Applies an operator decision to an open failure record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::FailureNotFound` for unknown ids and
    /// `DomainError::Validation` for records that are already resolved.
    pub async fn resolve(
        &self,
        failure_id: i64,
        strategy: ResolutionStrategy,
    ) -> Result<FailureRecord, DomainError> {
        self.tracker.resolve(failure_id, strategy).await
    }

    async fn assess(&self, name: &str, head: i64) -> Result<ProjectionHealth, DomainError> {
        let checkpoint = self.store.load_checkpoint(name).await?;
        let failures = self.store.failure_summary(name).await?;
        Ok(ProjectionHealth::assess(
            head,
            &checkpoint,
            failures,
            self.thresholds,
        ))
    }

    fn ensure_registered(&self, name: &str) -> Result<(), DomainError> {
        if self.dispatcher.contains(name) {
            Ok(())
        } else {
            Err(DomainError::ProjectionNotFound(name.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docreview_core::checkpoint::Resolution;
    use docreview_core::repository::NewEvent;
    use docreview_core::upcaster::UpcasterRegistry;
    use docreview_test_support::{
        FixedClock, FlakyProjection, InMemoryEventStore, InMemoryProjectionStore, MockRng,
        RecordingProjection,
    };
    use uuid::Uuid;

    use crate::backoff::RetryPolicy;
    use crate::dispatcher::ReplayStatus;
    use crate::health::HealthStatus;

    struct Fixture {
        admin: ProjectionAdmin,
        log: Arc<InMemoryEventStore>,
        dispatcher: Arc<ProjectionDispatcher>,
        view: Arc<RecordingProjection>,
        flaky: Arc<FlakyProjection>,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(InMemoryEventStore::new());
        let store = Arc::new(InMemoryProjectionStore::new());
        let clock = Arc::new(FixedClock(Utc::now()));
        let tracker = Arc::new(FailureTracker::new(
            store.clone(),
            clock.clone(),
            Box::new(MockRng),
            RetryPolicy::default(),
        ));
        let view = Arc::new(RecordingProjection::new("document_view"));
        let flaky = Arc::new(FlakyProjection::new("suggestion_stats").always_failing_on(2));
        let mut dispatcher = ProjectionDispatcher::new(
            log.clone(),
            store.clone(),
            Arc::new(UpcasterRegistry::new()),
            tracker.clone(),
            clock,
            100,
        );
        dispatcher.register(view.clone()).unwrap();
        dispatcher.register(flaky.clone()).unwrap();
        let dispatcher = Arc::new(dispatcher);
        let admin = ProjectionAdmin::new(
            dispatcher.clone(),
            tracker,
            log.clone(),
            store,
            HealthThresholds::default(),
        );
        Fixture {
            admin,
            log,
            dispatcher,
            view,
            flaky,
        }
    }

    async fn commit(fixture: &Fixture, count: usize) {
        let events: Vec<NewEvent> = (0..count)
            .map(|_| NewEvent {
                event_id: Uuid::new_v4(),
                aggregate_type: "document".into(),
                event_type: "document.uploaded".into(),
                schema_version: 2,
                payload: serde_json::json!({}),
                correlation_id: Uuid::new_v4(),
                causation_id: Uuid::new_v4(),
                occurred_at: Utc::now(),
            })
            .collect();
        let committed = fixture
            .log
            .append_events(Uuid::new_v4(), 0, &events)
            .await
            .unwrap();
        fixture.dispatcher.dispatch(&committed).await;
    }

    #[tokio::test]
    async fn test_health_reports_every_projection() {
        // Arrange
        let fixture = fixture();
        commit(&fixture, 3).await;

        // Act
        let health = fixture.admin.health().await.unwrap();

        // Assert
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].name, "document_view");
        assert_eq!(health[0].status, HealthStatus::Healthy);
        assert_eq!(health[0].lag, 0);
        assert_eq!(health[1].name, "suggestion_stats");
        assert_eq!(health[1].status, HealthStatus::Degraded);
        assert_eq!(health[1].checkpoint, 1);
        assert_eq!(health[1].lag, 2);
        assert_eq!(health[1].unresolved_failures, 1);
        assert_eq!(fixture.flaky.attempts(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_projection_is_not_found() {
        let fixture = fixture();
        let (_tx, cancel) = watch::channel(false);

        let health = fixture.admin.projection_health("nope").await;
        let failures = fixture.admin.failures("nope", None).await;
        let replay = fixture.admin.replay("nope", None, false, &cancel).await;
        let reset = fixture.admin.reset("nope").await;

        assert!(matches!(health, Err(DomainError::ProjectionNotFound(_))));
        assert!(matches!(failures, Err(DomainError::ProjectionNotFound(_))));
        assert!(matches!(replay, Err(DomainError::ProjectionNotFound(_))));
        assert!(matches!(reset, Err(DomainError::ProjectionNotFound(_))));
    }

    #[tokio::test]
    async fn test_skip_releases_the_checkpoint() {
        // Arrange
        let fixture = fixture();
        commit(&fixture, 3).await;
        let open = fixture
            .admin
            .failures("suggestion_stats", Some(false))
            .await
            .unwrap();

        // Act
        let resolved = fixture
            .admin
            .resolve(open[0].id, ResolutionStrategy::Skip)
            .await
            .unwrap();
        let again = fixture
            .admin
            .resolve(open[0].id, ResolutionStrategy::Skip)
            .await;

        // Assert
        assert_eq!(resolved.resolution, Some(Resolution::Skipped));
        assert!(matches!(again, Err(DomainError::Validation(_))));
        let health = fixture
            .admin
            .projection_health("suggestion_stats")
            .await
            .unwrap();
        assert_eq!(health.checkpoint, 3);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_resolving_unknown_failure_is_not_found() {
        let fixture = fixture();

        let result = fixture.admin.resolve(99, ResolutionStrategy::Retry).await;

        assert!(matches!(result, Err(DomainError::FailureNotFound(99))));
    }

    #[tokio::test]
    async fn test_replay_defaults_to_start_of_log() {
        // Arrange
        let fixture = fixture();
        commit(&fixture, 4).await;
        let (_tx, cancel) = watch::channel(false);

        // Act
        let report = fixture
            .admin
            .replay("document_view", None, false, &cancel)
            .await
            .unwrap();

        // Assert
        assert_eq!(report.status, ReplayStatus::Completed);
        assert_eq!(report.events_processed, 4);
        assert_eq!(fixture.view.seen(), vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_negative_replay_start_is_rejected() {
        let fixture = fixture();
        let (_tx, cancel) = watch::channel(false);

        let result = fixture
            .admin
            .replay("document_view", Some(-1), false, &cancel)
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_replay_start_past_head_is_rejected() {
        // Arrange
        let fixture = fixture();
        commit(&fixture, 2).await;
        let (_tx, cancel) = watch::channel(false);

        // Act
        let result = fixture
            .admin
            .replay("document_view", Some(3), false, &cancel)
            .await;

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
        let health = fixture
            .admin
            .projection_health("document_view")
            .await
            .unwrap();
        assert_eq!(health.checkpoint, 2);
        assert_eq!(health.lag, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_failures_and_read_model() {
        let fixture = fixture();
        commit(&fixture, 3).await;

        fixture.admin.reset("suggestion_stats").await.unwrap();

        let failures = fixture
            .admin
            .failures("suggestion_stats", None)
            .await
            .unwrap();
        assert!(failures.is_empty());
        let health = fixture
            .admin
            .projection_health("suggestion_stats")
            .await
            .unwrap();
        assert_eq!(health.checkpoint, 0);
        assert_eq!(health.lag, 3);
    }
}

//! Background retry of failed projection events.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use docreview_core::checkpoint::ProjectionStore;
use docreview_core::clock::Clock;
use docreview_core::error::DomainError;

use crate::config::RetryWorkerSettings;
use crate::dispatcher::ProjectionDispatcher;

/// Counts from one retry tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryRun {
    /// Records claimed.
    pub claimed: usize,
    /// Records whose retry succeeded.
    pub succeeded: usize,
    /// Records whose retry failed again.
    pub failed: usize,
}

/// Periodically claims due failure records and redelivers their events.
///
/// Several workers may run against the same store: claims are leased, so a
/// record is only retried by one of them at a time.
pub struct RetryWorker {
    dispatcher: Arc<ProjectionDispatcher>,
    store: Arc<dyn ProjectionStore>,
    clock: Arc<dyn Clock>,
    settings: RetryWorkerSettings,
    max_retries: i32,
}

impl std::fmt::Debug for RetryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryWorker")
            .field("settings", &self.settings)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RetryWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        dispatcher: Arc<ProjectionDispatcher>,
        store: Arc<dyn ProjectionStore>,
        clock: Arc<dyn Clock>,
        settings: RetryWorkerSettings,
        max_retries: i32,
    ) -> Self {
        Self {
            dispatcher,
            store,
            clock,
            settings,
            max_retries,
        }
    }

    /// Runs a single tick: claims due records and retries them in global
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if records cannot be claimed.
    /// Errors on individual records are logged and leave the record to be
    /// reclaimed once its lease expires.
    pub async fn run_once(&self) -> Result<RetryRun, DomainError> {
        let now = self.clock.now();
        let lease = TimeDelta::from_std(self.settings.claim_lease).unwrap_or(TimeDelta::seconds(30));
        let claimed = self
            .store
            .claim_due_failures(now, now + lease, self.max_retries, self.settings.batch_size)
            .await?;

        let mut run = RetryRun {
            claimed: claimed.len(),
            ..RetryRun::default()
        };
        for failure in &claimed {
            match self
                .dispatcher
                .redeliver(&failure.projection_name, failure.event_global_sequence)
                .await
            {
                Ok(true) => run.succeeded += 1,
                Ok(false) => run.failed += 1,
                Err(err) => {
                    run.failed += 1;
                    warn!(
                        failure_id = failure.id,
                        projection = %failure.projection_name,
                        error = %err,
                        "retry could not be attempted"
                    );
                }
            }
        }

        if run.claimed > 0 {
            info!(
                claimed = run.claimed,
                succeeded = run.succeeded,
                failed = run.failed,
                "retry tick finished"
            );
        }
        Ok(run)
    }

    /// Ticks until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.tick_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_ms = u64::try_from(self.settings.tick_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.settings.batch_size,
            "retry worker started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "retry tick failed");
                    }
                }
            }
        }
        debug!("retry worker stopped");
    }
}

//! In-process projection dispatcher.
//!
//! Every projection owns a lane guarded by an async mutex. Within a lane,
//! first-pass delivery is strictly ordered by global sequence; lanes never
//! wait on each other. The lane remembers how far it has dispatched, so
//! events that arrive out of band (after a restart, or when a background
//! channel overflowed) are fetched from the log before newer ones are
//! handled.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, instrument, warn};

use docreview_core::checkpoint::ProjectionStore;
use docreview_core::clock::Clock;
use docreview_core::error::DomainError;
use docreview_core::projection::{EventPublisher, Projection, ProjectionError};
use docreview_core::repository::{EventRepository, StoredEvent};
use docreview_core::upcaster::UpcasterRegistry;

use crate::failure_tracker::FailureTracker;

/// Outcome of an operator replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    /// The whole log was replayed.
    Completed,
    /// A handler failed and `skip_failed` was not set.
    StoppedOnFailure,
    /// The cancellation signal fired between batches.
    Cancelled,
}

/// Result of [`ProjectionDispatcher::replay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// How the replay ended.
    pub status: ReplayStatus,
    /// Events moved past, including ones the projection ignores.
    pub events_processed: u64,
}

struct Lane {
    projection: Arc<dyn Projection>,
    gate: Mutex<()>,
}

impl Lane {
    fn name(&self) -> &str {
        self.projection.name()
    }
}

/// Delivers committed events to registered projections.
pub struct ProjectionDispatcher {
    lanes: Vec<Lane>,
    events: Arc<dyn EventRepository>,
    store: Arc<dyn ProjectionStore>,
    upcasters: Arc<UpcasterRegistry>,
    tracker: Arc<FailureTracker>,
    clock: Arc<dyn Clock>,
    batch_size: i64,
}

impl fmt::Debug for ProjectionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionDispatcher")
            .field("projections", &self.projection_names())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl ProjectionDispatcher {
    /// Creates a dispatcher with no projections.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventRepository>,
        store: Arc<dyn ProjectionStore>,
        upcasters: Arc<UpcasterRegistry>,
        tracker: Arc<FailureTracker>,
        clock: Arc<dyn Clock>,
        batch_size: i64,
    ) -> Self {
        Self {
            lanes: Vec::new(),
            events,
            store,
            upcasters,
            tracker,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    /// Registers a projection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if a projection with the same name
    /// is already registered.
    pub fn register(&mut self, projection: Arc<dyn Projection>) -> Result<(), DomainError> {
        let name = projection.name();
        if self.lanes.iter().any(|lane| lane.name() == name) {
            return Err(DomainError::Validation(format!(
                "projection {name} is already registered"
            )));
        }
        info!(projection = name, "projection registered");
        self.lanes.push(Lane {
            projection,
            gate: Mutex::new(()),
        });
        Ok(())
    }

    /// Names of all registered projections, in registration order.
    #[must_use]
    pub fn projection_names(&self) -> Vec<&str> {
        self.lanes.iter().map(Lane::name).collect()
    }

    /// Whether a projection with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lanes.iter().any(|lane| lane.name() == name)
    }

    /// Delivers freshly committed events to every projection.
    ///
    /// Lane errors are logged; one projection's failure never blocks the
    /// others. A lane held by a replay, reset or catch-up is skipped: the
    /// writer does not wait, and the skipped events are read back from the
    /// log by the next delivery or catch-up on that lane.
    pub async fn dispatch(&self, events: &[StoredEvent]) {
        for lane in &self.lanes {
            let Ok(_gate) = lane.gate.try_lock() else {
                debug!(
                    projection = lane.name(),
                    events = events.len(),
                    "lane busy, leaving events to catch-up"
                );
                continue;
            };
            if let Err(err) = self.deliver_locked(lane, events).await {
                error!(
                    projection = lane.name(),
                    error = %err,
                    "dispatch failed, events will be picked up by catch-up"
                );
            }
        }
    }

    /// Delivers events to a single projection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names and
    /// `DomainError::Infrastructure` if the log or store is unavailable.
    pub async fn deliver_to(&self, name: &str, events: &[StoredEvent]) -> Result<(), DomainError> {
        let lane = self.lane(name)?;
        let _gate = lane.gate.lock().await;
        self.deliver_locked(lane, events).await
    }

    /// Reads and delivers every committed event the projection has not been
    /// handed yet. Returns the number of events moved past.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names and
    /// `DomainError::Infrastructure` if the log or store is unavailable.
    pub async fn catch_up(&self, name: &str) -> Result<u64, DomainError> {
        let lane = self.lane(name)?;
        let _gate = lane.gate.lock().await;
        let position = self.store.load_checkpoint(name).await?.dispatched_through;
        let (_, moved) = self.catch_up_lane(lane, position, None).await?;
        if moved > 0 {
            debug!(projection = name, moved, "projection caught up");
        }
        Ok(moved)
    }

    /// Brings every projection up to the head of the log after a process
    /// start. Durable projections continue from their checkpoint. Projections
    /// whose read model lives in memory have lost it, so their checkpoint and
    /// failure records are cleared and they are rebuilt from the start of the
    /// log.
    pub async fn resume_all(&self) {
        for lane in &self.lanes {
            match self.resume(lane).await {
                Ok(moved) => info!(projection = lane.name(), moved, "projection resumed"),
                Err(err) => error!(projection = lane.name(), error = %err, "resume failed"),
            }
        }
    }

    /// Re-applies the event at `global_sequence` to `name` and records the
    /// outcome. Returns `true` if the handler succeeded.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names and
    /// `DomainError::Infrastructure` if the event is missing or storage is
    /// unavailable.
    #[instrument(skip(self))]
    pub async fn redeliver(&self, name: &str, global_sequence: i64) -> Result<bool, DomainError> {
        let lane = self.lane(name)?;
        let _gate = lane.gate.lock().await;
        let event = self
            .events
            .load_by_global_sequence(global_sequence)
            .await?
            .ok_or_else(|| {
                DomainError::Infrastructure(format!(
                    "event {global_sequence} is missing from the log"
                ))
            })?;

        match self.apply(lane, &event).await {
            Ok(()) => {
                self.tracker.record_success(name, global_sequence).await?;
                Ok(true)
            }
            Err(err) => {
                self.tracker
                    .record_failure(name, &event, &err.to_string())
                    .await?;
                Ok(false)
            }
        }
    }

    /// Rebuilds `name` from `from_sequence` (exclusive) to the head of the
    /// log. A start past the head is clamped to the head. The lane is held
    /// for the whole replay; live events are left to the next catch-up.
    /// `cancel` is checked between batches.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names and
    /// `DomainError::Infrastructure` if the log or store is unavailable.
    #[instrument(skip(self, cancel))]
    pub async fn replay(
        &self,
        name: &str,
        from_sequence: i64,
        skip_failed: bool,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ReplayReport, DomainError> {
        let lane = self.lane(name)?;
        let _gate = lane.gate.lock().await;
        // The checkpoint may never claim events that have not been committed.
        let head = self.events.head_global_sequence().await?;
        let from_sequence = from_sequence.clamp(0, head);
        self.store
            .reset_checkpoint(name, from_sequence, self.clock.now())
            .await?;
        info!(projection = name, from_sequence, skip_failed, "replay started");

        let mut position = from_sequence;
        let mut processed = 0_u64;
        loop {
            if *cancel.borrow() {
                warn!(projection = name, position, processed, "replay cancelled");
                return Ok(report(ReplayStatus::Cancelled, processed));
            }

            let batch = self.events.read_all(position, self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                let now = self.clock.now();
                if !lane.projection.interested_in(&event.event_type) {
                    self.store
                        .advance_dispatch_position(name, event.global_sequence, now)
                        .await?;
                } else if let Err(err) = self.apply(lane, event).await {
                    self.tracker
                        .record_failure(name, event, &err.to_string())
                        .await?;
                    if !skip_failed {
                        self.tracker.refresh_checkpoint(name).await?;
                        warn!(
                            projection = name,
                            global_sequence = event.global_sequence,
                            processed,
                            "replay stopped on failure"
                        );
                        return Ok(report(ReplayStatus::StoppedOnFailure, processed));
                    }
                    self.store
                        .advance_dispatch_position(name, event.global_sequence, now)
                        .await?;
                } else {
                    self.store
                        .advance_dispatch_position(name, event.global_sequence, now)
                        .await?;
                    self.tracker
                        .record_success(name, event.global_sequence)
                        .await?;
                }
                position = event.global_sequence;
                processed += 1;
            }
            self.tracker.refresh_checkpoint(name).await?;
        }

        info!(projection = name, processed, "replay completed");
        Ok(report(ReplayStatus::Completed, processed))
    }

    /// Clears the read model, checkpoint and failure records of `name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ProjectionNotFound` for unknown names and
    /// `DomainError::Infrastructure` if the projection or store cannot be
    /// cleared.
    #[instrument(skip(self))]
    pub async fn reset(&self, name: &str) -> Result<(), DomainError> {
        let lane = self.lane(name)?;
        let _gate = lane.gate.lock().await;
        lane.projection
            .reset()
            .await
            .map_err(|err| DomainError::Infrastructure(format!("reset of {name} failed: {err}")))?;
        self.store.clear_projection(name).await?;
        info!(projection = name, "projection reset");
        Ok(())
    }

    fn lane(&self, name: &str) -> Result<&Lane, DomainError> {
        self.lanes
            .iter()
            .find(|lane| lane.name() == name)
            .ok_or_else(|| DomainError::ProjectionNotFound(name.to_owned()))
    }

    async fn resume(&self, lane: &Lane) -> Result<u64, DomainError> {
        let name = lane.name();
        let _gate = lane.gate.lock().await;
        let position = if lane.projection.is_durable() {
            self.store.load_checkpoint(name).await?.dispatched_through
        } else {
            lane.projection.reset().await.map_err(|err| {
                DomainError::Infrastructure(format!("reset of {name} failed: {err}"))
            })?;
            self.store.clear_projection(name).await?;
            info!(projection = name, "rebuilding in-memory projection from the start of the log");
            0
        };
        let (_, moved) = self.catch_up_lane(lane, position, None).await?;
        Ok(moved)
    }

    /// Callers hold the lane gate.
    async fn deliver_locked(&self, lane: &Lane, events: &[StoredEvent]) -> Result<(), DomainError> {
        let mut position = self
            .store
            .load_checkpoint(lane.name())
            .await?
            .dispatched_through;

        let mut seen = HashSet::new();
        let mut ordered: Vec<&StoredEvent> = events
            .iter()
            .filter(|event| seen.insert(event.global_sequence))
            .collect();
        ordered.sort_by_key(|event| event.global_sequence);

        for event in ordered {
            if event.global_sequence <= position {
                continue;
            }
            if event.global_sequence > position + 1 {
                let (caught_up, _) = self
                    .catch_up_lane(lane, position, Some(event.global_sequence - 1))
                    .await?;
                position = caught_up;
            }
            self.first_pass(lane, event).await?;
            position = event.global_sequence;
        }
        Ok(())
    }

    /// Reads the log after `position` up to `until` (inclusive) and hands
    /// each event to the lane. Returns the new position and the number of
    /// events moved past.
    async fn catch_up_lane(
        &self,
        lane: &Lane,
        mut position: i64,
        until: Option<i64>,
    ) -> Result<(i64, u64), DomainError> {
        let mut moved = 0;
        loop {
            let batch = self.events.read_all(position, self.batch_size).await?;
            let full = i64::try_from(batch.len()).unwrap_or(i64::MAX) >= self.batch_size;
            for event in &batch {
                if until.is_some_and(|until| event.global_sequence > until) {
                    return Ok((position, moved));
                }
                self.first_pass(lane, event).await?;
                position = event.global_sequence;
                moved += 1;
            }
            if !full {
                return Ok((position, moved));
            }
        }
    }

    async fn first_pass(&self, lane: &Lane, event: &StoredEvent) -> Result<(), DomainError> {
        let name = lane.name();
        let sequence = event.global_sequence;

        if !lane.projection.interested_in(&event.event_type) {
            self.store
                .advance_dispatch_position(name, sequence, self.clock.now())
                .await?;
            self.tracker.refresh_checkpoint(name).await?;
            return Ok(());
        }

        match self.apply(lane, event).await {
            Ok(()) => {
                self.store
                    .advance_dispatch_position(name, sequence, self.clock.now())
                    .await?;
                self.tracker.record_success(name, sequence).await?;
            }
            Err(err) => {
                // The failure must exist before the position moves past it,
                // otherwise the checkpoint could skip the event.
                self.tracker
                    .record_failure(name, event, &err.to_string())
                    .await?;
                self.store
                    .advance_dispatch_position(name, sequence, self.clock.now())
                    .await?;
            }
        }
        Ok(())
    }

    /// Upcasts the event and runs the handler in its own task so a panic
    /// only fails this delivery.
    async fn apply(&self, lane: &Lane, event: &StoredEvent) -> Result<(), ProjectionError> {
        let upcast = self.upcasters.upcast_event(event)?;
        let projection = Arc::clone(&lane.projection);
        match tokio::spawn(async move { projection.handle(&upcast).await }).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                Err(ProjectionError::Panicked(panic_message(join.into_panic())))
            }
            Err(join) => Err(ProjectionError::Handler(join.to_string())),
        }
    }
}

#[async_trait]
impl EventPublisher for ProjectionDispatcher {
    async fn publish(&self, events: &[StoredEvent]) {
        self.dispatch(events).await;
    }
}

fn report(status: ReplayStatus, events_processed: u64) -> ReplayReport {
    ReplayReport {
        status,
        events_processed,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

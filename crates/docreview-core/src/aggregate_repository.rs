//! Aggregate repository: load by folding events, save under optimistic
//! concurrency, hand committed events to the publisher.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::clock::Clock;
use crate::error::DomainError;
use crate::projection::EventPublisher;
use crate::repository::{EventRepository, NewEvent, Snapshot, SnapshotRepository, StoredEvent};
use crate::upcaster::UpcasterRegistry;

/// Tuning knobs for [`AggregateRepository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositorySettings {
    /// Take a snapshot whenever the version crosses a multiple of this
    /// value. `0` disables snapshots.
    pub snapshot_every: i64,
    /// Attempts of the load → mutate → save cycle in
    /// [`AggregateRepository::execute`] before a conflict is surfaced.
    pub max_save_attempts: u32,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            snapshot_every: 50,
            max_save_attempts: 3,
        }
    }
}

/// Loads and saves aggregates of kind `R`.
pub struct AggregateRepository<R: AggregateRoot> {
    events: Arc<dyn EventRepository>,
    snapshots: Option<Arc<dyn SnapshotRepository>>,
    upcasters: Arc<UpcasterRegistry>,
    publisher: Option<Arc<dyn EventPublisher>>,
    clock: Arc<dyn Clock>,
    settings: RepositorySettings,
    _root: PhantomData<fn() -> R>,
}

impl<R: AggregateRoot> fmt::Debug for AggregateRepository<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("aggregate_type", &R::AGGREGATE_TYPE)
            .field("snapshots", &self.snapshots.is_some())
            .field("publisher", &self.publisher.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<R: AggregateRoot> AggregateRepository<R> {
    /// Creates a repository without snapshots or publisher.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventRepository>,
        upcasters: Arc<UpcasterRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            snapshots: None,
            upcasters,
            publisher: None,
            clock,
            settings: RepositorySettings::default(),
            _root: PhantomData,
        }
    }

    /// Enables snapshot reads and writes.
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotRepository>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Publishes committed events to `publisher` after every save.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replaces the default settings.
    #[must_use]
    pub fn with_settings(mut self, settings: RepositorySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Loads an aggregate. Never-written ids yield a new, empty aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on storage failures or stream
    /// gaps and `DomainError::SchemaIncompatible` if an event cannot be
    /// upcast or decoded.
    #[instrument(skip(self), fields(aggregate_type = R::AGGREGATE_TYPE))]
    pub async fn get(&self, id: Uuid) -> Result<Aggregate<R>, DomainError> {
        let mut aggregate = match self.load_snapshot(id).await {
            Some(aggregate) => aggregate,
            None => Aggregate::new(id),
        };

        let stored = self
            .events
            .load_events_after(id, aggregate.version())
            .await?;
        for event in &stored {
            let upcast = self.upcasters.upcast_event(event)?;
            let decoded = R::decode(&upcast)?;
            aggregate.replay(event.aggregate_sequence, &decoded)?;
        }

        debug!(version = aggregate.version(), replayed = stored.len(), "aggregate loaded");
        Ok(aggregate)
    }

    /// Loads an aggregate that must already exist.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if no events exist for `id`,
    /// otherwise see [`AggregateRepository::get`].
    pub async fn get_existing(&self, id: Uuid) -> Result<Aggregate<R>, DomainError> {
        let aggregate = self.get(id).await?;
        if aggregate.is_new() {
            return Err(DomainError::AggregateNotFound(id));
        }
        Ok(aggregate)
    }

    /// Appends the pending events of `aggregate` expecting its current
    /// version. On success the aggregate's pending events are cleared and its
    /// version advanced.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if another writer committed
    /// first, `DomainError::Infrastructure` on storage failures.
    #[instrument(skip(self, aggregate), fields(aggregate_type = R::AGGREGATE_TYPE, aggregate_id = %aggregate.id()))]
    pub async fn save(&self, aggregate: &mut Aggregate<R>) -> Result<Vec<StoredEvent>, DomainError> {
        if aggregate.pending_events().is_empty() {
            return Ok(Vec::new());
        }

        let new_events = aggregate
            .pending_events()
            .iter()
            .map(|event| NewEvent::from_domain_event(R::AGGREGATE_TYPE, event))
            .collect::<Result<Vec<_>, _>>()?;

        let previous = aggregate.version();
        let committed = self
            .events
            .append_events(aggregate.id(), previous, &new_events)
            .await?;
        let new_version = committed
            .last()
            .map_or(previous, |event| event.aggregate_sequence);
        aggregate.mark_committed(new_version);

        info!(
            version = new_version,
            events = committed.len(),
            "events committed"
        );

        self.maybe_snapshot(aggregate, previous).await;

        if let Some(publisher) = &self.publisher {
            publisher.publish(&committed).await;
        }

        Ok(committed)
    }

    /// Runs `command` against a freshly loaded aggregate and saves the
    /// result, reloading and retrying on concurrency conflicts up to
    /// `max_save_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns the command's own error unchanged, the last
    /// `DomainError::ConcurrencyConflict` once attempts are exhausted, or any
    /// load/save error.
    pub async fn execute<F>(
        &self,
        id: Uuid,
        mut command: F,
    ) -> Result<(Aggregate<R>, Vec<StoredEvent>), DomainError>
    where
        F: FnMut(&mut Aggregate<R>) -> Result<(), DomainError> + Send,
    {
        let max_attempts = self.settings.max_save_attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut aggregate = self.get(id).await?;
            command(&mut aggregate)?;
            match self.save(&mut aggregate).await {
                Ok(committed) => return Ok((aggregate, committed)),
                Err(DomainError::ConcurrencyConflict {
                    expected, actual, ..
                }) if attempt < max_attempts => {
                    warn!(
                        aggregate_type = R::AGGREGATE_TYPE,
                        aggregate_id = %id,
                        attempt,
                        expected,
                        actual,
                        "concurrency conflict, reloading aggregate"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn load_snapshot(&self, id: Uuid) -> Option<Aggregate<R>> {
        let store = self.snapshots.as_ref()?;
        let snapshot = match store.load_latest_snapshot(id, None).await {
            Ok(snapshot) => snapshot?,
            Err(err) => {
                warn!(aggregate_id = %id, error = %err, "snapshot read failed, replaying full stream");
                return None;
            }
        };

        if snapshot.aggregate_type != R::AGGREGATE_TYPE || snapshot.state_version != R::STATE_VERSION
        {
            debug!(
                aggregate_id = %id,
                snapshot_version = snapshot.version,
                state_version = snapshot.state_version,
                "ignoring snapshot written for a different state shape"
            );
            return None;
        }

        match serde_json::from_value::<R::State>(snapshot.state) {
            Ok(state) => Some(Aggregate::from_state(id, snapshot.version, state)),
            Err(err) => {
                warn!(aggregate_id = %id, error = %err, "snapshot state unreadable, replaying full stream");
                None
            }
        }
    }

    async fn maybe_snapshot(&self, aggregate: &Aggregate<R>, previous_version: i64) {
        let every = self.settings.snapshot_every;
        let Some(store) = &self.snapshots else {
            return;
        };
        if every <= 0 || previous_version / every == aggregate.version() / every {
            return;
        }

        let state = match serde_json::to_value(aggregate.state()) {
            Ok(state) => state,
            Err(err) => {
                warn!(aggregate_id = %aggregate.id(), error = %err, "snapshot serialization failed");
                return;
            }
        };
        let snapshot = Snapshot {
            aggregate_id: aggregate.id(),
            aggregate_type: R::AGGREGATE_TYPE.to_owned(),
            version: aggregate.version(),
            state_version: R::STATE_VERSION,
            state,
            created_at: self.clock.now(),
        };
        if let Err(err) = store.save_snapshot(&snapshot).await {
            warn!(aggregate_id = %aggregate.id(), error = %err, "snapshot write failed");
        } else {
            debug!(aggregate_id = %aggregate.id(), version = snapshot.version, "snapshot written");
        }
    }
}

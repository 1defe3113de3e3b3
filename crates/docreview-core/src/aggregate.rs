//! Aggregate root abstraction.
//!
//! An aggregate's state is a value: every applied event produces a new state
//! through [`AggregateRoot::apply`], and callers only ever see it through a
//! shared reference. The only way to change it is to record an event.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::DomainEvent;
use crate::repository::StoredEvent;

/// Type-level description of an aggregate kind.
pub trait AggregateRoot: Send + Sync + 'static {
    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent + Clone;

    /// The folded state.
    type State: Clone + Default + fmt::Debug + Serialize + DeserializeOwned + Send + Sync;

    /// Stable name stored alongside events and snapshots.
    const AGGREGATE_TYPE: &'static str;

    /// Shape version of [`AggregateRoot::State`] as written to snapshots.
    /// Bump it when the state layout changes so older snapshots are ignored.
    const STATE_VERSION: i32 = 1;

    /// State transition: returns the state after `event`.
    fn apply(state: &Self::State, event: &Self::Event) -> Self::State;

    /// Decodes an (already upcast) stored event into the domain event type.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::SchemaIncompatible` if the event type is unknown
    /// or the payload does not match the expected shape.
    fn decode(stored: &StoredEvent) -> Result<Self::Event, DomainError>;
}

/// A loaded aggregate instance: identity, committed version, current state
/// and the events recorded since it was loaded.
pub struct Aggregate<R: AggregateRoot> {
    id: Uuid,
    version: i64,
    state: R::State,
    pending: Vec<R::Event>,
}

impl<R: AggregateRoot> fmt::Debug for Aggregate<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("aggregate_type", &R::AGGREGATE_TYPE)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<R: AggregateRoot> Aggregate<R> {
    /// Creates an aggregate that has never been persisted.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self::from_state(id, 0, R::State::default())
    }

    /// Creates an aggregate from a known state at `version`.
    #[must_use]
    pub fn from_state(id: Uuid, version: i64, state: R::State) -> Self {
        Self {
            id,
            version,
            state,
            pending: Vec::new(),
        }
    }

    /// Returns the aggregate identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the committed version (highest aggregate sequence applied).
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns `true` when no event has been committed for this aggregate.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    /// Returns the current state, including pending events.
    #[must_use]
    pub fn state(&self) -> &R::State {
        &self.state
    }

    /// Returns events recorded but not yet committed.
    #[must_use]
    pub fn pending_events(&self) -> &[R::Event] {
        &self.pending
    }

    /// Sequence number the next recorded event will receive.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn next_sequence_number(&self) -> i64 {
        self.version + self.pending.len() as i64 + 1
    }

    /// Records a new event: the state advances immediately and the event is
    /// queued for the next save.
    pub fn record(&mut self, event: R::Event) {
        self.state = R::apply(&self.state, &event);
        self.pending.push(event);
    }

    /// Folds a committed event during reconstruction.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if `aggregate_sequence` does not
    /// directly follow the current version.
    pub fn replay(&mut self, aggregate_sequence: i64, event: &R::Event) -> Result<(), DomainError> {
        if aggregate_sequence != self.version + 1 {
            return Err(DomainError::Infrastructure(format!(
                "event stream for {} {} is not contiguous: expected sequence {}, got {aggregate_sequence}",
                R::AGGREGATE_TYPE,
                self.id,
                self.version + 1
            )));
        }
        self.state = R::apply(&self.state, event);
        self.version = aggregate_sequence;
        Ok(())
    }

    /// Drops pending events after they were committed at `new_version`.
    pub fn mark_committed(&mut self, new_version: i64) {
        self.pending.clear();
        self.version = new_version;
    }
}

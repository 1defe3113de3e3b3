//! Test projections and publishers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use docreview_core::projection::{EventPublisher, Projection, ProjectionError};
use docreview_core::repository::StoredEvent;

/// A projection that records the global sequence of every event it handles.
#[derive(Debug)]
pub struct RecordingProjection {
    name: String,
    interests: Option<Vec<String>>,
    durable: bool,
    seen: Mutex<Vec<i64>>,
    resets: Mutex<u32>,
}

impl RecordingProjection {
    /// Create a projection interested in every event type.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            interests: None,
            durable: true,
            seen: Mutex::new(Vec::new()),
            resets: Mutex::new(0),
        }
    }

    /// Restricts the projection to the given event types.
    #[must_use]
    pub fn interested_only_in(mut self, event_types: &[&str]) -> Self {
        self.interests = Some(event_types.iter().map(|&t| t.to_owned()).collect());
        self
    }

    /// Marks the read model as lost when the process stops.
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Global sequences handled so far, in handling order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }

    /// Number of `reset` calls.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn resets(&self) -> u32 {
        *self.resets.lock().unwrap()
    }
}

#[async_trait]
impl Projection for RecordingProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn interested_in(&self, event_type: &str) -> bool {
        self.interests
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == event_type))
    }

    fn is_durable(&self) -> bool {
        self.durable
    }

    async fn handle(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        self.seen.lock().unwrap().push(event.global_sequence);
        Ok(())
    }

    async fn reset(&self) -> Result<(), ProjectionError> {
        self.seen.lock().unwrap().clear();
        *self.resets.lock().unwrap() += 1;
        Ok(())
    }
}

/// A projection that fails a configured number of times on specific global
/// sequences and succeeds otherwise.
#[derive(Debug)]
pub struct FlakyProjection {
    name: String,
    remaining_failures: Mutex<HashMap<i64, u32>>,
    attempts: Mutex<Vec<i64>>,
    applied: Mutex<Vec<i64>>,
}

impl FlakyProjection {
    /// Create a projection with no scheduled failures.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            remaining_failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Fails the next `times` attempts at `global_sequence`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn failing_on(self, global_sequence: i64, times: u32) -> Self {
        self.remaining_failures
            .lock()
            .unwrap()
            .insert(global_sequence, times);
        self
    }

    /// Fails every attempt at `global_sequence`.
    #[must_use]
    pub fn always_failing_on(self, global_sequence: i64) -> Self {
        self.failing_on(global_sequence, u32::MAX)
    }

    /// Makes `global_sequence` succeed from now on.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn heal(&self, global_sequence: i64) {
        self.remaining_failures
            .lock()
            .unwrap()
            .remove(&global_sequence);
    }

    /// Every attempted global sequence, failed or not.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().unwrap().clone()
    }

    /// Global sequences applied successfully.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn applied(&self) -> Vec<i64> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Projection for FlakyProjection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        self.attempts.lock().unwrap().push(event.global_sequence);
        {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if let Some(count) = remaining.get_mut(&event.global_sequence) {
                if *count > 0 {
                    *count = count.saturating_sub(1);
                    return Err(ProjectionError::Handler(format!(
                        "refusing event {}",
                        event.global_sequence
                    )));
                }
            }
        }
        self.applied.lock().unwrap().push(event.global_sequence);
        Ok(())
    }
}

/// A projection whose handler panics on the given global sequence.
#[derive(Debug)]
pub struct PanickingProjection {
    name: String,
    panic_on: i64,
}

impl PanickingProjection {
    /// Create a projection that panics when it sees `panic_on`.
    #[must_use]
    pub fn new(name: &str, panic_on: i64) -> Self {
        Self {
            name: name.to_owned(),
            panic_on,
        }
    }
}

#[async_trait]
impl Projection for PanickingProjection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        assert!(
            event.global_sequence != self.panic_on,
            "read model corrupted at {}",
            self.panic_on
        );
        Ok(())
    }
}

/// A publisher that records every published batch.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    batches: Mutex<Vec<Vec<StoredEvent>>>,
}

impl RecordingPublisher {
    /// Create an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every published batch, in publish order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn batches(&self) -> Vec<Vec<StoredEvent>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, events: &[StoredEvent]) {
        self.batches.lock().unwrap().push(events.to_vec());
    }
}

//! Test repositories: mock and in-memory `EventRepository` implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use docreview_core::error::DomainError;
use docreview_core::repository::{
    EventRepository, NewEvent, Snapshot, SnapshotRepository, StoredEvent,
};
use uuid::Uuid;

fn commit(
    aggregate_id: Uuid,
    aggregate_sequence: i64,
    global_sequence: i64,
    event: &NewEvent,
) -> StoredEvent {
    StoredEvent {
        event_id: event.event_id,
        aggregate_id,
        aggregate_type: event.aggregate_type.clone(),
        event_type: event.event_type.clone(),
        schema_version: event.schema_version,
        payload: event.payload.clone(),
        aggregate_sequence,
        global_sequence,
        correlation_id: event.correlation_id,
        causation_id: event.causation_id,
        occurred_at: event.occurred_at,
    }
}

/// An event repository that records all `append_events` calls. Returns the
/// configured events from every load and always accepts appends, numbering
/// them after `expected_version`.
#[derive(Debug)]
pub struct RecordingEventRepository {
    load_result: Mutex<Vec<StoredEvent>>,
    appended: Mutex<Vec<(Uuid, i64, Vec<NewEvent>)>>,
}

impl RecordingEventRepository {
    /// Create a new recording repository that will return `load_result` from
    /// every load call.
    #[must_use]
    pub fn new(load_result: Vec<StoredEvent>) -> Self {
        Self {
            load_result: Mutex::new(load_result),
            appended: Mutex::new(Vec::new()),
        }
    }

    /// Returns a snapshot of all appended batches.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn appended_events(&self) -> Vec<(Uuid, i64, Vec<NewEvent>)> {
        self.appended.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventRepository for RecordingEventRepository {
    async fn load_events_after(
        &self,
        _aggregate_id: Uuid,
        version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(self
            .load_result
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.aggregate_sequence > version)
            .cloned()
            .collect())
    }

    async fn append_events(
        &self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[NewEvent],
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.appended
            .lock()
            .unwrap()
            .push((aggregate_id, expected_version, events.to_vec()));
        Ok(events
            .iter()
            .zip(1_i64..)
            .map(|(event, offset)| {
                commit(
                    aggregate_id,
                    expected_version + offset,
                    expected_version + offset,
                    event,
                )
            })
            .collect())
    }

    async fn read_all(
        &self,
        _after_global_sequence: i64,
        _limit: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(vec![])
    }

    async fn load_by_global_sequence(
        &self,
        _global_sequence: i64,
    ) -> Result<Option<StoredEvent>, DomainError> {
        Ok(None)
    }

    async fn head_global_sequence(&self) -> Result<i64, DomainError> {
        Ok(0)
    }
}

/// An event repository that always returns an empty event list and silently
/// accepts appends. Useful for "aggregate not found" scenarios and creation
/// commands.
#[derive(Debug)]
pub struct EmptyEventRepository;

#[async_trait]
impl EventRepository for EmptyEventRepository {
    async fn load_events_after(
        &self,
        _aggregate_id: Uuid,
        _version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(vec![])
    }

    async fn append_events(
        &self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[NewEvent],
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(events
            .iter()
            .zip(1_i64..)
            .map(|(event, offset)| {
                commit(
                    aggregate_id,
                    expected_version + offset,
                    expected_version + offset,
                    event,
                )
            })
            .collect())
    }

    async fn read_all(
        &self,
        _after_global_sequence: i64,
        _limit: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(vec![])
    }

    async fn load_by_global_sequence(
        &self,
        _global_sequence: i64,
    ) -> Result<Option<StoredEvent>, DomainError> {
        Ok(None)
    }

    async fn head_global_sequence(&self) -> Result<i64, DomainError> {
        Ok(0)
    }
}

/// An event repository that always returns an infrastructure error. Useful for
/// testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventRepository;

#[async_trait]
impl EventRepository for FailingEventRepository {
    async fn load_events_after(
        &self,
        _aggregate_id: Uuid,
        _version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn append_events(
        &self,
        _aggregate_id: Uuid,
        _expected_version: i64,
        _events: &[NewEvent],
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn read_all(
        &self,
        _after_global_sequence: i64,
        _limit: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn load_by_global_sequence(
        &self,
        _global_sequence: i64,
    ) -> Result<Option<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn head_global_sequence(&self) -> Result<i64, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<StoredEvent>,
    versions: HashMap<Uuid, i64>,
}

/// A complete in-memory event log and snapshot store.
///
/// A single mutex around the log stands in for the per-aggregate row lock:
/// the version check and the insert happen under the same guard, so
/// concurrent appends with the same expected version have exactly one
/// winner.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: Mutex<Log>,
    snapshots: Mutex<Vec<Snapshot>>,
    snapshot_reads: Mutex<u32>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an already-committed event verbatim, bypassing version checks.
    /// Used to seed old schema versions.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed(&self, event: StoredEvent) {
        let mut log = self.log.lock().unwrap();
        log.versions
            .insert(event.aggregate_id, event.aggregate_sequence);
        log.events.push(event);
        log.events.sort_by_key(|event| event.global_sequence);
    }

    /// Returns every committed event in global order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.log.lock().unwrap().events.clone()
    }

    /// Returns all stored snapshots.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    /// Number of snapshot lookups served.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn snapshot_reads(&self) -> u32 {
        *self.snapshot_reads.lock().unwrap()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventStore {
    async fn load_events_after(
        &self,
        aggregate_id: Uuid,
        version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let log = self.log.lock().unwrap();
        let mut events: Vec<StoredEvent> = log
            .events
            .iter()
            .filter(|event| event.aggregate_id == aggregate_id && event.aggregate_sequence > version)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.aggregate_sequence);
        Ok(events)
    }

    async fn append_events(
        &self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[NewEvent],
    ) -> Result<Vec<StoredEvent>, DomainError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let mut log = self.log.lock().unwrap();
        let actual = log.versions.get(&aggregate_id).copied().unwrap_or(0);
        if actual != expected_version {
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let head = log.events.last().map_or(0, |event| event.global_sequence);
        let committed: Vec<StoredEvent> = events
            .iter()
            .zip(1_i64..)
            .map(|(event, offset)| {
                commit(aggregate_id, expected_version + offset, head + offset, event)
            })
            .collect();

        if let Some(last) = committed.last() {
            log.versions.insert(aggregate_id, last.aggregate_sequence);
        }
        log.events.extend(committed.iter().cloned());
        Ok(committed)
    }

    async fn read_all(
        &self,
        after_global_sequence: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let log = self.log.lock().unwrap();
        Ok(log
            .events
            .iter()
            .filter(|event| event.global_sequence > after_global_sequence)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn load_by_global_sequence(
        &self,
        global_sequence: i64,
    ) -> Result<Option<StoredEvent>, DomainError> {
        let log = self.log.lock().unwrap();
        Ok(log
            .events
            .iter()
            .find(|event| event.global_sequence == global_sequence)
            .cloned())
    }

    async fn head_global_sequence(&self) -> Result<i64, DomainError> {
        let log = self.log.lock().unwrap();
        Ok(log.events.last().map_or(0, |event| event.global_sequence))
    }
}

#[async_trait]
impl SnapshotRepository for InMemoryEventStore {
    async fn load_latest_snapshot(
        &self,
        aggregate_id: Uuid,
        max_version: Option<i64>,
    ) -> Result<Option<Snapshot>, DomainError> {
        *self.snapshot_reads.lock().unwrap() += 1;
        let snapshots = self.snapshots.lock().unwrap();
        Ok(snapshots
            .iter()
            .filter(|snapshot| snapshot.aggregate_id == aggregate_id)
            .filter(|snapshot| max_version.is_none_or(|max| snapshot.version <= max))
            .max_by_key(|snapshot| snapshot.version)
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let exists = snapshots.iter().any(|existing| {
            existing.aggregate_id == snapshot.aggregate_id && existing.version == snapshot.version
        });
        if !exists {
            snapshots.push(snapshot.clone());
        }
        Ok(())
    }
}

//! Integration tests for `AggregateRepository` against the in-memory stores.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use docreview_core::aggregate::{Aggregate, AggregateRoot};
use docreview_core::aggregate_repository::{AggregateRepository, RepositorySettings};
use docreview_core::clock::Clock;
use docreview_core::error::DomainError;
use docreview_core::event::{DomainEvent, EventMetadata};
use docreview_core::repository::{EventRepository, Snapshot, SnapshotRepository, StoredEvent};
use docreview_core::upcaster::UpcasterRegistry;
use docreview_test_support::{
    FailingEventRepository, FixedClock, InMemoryEventStore, RecordingPublisher,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Added {
    metadata: EventMetadata,
    amount: i64,
    unit: String,
}

impl DomainEvent for Added {
    fn event_type(&self) -> &'static str {
        "tally.added"
    }

    fn schema_version(&self) -> i32 {
        2
    }

    fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
        Ok(json!({ "amount": self.amount, "unit": self.unit }))
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TallyState {
    total: i64,
    units: Vec<String>,
}

struct Tally;

impl AggregateRoot for Tally {
    type Event = Added;
    type State = TallyState;
    const AGGREGATE_TYPE: &'static str = "tally";

    fn apply(state: &TallyState, event: &Added) -> TallyState {
        let mut units = state.units.clone();
        units.push(event.unit.clone());
        TallyState {
            total: state.total + event.amount,
            units,
        }
    }

    fn decode(stored: &StoredEvent) -> Result<Added, DomainError> {
        #[derive(Deserialize)]
        struct Payload {
            amount: i64,
            unit: String,
        }
        let payload: Payload = serde_json::from_value(stored.payload.clone()).map_err(|e| {
            DomainError::SchemaIncompatible {
                event_type: stored.event_type.clone(),
                schema_version: stored.schema_version,
                reason: e.to_string(),
            }
        })?;
        Ok(Added {
            metadata: EventMetadata {
                event_id: stored.event_id,
                event_type: stored.event_type.clone(),
                aggregate_id: stored.aggregate_id,
                sequence_number: stored.aggregate_sequence,
                correlation_id: stored.correlation_id,
                causation_id: stored.causation_id,
                occurred_at: stored.occurred_at,
            },
            amount: payload.amount,
            unit: payload.unit,
        })
    }
}

fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()))
}

fn registry() -> Arc<UpcasterRegistry> {
    Arc::new(
        UpcasterRegistry::new()
            .with_schema("tally.added", 2, 2)
            .with_upcaster("tally.added", 1, |mut payload| {
                payload
                    .as_object_mut()
                    .ok_or_else(|| "payload is not an object".to_owned())?
                    .entry("unit")
                    .or_insert(json!("each"));
                Ok(payload)
            }),
    )
}

fn added(aggregate: &Aggregate<Tally>, amount: i64) -> Added {
    Added {
        metadata: EventMetadata {
            event_id: Uuid::new_v4(),
            event_type: "tally.added".into(),
            aggregate_id: aggregate.id(),
            sequence_number: aggregate.next_sequence_number(),
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
        },
        amount,
        unit: "kg".into(),
    }
}

fn repository(store: &Arc<InMemoryEventStore>) -> AggregateRepository<Tally> {
    AggregateRepository::new(store.clone(), registry(), fixed_clock())
}

#[tokio::test]
async fn test_save_three_events_on_new_aggregate_assigns_versions_one_to_three() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let id = Uuid::new_v4();
    let mut aggregate = repo.get(id).await.unwrap();
    for amount in [1, 2, 3] {
        let event = added(&aggregate, amount);
        aggregate.record(event);
    }

    // Act
    let committed = repo.save(&mut aggregate).await.unwrap();

    // Assert
    let sequences: Vec<i64> = committed.iter().map(|e| e.aggregate_sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(aggregate.version(), 3);
    assert!(aggregate.pending_events().is_empty());

    let loaded = store.load_events(id).await.unwrap();
    let loaded_sequences: Vec<i64> = loaded.iter().map(|e| e.aggregate_sequence).collect();
    assert_eq!(loaded_sequences, vec![1, 2, 3]);

    let reloaded = repo.get(id).await.unwrap();
    assert_eq!(reloaded.version(), 3);
    assert_eq!(reloaded.state().total, 6);
}

#[tokio::test]
async fn test_concurrent_saves_from_same_version_have_one_winner() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let id = Uuid::new_v4();
    let mut seed = repo.get(id).await.unwrap();
    for _ in 0..5 {
        let event = added(&seed, 1);
        seed.record(event);
    }
    repo.save(&mut seed).await.unwrap();

    let mut first = repo.get(id).await.unwrap();
    let mut second = repo.get(id).await.unwrap();
    let event = added(&first, 10);
    first.record(event);
    let event = added(&second, 20);
    second.record(event);

    // Act
    let first_result = repo.save(&mut first).await;
    let second_result = repo.save(&mut second).await;

    // Assert
    assert!(first_result.is_ok());
    assert_eq!(first.version(), 6);
    match second_result {
        Err(DomainError::ConcurrencyConflict {
            aggregate_id,
            expected,
            actual,
        }) => {
            assert_eq!(aggregate_id, id);
            assert_eq!(expected, 5);
            assert_eq!(actual, 6);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
    assert_eq!(second.pending_events().len(), 1);
}

#[tokio::test]
async fn test_execute_retries_after_conflict_and_succeeds() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let rival = repository(&store);
    let id = Uuid::new_v4();
    let mut attempts = 0;

    // Act
    let (aggregate, committed) = repo
        .execute(id, |aggregate| {
            attempts += 1;
            if attempts == 1 {
                // A competing writer commits between our load and our save.
                let stream = store.clone();
                let competing = std::thread::spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .build()
                        .unwrap();
                    runtime.block_on(async {
                        let rival_repo: AggregateRepository<Tally> =
                            AggregateRepository::new(stream, registry(), fixed_clock());
                        let mut other = rival_repo.get(id).await.unwrap();
                        let event = added(&other, 100);
                        other.record(event);
                        rival_repo.save(&mut other).await.unwrap();
                    });
                });
                competing.join().unwrap();
            }
            let event = added(aggregate, 1);
            aggregate.record(event);
            Ok(())
        })
        .await
        .unwrap();

    // Assert
    assert_eq!(attempts, 2);
    assert_eq!(committed.len(), 1);
    assert_eq!(aggregate.version(), 2);
    assert_eq!(aggregate.state().total, 101);
    let reloaded = rival.get(id).await.unwrap();
    assert_eq!(reloaded.state().total, 101);
}

#[tokio::test]
async fn test_execute_surfaces_conflict_after_max_attempts() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store).with_settings(RepositorySettings {
        snapshot_every: 0,
        max_save_attempts: 2,
    });
    let id = Uuid::new_v4();
    let mut attempts = 0;

    // Act
    let result = repo
        .execute(id, |aggregate| {
            attempts += 1;
            // Always lose the race: someone else writes the next version.
            let stream = store.clone();
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                runtime.block_on(async {
                    let rival: AggregateRepository<Tally> =
                        AggregateRepository::new(stream, registry(), fixed_clock());
                    let mut other = rival.get(id).await.unwrap();
                    let event = added(&other, 1);
                    other.record(event);
                    rival.save(&mut other).await.unwrap();
                });
            })
            .join()
            .unwrap();
            let event = added(aggregate, 1);
            aggregate.record(event);
            Ok(())
        })
        .await;

    // Assert
    assert_eq!(attempts, 2);
    assert!(matches!(
        result,
        Err(DomainError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
async fn test_execute_does_not_retry_command_errors() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let mut attempts = 0;

    // Act
    let result = repo
        .execute(Uuid::new_v4(), |_| {
            attempts += 1;
            Err(DomainError::Validation("nope".into()))
        })
        .await;

    // Assert
    assert_eq!(attempts, 1);
    assert!(matches!(result, Err(DomainError::Validation(_))));
}

#[tokio::test]
async fn test_get_existing_returns_not_found_for_unknown_id() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let id = Uuid::new_v4();

    let result = repo.get_existing(id).await;

    assert!(matches!(result, Err(DomainError::AggregateNotFound(missing)) if missing == id));
}

#[tokio::test]
async fn test_get_propagates_infrastructure_errors() {
    let repo: AggregateRepository<Tally> =
        AggregateRepository::new(Arc::new(FailingEventRepository), registry(), fixed_clock());

    let result = repo.get(Uuid::new_v4()).await;

    assert!(matches!(result, Err(DomainError::Infrastructure(_))));
}

#[tokio::test]
async fn test_v1_event_without_unit_is_upcast_on_load() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let id = Uuid::new_v4();
    store.seed(StoredEvent {
        event_id: Uuid::new_v4(),
        aggregate_id: id,
        aggregate_type: "tally".into(),
        event_type: "tally.added".into(),
        schema_version: 1,
        payload: json!({ "amount": 7 }),
        aggregate_sequence: 1,
        global_sequence: 1,
        correlation_id: Uuid::new_v4(),
        causation_id: Uuid::new_v4(),
        occurred_at: Utc::now(),
    });
    let repo = repository(&store);

    // Act
    let aggregate = repo.get(id).await.unwrap();

    // Assert
    assert_eq!(aggregate.version(), 1);
    assert_eq!(aggregate.state().total, 7);
    assert_eq!(aggregate.state().units, vec!["each".to_owned()]);
}

#[tokio::test]
async fn test_event_newer_than_running_code_is_schema_incompatible() {
    let store = Arc::new(InMemoryEventStore::new());
    let id = Uuid::new_v4();
    store.seed(StoredEvent {
        event_id: Uuid::new_v4(),
        aggregate_id: id,
        aggregate_type: "tally".into(),
        event_type: "tally.added".into(),
        schema_version: 3,
        payload: json!({ "amount": 7, "unit": "kg", "currency": "EUR" }),
        aggregate_sequence: 1,
        global_sequence: 1,
        correlation_id: Uuid::new_v4(),
        causation_id: Uuid::new_v4(),
        occurred_at: Utc::now(),
    });
    let repo = repository(&store);

    let result = repo.get(id).await;

    assert!(matches!(
        result,
        Err(DomainError::SchemaIncompatible { schema_version: 3, .. })
    ));
}

#[tokio::test]
async fn test_snapshot_written_when_version_crosses_interval() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store)
        .with_snapshots(store.clone())
        .with_settings(RepositorySettings {
            snapshot_every: 3,
            max_save_attempts: 3,
        });
    let id = Uuid::new_v4();
    let mut aggregate = repo.get(id).await.unwrap();

    // Act
    for amount in 1..=4 {
        let event = added(&aggregate, amount);
        aggregate.record(event);
        repo.save(&mut aggregate).await.unwrap();
    }

    // Assert
    let snapshots = store.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].version, 3);
    assert_eq!(snapshots[0].aggregate_type, "tally");
    assert_eq!(snapshots[0].state["total"], json!(6));

    let reloaded = repo.get(id).await.unwrap();
    assert_eq!(reloaded.version(), 4);
    assert_eq!(reloaded.state().total, 10);
}

#[tokio::test]
async fn test_snapshot_with_stale_state_version_is_ignored() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store).with_snapshots(store.clone());
    let id = Uuid::new_v4();
    let mut aggregate = repo.get(id).await.unwrap();
    let event = added(&aggregate, 5);
    aggregate.record(event);
    repo.save(&mut aggregate).await.unwrap();
    store
        .save_snapshot(&Snapshot {
            aggregate_id: id,
            aggregate_type: "tally".into(),
            version: 1,
            state_version: 0,
            state: json!({ "total": 999, "units": [] }),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    // Act
    let reloaded = repo.get(id).await.unwrap();

    // Assert
    assert_eq!(store.snapshot_reads(), 2);
    assert_eq!(reloaded.state().total, 5);
}

#[tokio::test]
async fn test_save_publishes_committed_events() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let repo = repository(&store).with_publisher(publisher.clone());
    let id = Uuid::new_v4();
    let mut aggregate = repo.get(id).await.unwrap();
    let event = added(&aggregate, 1);
    aggregate.record(event);

    // Act
    let committed = repo.save(&mut aggregate).await.unwrap();

    // Assert
    let batches = publisher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], committed);
}

#[tokio::test]
async fn test_save_without_pending_events_is_a_no_op() {
    let store = Arc::new(InMemoryEventStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let repo = repository(&store).with_publisher(publisher.clone());
    let mut aggregate = repo.get(Uuid::new_v4()).await.unwrap();

    let committed = repo.save(&mut aggregate).await.unwrap();

    assert!(committed.is_empty());
    assert!(publisher.batches().is_empty());
    assert_eq!(store.head_global_sequence().await.unwrap(), 0);
}

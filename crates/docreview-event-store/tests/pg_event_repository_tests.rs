//! Integration tests for `PgEventRepository`.

use chrono::Utc;
use docreview_core::error::DomainError;
use docreview_core::repository::{EventRepository, NewEvent, Snapshot, SnapshotRepository};
use docreview_event_store::pg_event_repository::PgEventRepository;
use sqlx::PgPool;
use uuid::Uuid;

/// Helper to build a `NewEvent` with sensible defaults.
fn make_new_event(event_type: &str) -> NewEvent {
    NewEvent {
        event_id: Uuid::new_v4(),
        aggregate_type: "document".to_string(),
        event_type: event_type.to_string(),
        schema_version: 1,
        payload: serde_json::json!({"key": "value"}),
        correlation_id: Uuid::new_v4(),
        causation_id: Uuid::new_v4(),
        occurred_at: Utc::now(),
    }
}

// --- load_events ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_load_events_returns_empty_vec_for_nonexistent_aggregate(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();

    let events = repo.load_events(aggregate_id).await.unwrap();

    assert!(events.is_empty());
}

// --- append_events + load_events round-trip ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_append_and_load_single_event(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();
    let event = make_new_event("document.uploaded");
    let expected = event.clone();

    let committed = repo.append_events(aggregate_id, 0, &[event]).await.unwrap();

    let loaded = repo.load_events(aggregate_id).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded, committed);

    let e = &loaded[0];
    assert_eq!(e.event_id, expected.event_id);
    assert_eq!(e.aggregate_id, aggregate_id);
    assert_eq!(e.aggregate_type, "document");
    assert_eq!(e.event_type, expected.event_type);
    assert_eq!(e.schema_version, 1);
    assert_eq!(e.payload, expected.payload);
    assert_eq!(e.aggregate_sequence, 1);
    assert_eq!(e.global_sequence, 1);
    assert_eq!(e.correlation_id, expected.correlation_id);
    assert_eq!(e.causation_id, expected.causation_id);
    assert_eq!(
        e.occurred_at.timestamp_micros(),
        expected.occurred_at.timestamp_micros()
    );
}

// --- ordering ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_append_three_events_to_new_aggregate_assigns_versions_one_to_three(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();
    let events = vec![
        make_new_event("a"),
        make_new_event("b"),
        make_new_event("c"),
    ];

    repo.append_events(aggregate_id, 0, &events).await.unwrap();

    let loaded = repo.load_events(aggregate_id).await.unwrap();
    let sequences: Vec<i64> = loaded.iter().map(|e| e.aggregate_sequence).collect();
    let types: Vec<&str> = loaded.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(types, vec!["a", "b", "c"]);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_global_sequence_is_gapless_across_aggregates(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let agg_a = Uuid::new_v4();
    let agg_b = Uuid::new_v4();

    repo.append_events(agg_a, 0, &[make_new_event("a"), make_new_event("a")])
        .await
        .unwrap();
    repo.append_events(agg_b, 0, &[make_new_event("b")])
        .await
        .unwrap();
    repo.append_events(agg_a, 2, &[make_new_event("a")])
        .await
        .unwrap();

    let all = repo.read_all(0, 100).await.unwrap();
    let globals: Vec<i64> = all.iter().map(|e| e.global_sequence).collect();
    assert_eq!(globals, vec![1, 2, 3, 4]);
    assert_eq!(all[2].aggregate_id, agg_b);
    assert_eq!(repo.head_global_sequence().await.unwrap(), 4);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_read_all_pages_after_position(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();
    let events: Vec<NewEvent> = (0..5).map(|_| make_new_event("x")).collect();
    repo.append_events(aggregate_id, 0, &events).await.unwrap();

    let page = repo.read_all(2, 2).await.unwrap();

    let globals: Vec<i64> = page.iter().map(|e| e.global_sequence).collect();
    assert_eq!(globals, vec![3, 4]);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_load_by_global_sequence(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();
    repo.append_events(aggregate_id, 0, &[make_new_event("x"), make_new_event("y")])
        .await
        .unwrap();

    let found = repo.load_by_global_sequence(2).await.unwrap().unwrap();
    let missing = repo.load_by_global_sequence(99).await.unwrap();

    assert_eq!(found.event_type, "y");
    assert!(missing.is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_empty_append_is_a_no_op(pool: PgPool) {
    let repo = PgEventRepository::new(pool);

    let committed = repo.append_events(Uuid::new_v4(), 0, &[]).await.unwrap();

    assert!(committed.is_empty());
    assert_eq!(repo.head_global_sequence().await.unwrap(), 0);
}

// --- aggregate isolation ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_aggregate_isolation(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let agg_a = Uuid::new_v4();
    let agg_b = Uuid::new_v4();

    repo.append_events(agg_a, 0, &[make_new_event("a")])
        .await
        .unwrap();
    repo.append_events(agg_b, 0, &[make_new_event("b")])
        .await
        .unwrap();

    let loaded_a = repo.load_events(agg_a).await.unwrap();
    let loaded_b = repo.load_events(agg_b).await.unwrap();

    assert_eq!(loaded_a.len(), 1);
    assert_eq!(loaded_b.len(), 1);
    assert_eq!(loaded_a[0].aggregate_id, agg_a);
    assert_eq!(loaded_b[0].aggregate_id, agg_b);
}

// --- concurrency ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrency_conflict_on_stale_expected_version(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();
    let five: Vec<NewEvent> = (0..5).map(|_| make_new_event("x")).collect();
    repo.append_events(aggregate_id, 0, &five).await.unwrap();

    // First writer at version 5 succeeds.
    repo.append_events(aggregate_id, 5, &[make_new_event("first")])
        .await
        .unwrap();

    // Second writer also expected version 5.
    let result = repo
        .append_events(aggregate_id, 5, &[make_new_event("second")])
        .await;

    match result {
        Err(DomainError::ConcurrencyConflict {
            aggregate_id: conflict_agg_id,
            expected,
            actual,
        }) => {
            assert_eq!(conflict_agg_id, aggregate_id);
            assert_eq!(expected, 5);
            assert_eq!(actual, 6);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }

    let loaded = repo.load_events(aggregate_id).await.unwrap();
    assert_eq!(loaded.len(), 6);
    assert_eq!(loaded[5].event_type, "first");
    assert_eq!(repo.head_global_sequence().await.unwrap(), 6);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_appends_on_new_aggregate_have_exactly_one_winner(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();
    let left_events = [make_new_event("left")];
    let right_events = [make_new_event("right")];

    let (left, right) = tokio::join!(
        repo.append_events(aggregate_id, 0, &left_events),
        repo.append_events(aggregate_id, 0, &right_events),
    );

    let winners = [&left, &right].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if left.is_ok() { right } else { left };
    assert!(matches!(
        loser,
        Err(DomainError::ConcurrencyConflict {
            expected: 0,
            actual: 1,
            ..
        })
    ));

    let loaded = repo.load_events(aggregate_id).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(repo.head_global_sequence().await.unwrap(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_many_concurrent_writers_keep_sequences_contiguous(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            // Each writer retries until it lands one event.
            loop {
                let version = repo
                    .load_events(aggregate_id)
                    .await
                    .unwrap()
                    .last()
                    .map_or(0, |e| e.aggregate_sequence);
                match repo
                    .append_events(aggregate_id, version, &[make_new_event("x")])
                    .await
                {
                    Ok(_) => break,
                    Err(DomainError::ConcurrencyConflict { .. }) => {}
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let loaded = repo.load_events(aggregate_id).await.unwrap();
    let sequences: Vec<i64> = loaded.iter().map(|e| e.aggregate_sequence).collect();
    assert_eq!(sequences, (1..=8).collect::<Vec<_>>());
    let globals: Vec<i64> = repo
        .read_all(0, 100)
        .await
        .unwrap()
        .iter()
        .map(|e| e.global_sequence)
        .collect();
    assert_eq!(globals, (1..=8).collect::<Vec<_>>());
}

// --- snapshots ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_latest_snapshot_respects_max_version(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let aggregate_id = Uuid::new_v4();
    for version in [10, 20] {
        repo.save_snapshot(&Snapshot {
            aggregate_id,
            aggregate_type: "document".into(),
            version,
            state_version: 1,
            state: serde_json::json!({ "version": version }),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    let latest = repo.load_latest_snapshot(aggregate_id, None).await.unwrap();
    let capped = repo
        .load_latest_snapshot(aggregate_id, Some(15))
        .await
        .unwrap();
    let none = repo.load_latest_snapshot(aggregate_id, Some(5)).await.unwrap();

    assert_eq!(latest.unwrap().version, 20);
    assert_eq!(capped.unwrap().version, 10);
    assert!(none.is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_saving_same_snapshot_twice_is_ignored(pool: PgPool) {
    let repo = PgEventRepository::new(pool);
    let snapshot = Snapshot {
        aggregate_id: Uuid::new_v4(),
        aggregate_type: "document".into(),
        version: 50,
        state_version: 1,
        state: serde_json::json!({}),
        created_at: Utc::now(),
    };

    repo.save_snapshot(&snapshot).await.unwrap();
    repo.save_snapshot(&snapshot).await.unwrap();

    let loaded = repo
        .load_latest_snapshot(snapshot.aggregate_id, None)
        .await
        .unwrap();
    assert_eq!(loaded.unwrap().version, 50);
}

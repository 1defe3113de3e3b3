//! `PostgreSQL` implementation of the `EventRepository` and
//! `SnapshotRepository` traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use docreview_core::error::DomainError;
use docreview_core::repository::{
    EventRepository, NewEvent, Snapshot, SnapshotRepository, StoredEvent,
};

use crate::error::{infrastructure, is_unique_violation};

const EVENT_COLUMNS: &str = "event_id, aggregate_id, aggregate_type, event_type, schema_version, \
     payload, aggregate_sequence, global_sequence, correlation_id, causation_id, occurred_at";

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    event_type: String,
    schema_version: i32,
    payload: serde_json::Value,
    aggregate_sequence: i64,
    global_sequence: i64,
    correlation_id: Uuid,
    causation_id: Uuid,
    occurred_at: DateTime<Utc>,
}

impl From<EventRow> for StoredEvent {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            schema_version: row.schema_version,
            payload: row.payload,
            aggregate_sequence: row.aggregate_sequence,
            global_sequence: row.global_sequence,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            occurred_at: row.occurred_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    aggregate_id: Uuid,
    aggregate_type: String,
    version: i64,
    state_version: i32,
    state: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            version: row.version,
            state_version: row.state_version,
            state: row.state,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL-backed event log and snapshot store.
#[derive(Debug, Clone)]
pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    /// Creates a new `PgEventRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn conflict(aggregate_id: Uuid, expected: i64, actual: i64) -> DomainError {
    DomainError::ConcurrencyConflict {
        aggregate_id,
        expected,
        actual,
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    #[instrument(skip(self))]
    async fn load_events_after(
        &self,
        aggregate_id: Uuid,
        version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE aggregate_id = $1 AND aggregate_sequence > $2 \
             ORDER BY aggregate_sequence"
        ))
        .bind(aggregate_id)
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(infrastructure)?;

        Ok(rows.into_iter().map(StoredEvent::from).collect())
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[NewEvent],
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let Some(first) = events.first() else {
            return Ok(Vec::new());
        };
        let count = i64::try_from(events.len())
            .map_err(|_| DomainError::Validation("too many events in one append".into()))?;

        let mut tx = self.pool.begin().await.map_err(infrastructure)?;

        // Make sure a stream row exists so new aggregates are locked too.
        sqlx::query(
            "INSERT INTO event_streams (aggregate_id, aggregate_type) VALUES ($1, $2) \
             ON CONFLICT (aggregate_id) DO NOTHING",
        )
        .bind(aggregate_id)
        .bind(&first.aggregate_type)
        .execute(&mut *tx)
        .await
        .map_err(infrastructure)?;

        let actual: i64 =
            sqlx::query_scalar("SELECT version FROM event_streams WHERE aggregate_id = $1 FOR UPDATE")
                .bind(aggregate_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(infrastructure)?;

        if actual != expected_version {
            return Err(conflict(aggregate_id, expected_version, actual));
        }

        let head: i64 = sqlx::query_scalar(
            "UPDATE event_log_head SET value = value + $1 WHERE id = 1 RETURNING value",
        )
        .bind(count)
        .fetch_one(&mut *tx)
        .await
        .map_err(infrastructure)?;
        let first_global = head - count + 1;

        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in (0_i64..).zip(events) {
            let row: EventRow = sqlx::query_as(&format!(
                "INSERT INTO domain_events \
                 (event_id, aggregate_id, aggregate_type, event_type, schema_version, payload, \
                  aggregate_sequence, global_sequence, correlation_id, causation_id, occurred_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 RETURNING {EVENT_COLUMNS}"
            ))
            .bind(event.event_id)
            .bind(aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(event.schema_version)
            .bind(&event.payload)
            .bind(expected_version + offset + 1)
            .bind(first_global + offset)
            .bind(event.correlation_id)
            .bind(event.causation_id)
            .bind(event.occurred_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    conflict(aggregate_id, expected_version, expected_version + offset + 1)
                } else {
                    infrastructure(err)
                }
            })?;
            committed.push(StoredEvent::from(row));
        }

        sqlx::query("UPDATE event_streams SET version = $2, updated_at = NOW() WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .bind(expected_version + count)
            .execute(&mut *tx)
            .await
            .map_err(infrastructure)?;

        tx.commit().await.map_err(|err| {
            if is_unique_violation(&err) {
                conflict(aggregate_id, expected_version, expected_version + count)
            } else {
                infrastructure(err)
            }
        })?;

        metrics::counter!("docreview_events_appended_total").increment(events.len() as u64);
        debug!(
            aggregate_id = %aggregate_id,
            version = expected_version + count,
            global_sequence = head,
            "events appended"
        );
        Ok(committed)
    }

    async fn read_all(
        &self,
        after_global_sequence: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE global_sequence > $1 ORDER BY global_sequence LIMIT $2"
        ))
        .bind(after_global_sequence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(infrastructure)?;

        Ok(rows.into_iter().map(StoredEvent::from).collect())
    }

    async fn load_by_global_sequence(
        &self,
        global_sequence: i64,
    ) -> Result<Option<StoredEvent>, DomainError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events WHERE global_sequence = $1"
        ))
        .bind(global_sequence)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        Ok(row.map(StoredEvent::from))
    }

    async fn head_global_sequence(&self) -> Result<i64, DomainError> {
        sqlx::query_scalar("SELECT value FROM event_log_head WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map(Option::unwrap_or_default)
            .map_err(infrastructure)
    }
}

#[async_trait]
impl SnapshotRepository for PgEventRepository {
    async fn load_latest_snapshot(
        &self,
        aggregate_id: Uuid,
        max_version: Option<i64>,
    ) -> Result<Option<Snapshot>, DomainError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT aggregate_id, aggregate_type, version, state_version, state, created_at \
             FROM aggregate_snapshots \
             WHERE aggregate_id = $1 AND ($2::BIGINT IS NULL OR version <= $2) \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(aggregate_id)
        .bind(max_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        Ok(row.map(Snapshot::from))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO aggregate_snapshots \
             (aggregate_id, version, aggregate_type, state_version, state, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (aggregate_id, version) DO NOTHING",
        )
        .bind(snapshot.aggregate_id)
        .bind(snapshot.version)
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.state_version)
        .bind(&snapshot.state)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .map_err(infrastructure)?;
        Ok(())
    }
}

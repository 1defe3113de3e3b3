//! `PostgreSQL` implementation of the `ProjectionStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use docreview_core::checkpoint::{
    FailureAttempt, FailureRecord, FailureSummary, ProjectionCheckpoint, ProjectionStore,
    Resolution,
};
use docreview_core::error::DomainError;

use crate::error::infrastructure;

const CHECKPOINT_COLUMNS: &str =
    "projection_name, last_applied_global_sequence, dispatched_through, updated_at";

const FAILURE_COLUMNS: &str = "id, projection_name, event_global_sequence, aggregate_id, \
     event_type, retry_count, next_retry_at, last_error, resolved, resolution, \
     permanently_failed, claimed_until, first_failed_at, last_failed_at, resolved_at";

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    projection_name: String,
    last_applied_global_sequence: i64,
    dispatched_through: i64,
    updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for ProjectionCheckpoint {
    fn from(row: CheckpointRow) -> Self {
        Self {
            projection_name: row.projection_name,
            last_applied_global_sequence: row.last_applied_global_sequence,
            dispatched_through: row.dispatched_through,
            updated_at: Some(row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FailureRow {
    id: i64,
    projection_name: String,
    event_global_sequence: i64,
    aggregate_id: Uuid,
    event_type: String,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: String,
    resolved: bool,
    resolution: Option<String>,
    permanently_failed: bool,
    claimed_until: Option<DateTime<Utc>>,
    first_failed_at: DateTime<Utc>,
    last_failed_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<FailureRow> for FailureRecord {
    type Error = DomainError;

    fn try_from(row: FailureRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            projection_name: row.projection_name,
            event_global_sequence: row.event_global_sequence,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            resolved: row.resolved,
            resolution: row.resolution.as_deref().map(str::parse).transpose()?,
            permanently_failed: row.permanently_failed,
            claimed_until: row.claimed_until,
            first_failed_at: row.first_failed_at,
            last_failed_at: row.last_failed_at,
            resolved_at: row.resolved_at,
        })
    }
}

fn into_records(rows: Vec<FailureRow>) -> Result<Vec<FailureRecord>, DomainError> {
    rows.into_iter().map(FailureRecord::try_from).collect()
}

/// PostgreSQL-backed checkpoint and failure store.
#[derive(Debug, Clone)]
pub struct PgProjectionStore {
    pool: PgPool,
}

impl PgProjectionStore {
    /// Creates a new `PgProjectionStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectionStore for PgProjectionStore {
    async fn load_checkpoint(
        &self,
        projection: &str,
    ) -> Result<ProjectionCheckpoint, DomainError> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM projection_checkpoints WHERE projection_name = $1"
        ))
        .bind(projection)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        Ok(row.map_or_else(
            || ProjectionCheckpoint::empty(projection),
            ProjectionCheckpoint::from,
        ))
    }

    async fn advance_dispatch_position(
        &self,
        projection: &str,
        global_sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO projection_checkpoints (projection_name, dispatched_through, updated_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (projection_name) DO UPDATE SET \
               dispatched_through = GREATEST(projection_checkpoints.dispatched_through, \
                                             EXCLUDED.dispatched_through), \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(projection)
        .bind(global_sequence)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(infrastructure)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn refresh_checkpoint(
        &self,
        projection: &str,
        now: DateTime<Utc>,
    ) -> Result<ProjectionCheckpoint, DomainError> {
        let row: CheckpointRow = sqlx::query_as(&format!(
            "INSERT INTO projection_checkpoints (projection_name, updated_at) VALUES ($1, $2) \
             ON CONFLICT (projection_name) DO UPDATE SET \
               last_applied_global_sequence = GREATEST( \
                 projection_checkpoints.last_applied_global_sequence, \
                 LEAST( \
                   projection_checkpoints.dispatched_through, \
                   COALESCE( \
                     (SELECT MIN(event_global_sequence) - 1 FROM projection_failures \
                      WHERE projection_name = $1 AND NOT resolved), \
                     projection_checkpoints.dispatched_through))), \
               updated_at = EXCLUDED.updated_at \
             RETURNING {CHECKPOINT_COLUMNS}"
        ))
        .bind(projection)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(infrastructure)?;

        Ok(row.into())
    }

    async fn reset_checkpoint(
        &self,
        projection: &str,
        global_sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO projection_checkpoints \
             (projection_name, last_applied_global_sequence, dispatched_through, updated_at) \
             VALUES ($1, $2, $2, $3) \
             ON CONFLICT (projection_name) DO UPDATE SET \
               last_applied_global_sequence = EXCLUDED.last_applied_global_sequence, \
               dispatched_through = EXCLUDED.dispatched_through, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(projection)
        .bind(global_sequence)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(infrastructure)?;
        Ok(())
    }

    async fn clear_projection(&self, projection: &str) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(infrastructure)?;
        sqlx::query("DELETE FROM projection_failures WHERE projection_name = $1")
            .bind(projection)
            .execute(&mut *tx)
            .await
            .map_err(infrastructure)?;
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = $1")
            .bind(projection)
            .execute(&mut *tx)
            .await
            .map_err(infrastructure)?;
        tx.commit().await.map_err(infrastructure)
    }

    async fn record_failure_attempt(
        &self,
        attempt: &FailureAttempt,
    ) -> Result<FailureRecord, DomainError> {
        let row: FailureRow = sqlx::query_as(&format!(
            "INSERT INTO projection_failures \
             (projection_name, event_global_sequence, aggregate_id, event_type, retry_count, \
              last_error, first_failed_at, last_failed_at) \
             VALUES ($1, $2, $3, $4, 1, $5, $6, $6) \
             ON CONFLICT (projection_name, event_global_sequence) DO UPDATE SET \
               retry_count = CASE WHEN projection_failures.resolved THEN 1 \
                                  ELSE projection_failures.retry_count + 1 END, \
               permanently_failed = CASE WHEN projection_failures.resolved THEN FALSE \
                                         ELSE projection_failures.permanently_failed END, \
               resolved = FALSE, \
               resolution = NULL, \
               resolved_at = NULL, \
               claimed_until = NULL, \
               last_error = EXCLUDED.last_error, \
               last_failed_at = EXCLUDED.last_failed_at \
             RETURNING {FAILURE_COLUMNS}"
        ))
        .bind(&attempt.projection_name)
        .bind(attempt.event_global_sequence)
        .bind(attempt.aggregate_id)
        .bind(&attempt.event_type)
        .bind(&attempt.error)
        .bind(attempt.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(infrastructure)?;

        row.try_into()
    }

    async fn schedule_retry(
        &self,
        failure_id: i64,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        permanently_failed: bool,
    ) -> Result<FailureRecord, DomainError> {
        let row: Option<FailureRow> = sqlx::query_as(&format!(
            "UPDATE projection_failures SET \
               retry_count = $2, next_retry_at = $3, permanently_failed = $4, \
               claimed_until = NULL \
             WHERE id = $1 \
             RETURNING {FAILURE_COLUMNS}"
        ))
        .bind(failure_id)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(permanently_failed)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        row.ok_or(DomainError::FailureNotFound(failure_id))?
            .try_into()
    }

    async fn resolve_failure(
        &self,
        failure_id: i64,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureRecord>, DomainError> {
        let row: Option<FailureRow> = sqlx::query_as(&format!(
            "UPDATE projection_failures SET \
               resolved = TRUE, resolution = $2, resolved_at = $3, \
               next_retry_at = NULL, claimed_until = NULL \
             WHERE id = $1 AND NOT resolved \
             RETURNING {FAILURE_COLUMNS}"
        ))
        .bind(failure_id)
        .bind(resolution.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        row.map(FailureRecord::try_from).transpose()
    }

    async fn find_failure(
        &self,
        projection: &str,
        event_global_sequence: i64,
    ) -> Result<Option<FailureRecord>, DomainError> {
        let row: Option<FailureRow> = sqlx::query_as(&format!(
            "SELECT {FAILURE_COLUMNS} FROM projection_failures \
             WHERE projection_name = $1 AND event_global_sequence = $2"
        ))
        .bind(projection)
        .bind(event_global_sequence)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        row.map(FailureRecord::try_from).transpose()
    }

    async fn get_failure(&self, failure_id: i64) -> Result<Option<FailureRecord>, DomainError> {
        let row: Option<FailureRow> = sqlx::query_as(&format!(
            "SELECT {FAILURE_COLUMNS} FROM projection_failures WHERE id = $1"
        ))
        .bind(failure_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure)?;

        row.map(FailureRecord::try_from).transpose()
    }

    async fn list_failures(
        &self,
        projection: &str,
        resolved: Option<bool>,
    ) -> Result<Vec<FailureRecord>, DomainError> {
        let rows: Vec<FailureRow> = sqlx::query_as(&format!(
            "SELECT {FAILURE_COLUMNS} FROM projection_failures \
             WHERE projection_name = $1 AND ($2::BOOLEAN IS NULL OR resolved = $2) \
             ORDER BY event_global_sequence"
        ))
        .bind(projection)
        .bind(resolved)
        .fetch_all(&self.pool)
        .await
        .map_err(infrastructure)?;

        into_records(rows)
    }

    #[instrument(skip(self))]
    async fn claim_due_failures(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<FailureRecord>, DomainError> {
        // Rows locked by another worker are skipped rather than waited on.
        let rows: Vec<FailureRow> = sqlx::query_as(
            "WITH due AS ( \
               SELECT id FROM projection_failures \
               WHERE NOT resolved \
                 AND NOT permanently_failed \
                 AND retry_count <= $3 \
                 AND next_retry_at <= $1 \
                 AND (claimed_until IS NULL OR claimed_until <= $1) \
               ORDER BY event_global_sequence, id \
               LIMIT $4 \
               FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE projection_failures f SET claimed_until = $2 \
             FROM due WHERE f.id = due.id \
             RETURNING f.*",
        )
        .bind(now)
        .bind(claim_until)
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(infrastructure)?;

        let mut claimed = into_records(rows)?;
        claimed.sort_by_key(|failure| (failure.event_global_sequence, failure.id));
        Ok(claimed)
    }

    async fn failure_summary(&self, projection: &str) -> Result<FailureSummary, DomainError> {
        let (unresolved, permanent): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE NOT resolved), \
                    COUNT(*) FILTER (WHERE NOT resolved AND permanently_failed) \
             FROM projection_failures WHERE projection_name = $1",
        )
        .bind(projection)
        .fetch_one(&self.pool)
        .await
        .map_err(infrastructure)?;

        Ok(FailureSummary {
            unresolved,
            permanent,
        })
    }
}

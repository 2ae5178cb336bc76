//! Postgres-backed task store.
//!
//! ## Claim Atomicity
//!
//! `claim_eligible` selects candidates with `FOR UPDATE SKIP LOCKED` inside
//! the same statement that flips them to `leased`. A row locked by a
//! concurrent claimer is skipped rather than waited on, so two workers
//! ticking simultaneously partition the eligible set with no overlap.
//!
//! ## Lease Ownership
//!
//! Finalize statements carry `status = 'leased' AND lease_owner = $owner` in
//! their `WHERE` clause. Zero affected rows means the lease was lost (or the
//! task never existed) and is reported as `LeaseConflict` / `NotFound`.
//!
//! ## Thread Safety
//!
//! `PostgresTaskStore` is `Send + Sync`; all operations go through the SQLx pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use autopilot_core::TaskId;

use super::store::{TaskStats, TaskStore, TaskStoreError};
use super::types::{NewTask, Task, TaskStatus, chrono_duration};
use crate::pg::{self, PgFailure};

const TASK_COLUMNS: &str = "id, name, payload, status, available_at, attempts, max_attempts, \
     lease_owner, lease_expires_at, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        pg::apply_schema(&self.pool, "tasks schema", pg::TASKS_SCHEMA)
            .await
            .map_err(TaskStoreError::Storage)
    }

    async fn fetch(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM autopilot_tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_err("get", e))?;
        row.map(|r| decode(&r)).transpose()
    }

    /// Turn a zero-row finalize into the right error.
    async fn lease_failure(&self, id: TaskId) -> TaskStoreError {
        match self.fetch(id).await {
            Ok(Some(_)) => TaskStoreError::LeaseConflict(id),
            Ok(None) => TaskStoreError::NotFound(id),
            Err(err) => err,
        }
    }

    /// Decode a finalize `RETURNING` row, or explain why there was none.
    async fn finalized(&self, id: TaskId, row: Option<PgRow>) -> Result<Task, TaskStoreError> {
        match row {
            Some(row) => decode(&row),
            None => Err(self.lease_failure(id).await),
        }
    }
}

fn map_err(operation: &str, err: sqlx::Error) -> TaskStoreError {
    TaskStoreError::Storage(match pg::map_sqlx_error(operation, err) {
        PgFailure::UniqueViolation(msg) | PgFailure::Other(msg) => msg,
    })
}

/// Row shape as stored.
#[derive(Debug)]
struct TaskRow {
    id: Uuid,
    name: String,
    payload: serde_json::Value,
    status: String,
    available_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            available_at: row.try_get("available_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| TaskStoreError::Storage(format!("corrupt task row {}: {what}", row.id));
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            status: row.status.parse::<TaskStatus>().map_err(|e| corrupt(&e))?,
            attempts: u32::try_from(row.attempts).map_err(|_| corrupt("negative attempts"))?,
            max_attempts: u32::try_from(row.max_attempts)
                .map_err(|_| corrupt("negative max_attempts"))?,
            name: row.name,
            payload: row.payload,
            available_at: row.available_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(row: &PgRow) -> Result<Task, TaskStoreError> {
    let row = TaskRow::from_row(row)
        .map_err(|e| TaskStoreError::Storage(format!("failed to deserialize task row: {e}")))?;
    Task::try_from(row)
}

fn decode_all(rows: &[PgRow]) -> Result<Vec<Task>, TaskStoreError> {
    rows.iter().map(decode).collect()
}

fn as_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(name = %task.name), err)]
    async fn enqueue(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        let task = task
            .validate()
            .map_err(TaskStoreError::Validation)?
            .into_task(now);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO autopilot_tasks (
                id, name, payload, status, available_at, attempts, max_attempts,
                lease_owner, lease_expires_at, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, NULL, NULL, NULL, $7, $7)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.id.as_uuid())
        .bind(&task.name)
        .bind(Json(&task.payload))
        .bind(task.status.as_str())
        .bind(task.available_at)
        .bind(as_i32(task.max_attempts))
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_err("enqueue", e))?;
        decode(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        self.fetch(id).await
    }

    #[instrument(skip(self, payload), err)]
    async fn find_active(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM autopilot_tasks
            WHERE name = $1
              AND payload = $2
              AND status IN ('pending', 'leased', 'failed_retryable')
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(name)
        .bind(Json(payload))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("find_active", e))?;
        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self), fields(claimed), err)]
    async fn claim_eligible(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Task>, TaskStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT id FROM autopilot_tasks
                WHERE status IN ('pending', 'failed_retryable')
                  AND available_at <= $1
                  AND attempts < max_attempts
                ORDER BY available_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE autopilot_tasks t SET
                status = 'leased',
                lease_owner = $3,
                lease_expires_at = $4,
                attempts = t.attempts + 1,
                updated_at = $1
            FROM eligible
            WHERE t.id = eligible.id
            RETURNING t.*
            "#,
        )
        .bind(now)
        .bind(pg::as_limit(limit))
        .bind(owner)
        .bind(now + chrono_duration(lease))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("claim_eligible", e))?;

        // RETURNING order is unspecified.
        let mut tasks = decode_all(&rows)?;
        tasks.sort_by_key(|t| (t.available_at, t.id));
        tracing::Span::current().record("claimed", tasks.len());
        Ok(tasks)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE autopilot_tasks SET
                status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'dead' END,
                last_error = CASE WHEN attempts < max_attempts THEN last_error ELSE 'lease expired' END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE status = 'leased' AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("reclaim_expired_leases", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn finalize_success(
        &self,
        id: TaskId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE autopilot_tasks SET
                status = 'succeeded',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'leased' AND lease_owner = $2
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(owner)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_err("finalize_success", e))?;
        self.finalized(id, row).await
    }

    #[instrument(skip(self), err)]
    async fn finalize_retry(
        &self,
        id: TaskId,
        owner: &str,
        backoff: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE autopilot_tasks SET
                status = CASE WHEN attempts < max_attempts THEN 'failed_retryable' ELSE 'dead' END,
                available_at = CASE WHEN attempts < max_attempts THEN $3 ELSE available_at END,
                last_error = $4,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'leased' AND lease_owner = $2
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(owner)
            .bind(now + chrono_duration(backoff))
            .bind(error)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_err("finalize_retry", e))?;
        self.finalized(id, row).await
    }

    #[instrument(skip(self), err)]
    async fn finalize_fatal(
        &self,
        id: TaskId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE autopilot_tasks SET
                status = 'dead',
                last_error = $3,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'leased' AND lease_owner = $2
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(owner)
            .bind(error)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_err("finalize_fatal", e))?;
        self.finalized(id, row).await
    }

    #[instrument(skip(self), err)]
    async fn list_dead(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM autopilot_tasks WHERE status = 'dead' \
             ORDER BY updated_at DESC, id ASC LIMIT $1"
        ))
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("list_dead", e))?;
        decode_all(&rows)
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE autopilot_tasks SET
                status = 'pending',
                attempts = 0,
                available_at = $2,
                last_error = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'dead'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("requeue_dead", e))?;

        match row {
            Some(row) => decode(&row),
            None => match self.fetch(id).await? {
                Some(task) => Err(TaskStoreError::Validation(format!(
                    "task {id} is {}, only dead tasks can be requeued",
                    task.status
                ))),
                None => Err(TaskStoreError::NotFound(id)),
            },
        }
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM autopilot_tasks GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_err("stats", e))?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_err("stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| map_err("stats", e))?;
            let status = status.parse::<TaskStatus>().map_err(TaskStoreError::Storage)?;
            stats.record(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn purgeable(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM autopilot_tasks \
             WHERE status IN ('succeeded', 'dead') AND updated_at < $1 \
             ORDER BY updated_at ASC, id ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("purgeable", e))?;
        decode_all(&rows)
    }

    #[instrument(skip(self), err)]
    async fn purge(&self, id: TaskId, cutoff: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let result = sqlx::query(
            "DELETE FROM autopilot_tasks \
             WHERE id = $1 AND status IN ('succeeded', 'dead') AND updated_at < $2",
        )
        .bind(id.as_uuid())
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("purge", e))?;
        Ok(result.rows_affected() == 1)
    }
}

//! PostgreSQL-backed CMS store.
//!
//! Discover queries mirror the in-memory trigger predicates. Every sweep
//! mutation repeats its trigger predicate in the `WHERE` clause and writes
//! only the columns the transition owns; edits made after discovery survive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use autopilot_cms::{
    AnalyticsExport, ContentItem, ContentLock, ContentVersion, PublishStatus, RecurrenceRule,
    RecurringSchedule, ScheduleAdvance, ScheduledExport,
};
use autopilot_core::{ContentId, ExportId, LockId, ScheduleId, UserId, VersionId};

use super::{
    ContentRepository, ExportRepository, LockRepository, RepositoryError, ScheduleRepository,
    VersionRepository,
};
use crate::pg::{self, PgFailure};

#[derive(Debug, Clone)]
pub struct PgCmsStore {
    pool: Arc<PgPool>,
}

impl PgCmsStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        pg::apply_schema(&self.pool, "cms schema", pg::CMS_SCHEMA)
            .await
            .map_err(RepositoryError::Storage)
    }
}

fn map_err(operation: &str, err: sqlx::Error) -> RepositoryError {
    match pg::map_sqlx_error(operation, err) {
        PgFailure::UniqueViolation(msg) => RepositoryError::Conflict(msg),
        PgFailure::Other(msg) => RepositoryError::Storage(msg),
    }
}

fn corrupt(err: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(err.to_string().into())
}

fn decode_rows<T>(
    operation: &str,
    rows: Vec<PgRow>,
    f: fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter()
        .map(|row| f(row).map_err(|e| RepositoryError::Corrupt(format!("{operation}: {e}"))))
        .collect()
}

fn content_from_row(row: &PgRow) -> Result<ContentItem, sqlx::Error> {
    let status: String = row.try_get("publish_status")?;
    Ok(ContentItem {
        id: ContentId::from_uuid(row.try_get("id")?),
        title: row.try_get("title")?,
        author_id: UserId::from_uuid(row.try_get("author_id")?),
        publish_status: status.parse().map_err(corrupt)?,
        scheduled_publish_at: row.try_get("scheduled_publish_at")?,
        scheduled_unpublish_at: row.try_get("scheduled_unpublish_at")?,
        published_at: row.try_get("published_at")?,
        unpublished_at: row.try_get("unpublished_at")?,
        review_requested_at: row.try_get("review_requested_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn scheduled_export_from_row(row: &PgRow) -> Result<ScheduledExport, sqlx::Error> {
    let frequency: String = row.try_get("frequency")?;
    Ok(ScheduledExport {
        id: ExportId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        owner_id: UserId::from_uuid(row.try_get("owner_id")?),
        frequency: frequency.parse().map_err(corrupt)?,
        format: row.try_get("format")?,
        active: row.try_get("active")?,
        last_run_at: row.try_get("last_run_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn analytics_export_from_row(row: &PgRow) -> Result<AnalyticsExport, sqlx::Error> {
    let scheduled: Option<Uuid> = row.try_get("scheduled_export_id")?;
    Ok(AnalyticsExport {
        id: ExportId::from_uuid(row.try_get("id")?),
        scheduled_export_id: scheduled.map(ExportId::from_uuid),
        file_path: row.try_get("file_path")?,
        format: row.try_get("format")?,
        created_at: row.try_get("created_at")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<ContentVersion, sqlx::Error> {
    Ok(ContentVersion {
        id: VersionId::from_uuid(row.try_get("id")?),
        content_id: ContentId::from_uuid(row.try_get("content_id")?),
        version_number: row.try_get("version_number")?,
        is_autosave: row.try_get("is_autosave")?,
        is_current: row.try_get("is_current")?,
        created_by: UserId::from_uuid(row.try_get("created_by")?),
        created_at: row.try_get("created_at")?,
    })
}

fn lock_from_row(row: &PgRow) -> Result<ContentLock, sqlx::Error> {
    Ok(ContentLock {
        id: LockId::from_uuid(row.try_get("id")?),
        content_id: ContentId::from_uuid(row.try_get("content_id")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        acquired_at: row.try_get("acquired_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<RecurringSchedule, sqlx::Error> {
    let rule: String = row.try_get("rule")?;
    let runs: i32 = row.try_get("runs")?;
    Ok(RecurringSchedule {
        id: ScheduleId::from_uuid(row.try_get("id")?),
        content_id: ContentId::from_uuid(row.try_get("content_id")?),
        rule: rule.parse::<RecurrenceRule>().map_err(corrupt)?,
        starts_at: row.try_get("starts_at")?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
        runs: u32::try_from(runs).map_err(corrupt)?,
        active: row.try_get("active")?,
    })
}

const CONTENT_COLUMNS: &str = "id, title, author_id, publish_status, scheduled_publish_at, \
     scheduled_unpublish_at, published_at, unpublished_at, review_requested_at, updated_at";

#[async_trait]
impl ContentRepository for PgCmsStore {
    #[instrument(skip(self, item), fields(content_id = %item.id), err)]
    async fn insert_content(&self, item: &ContentItem) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO content_items (
                id, title, author_id, publish_status, scheduled_publish_at,
                scheduled_unpublish_at, published_at, unpublished_at, review_requested_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(&item.title)
        .bind(item.author_id.as_uuid())
        .bind(item.publish_status.as_str())
        .bind(item.scheduled_publish_at)
        .bind(item.scheduled_unpublish_at)
        .bind(item.published_at)
        .bind(item.unpublished_at)
        .bind(item.review_requested_at)
        .bind(item.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("insert_content", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_content(&self, id: ContentId) -> Result<Option<ContentItem>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CONTENT_COLUMNS} FROM content_items WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_err("get_content", e))?;
        Ok(decode_rows("get_content", row.into_iter().collect(), content_from_row)?.pop())
    }

    #[instrument(skip(self), err)]
    async fn due_for_publish(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_items \
             WHERE publish_status = 'scheduled' AND scheduled_publish_at <= $1 \
             ORDER BY scheduled_publish_at ASC, id ASC LIMIT $2"
        ))
        .bind(now)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("due_for_publish", e))?;
        decode_rows("due_for_publish", rows, content_from_row)
    }

    #[instrument(skip(self), err)]
    async fn due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_items \
             WHERE publish_status = 'published' AND scheduled_unpublish_at <= $1 \
             ORDER BY scheduled_unpublish_at ASC, id ASC LIMIT $2"
        ))
        .bind(now)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("due_for_expiry", e))?;
        decode_rows("due_for_expiry", rows, content_from_row)
    }

    #[instrument(skip(self), err)]
    async fn awaiting_review(
        &self,
        requested_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_items \
             WHERE publish_status = 'pending_review' AND review_requested_at <= $1 \
             ORDER BY review_requested_at ASC, id ASC LIMIT $2"
        ))
        .bind(requested_before)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("awaiting_review", e))?;
        decode_rows("awaiting_review", rows, content_from_row)
    }

    #[instrument(skip(self), err)]
    async fn publish_if_due(&self, id: ContentId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE content_items SET
                publish_status = 'published',
                published_at = $2,
                unpublished_at = NULL,
                updated_at = $2
            WHERE id = $1
              AND publish_status = 'scheduled'
              AND scheduled_publish_at <= $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("publish_if_due", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn expire_if_due(&self, id: ContentId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE content_items SET
                publish_status = 'expired',
                unpublished_at = $2,
                updated_at = $2
            WHERE id = $1
              AND publish_status = 'published'
              AND scheduled_unpublish_at <= $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("expire_if_due", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn publish_from(
        &self,
        id: ContentId,
        expected: PublishStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE content_items SET
                publish_status = 'published',
                published_at = $3,
                unpublished_at = NULL,
                updated_at = $3
            WHERE id = $1 AND publish_status = $2 AND publish_status <> 'published'
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("publish_from", e))?;
        Ok(result.rows_affected() == 1)
    }
}

const SCHEDULED_EXPORT_COLUMNS: &str =
    "id, name, owner_id, frequency, format, active, last_run_at, created_at";

#[async_trait]
impl ExportRepository for PgCmsStore {
    #[instrument(skip(self, export), fields(export_id = %export.id), err)]
    async fn insert_scheduled_export(&self, export: &ScheduledExport) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_exports (id, name, owner_id, frequency, format, active, last_run_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(export.id.as_uuid())
        .bind(&export.name)
        .bind(export.owner_id.as_uuid())
        .bind(export.frequency.as_str())
        .bind(&export.format)
        .bind(export.active)
        .bind(export.last_run_at)
        .bind(export.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("insert_scheduled_export", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_scheduled_export(
        &self,
        id: ExportId,
    ) -> Result<Option<ScheduledExport>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULED_EXPORT_COLUMNS} FROM scheduled_exports WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("get_scheduled_export", e))?;
        Ok(decode_rows("get_scheduled_export", row.into_iter().collect(), scheduled_export_from_row)?.pop())
    }

    #[instrument(skip(self), err)]
    async fn due_exports(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledExport>, RepositoryError> {
        // Calendar arithmetic matches `ExportFrequency::after` (months clamp to month end).
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULED_EXPORT_COLUMNS} FROM (
                SELECT *,
                    CASE
                        WHEN last_run_at IS NULL THEN created_at
                        ELSE last_run_at + CASE frequency
                            WHEN 'hourly' THEN INTERVAL '1 hour'
                            WHEN 'daily' THEN INTERVAL '1 day'
                            WHEN 'weekly' THEN INTERVAL '1 week'
                            ELSE INTERVAL '1 month'
                        END
                    END AS next_due_at
                FROM scheduled_exports
                WHERE active
            ) due
            WHERE next_due_at <= $1
            ORDER BY next_due_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("due_exports", e))?;
        decode_rows("due_exports", rows, scheduled_export_from_row)
    }

    #[instrument(skip(self), err)]
    async fn mark_export_run(
        &self,
        id: ExportId,
        expected_last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_exports SET last_run_at = $3
            WHERE id = $1 AND active AND last_run_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected_last_run)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("mark_export_run", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, export), fields(export_id = %export.id), err)]
    async fn record_analytics_export(&self, export: &AnalyticsExport) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO analytics_exports (id, scheduled_export_id, file_path, format, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(export.id.as_uuid())
        .bind(export.scheduled_export_id.map(|id| *id.as_uuid()))
        .bind(&export.file_path)
        .bind(&export.format)
        .bind(export.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("record_analytics_export", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn expired_analytics_exports(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AnalyticsExport>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, scheduled_export_id, file_path, format, created_at
            FROM analytics_exports
            WHERE created_at < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("expired_analytics_exports", e))?;
        decode_rows("expired_analytics_exports", rows, analytics_export_from_row)
    }

    #[instrument(skip(self), err)]
    async fn delete_analytics_export(
        &self,
        id: ExportId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM analytics_exports WHERE id = $1 AND created_at < $2")
            .bind(id.as_uuid())
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_err("delete_analytics_export", e))?;
        Ok(result.rows_affected() == 1)
    }
}

const VERSION_COLUMNS: &str =
    "id, content_id, version_number, is_autosave, is_current, created_by, created_at";

#[async_trait]
impl VersionRepository for PgCmsStore {
    #[instrument(skip(self, version), fields(version_id = %version.id), err)]
    async fn insert_version(&self, version: &ContentVersion) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO content_versions (id, content_id, version_number, is_autosave, is_current, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(version.id.as_uuid())
        .bind(version.content_id.as_uuid())
        .bind(&version.version_number)
        .bind(version.is_autosave)
        .bind(version.is_current)
        .bind(version.created_by.as_uuid())
        .bind(version.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("insert_version", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn versions_for(&self, content_id: ContentId) -> Result<Vec<ContentVersion>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM content_versions WHERE content_id = $1 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(content_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("versions_for", e))?;
        decode_rows("versions_for", rows, version_from_row)
    }

    #[instrument(skip(self), err)]
    async fn stale_autosaves(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentVersion>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM content_versions \
             WHERE is_autosave AND NOT is_current AND created_at < $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("stale_autosaves", e))?;
        decode_rows("stale_autosaves", rows, version_from_row)
    }

    #[instrument(skip(self), err)]
    async fn delete_stale_autosave(
        &self,
        id: VersionId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM content_versions \
             WHERE id = $1 AND is_autosave AND NOT is_current AND created_at < $2",
        )
        .bind(id.as_uuid())
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("delete_stale_autosave", e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LockRepository for PgCmsStore {
    #[instrument(skip(self, lock), fields(lock_id = %lock.id), err)]
    async fn insert_lock(&self, lock: &ContentLock) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO content_locks (id, content_id, user_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(lock.id.as_uuid())
        .bind(lock.content_id.as_uuid())
        .bind(lock.user_id.as_uuid())
        .bind(lock.acquired_at)
        .bind(lock.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("insert_lock", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_lock(&self, id: LockId) -> Result<Option<ContentLock>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, content_id, user_id, acquired_at, expires_at FROM content_locks WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("get_lock", e))?;
        Ok(decode_rows("get_lock", row.into_iter().collect(), lock_from_row)?.pop())
    }

    #[instrument(skip(self), err)]
    async fn expired_locks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentLock>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, content_id, user_id, acquired_at, expires_at
            FROM content_locks
            WHERE expires_at <= $1
            ORDER BY expires_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("expired_locks", e))?;
        decode_rows("expired_locks", rows, lock_from_row)
    }

    #[instrument(skip(self), err)]
    async fn delete_expired_lock(&self, id: LockId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM content_locks WHERE id = $1 AND expires_at <= $2")
            .bind(id.as_uuid())
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_err("delete_expired_lock", e))?;
        Ok(result.rows_affected() == 1)
    }
}

const SCHEDULE_COLUMNS: &str =
    "id, content_id, rule, starts_at, next_run_at, last_run_at, runs, active";

#[async_trait]
impl ScheduleRepository for PgCmsStore {
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id), err)]
    async fn insert_schedule(&self, schedule: &RecurringSchedule) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO recurring_schedules (id, content_id, rule, starts_at, next_run_at, last_run_at, runs, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.content_id.as_uuid())
        .bind(schedule.rule.to_string())
        .bind(schedule.starts_at)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(i32::try_from(schedule.runs).unwrap_or(i32::MAX))
        .bind(schedule.active)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("insert_schedule", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<RecurringSchedule>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM recurring_schedules WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("get_schedule", e))?;
        Ok(decode_rows("get_schedule", row.into_iter().collect(), schedule_from_row)?.pop())
    }

    #[instrument(skip(self), err)]
    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringSchedule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM recurring_schedules \
             WHERE active AND next_run_at <= $1 \
             ORDER BY next_run_at ASC, id ASC LIMIT $2"
        ))
        .bind(now)
        .bind(pg::as_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_err("due_schedules", e))?;
        decode_rows("due_schedules", rows, schedule_from_row)
    }

    #[instrument(skip(self, advance), err)]
    async fn advance_schedule(
        &self,
        id: ScheduleId,
        expected_next_run: DateTime<Utc>,
        advance: &ScheduleAdvance,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_schedules SET
                next_run_at = COALESCE($3, next_run_at),
                runs = $4,
                active = $5,
                last_run_at = $6
            WHERE id = $1 AND active AND next_run_at = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected_next_run)
        .bind(advance.next_run_at)
        .bind(i32::try_from(advance.runs).unwrap_or(i32::MAX))
        .bind(advance.active)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("advance_schedule", e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_cms::Frequency;
    use chrono::{Duration, TimeZone};

    /// Connect when `DATABASE_URL` is set; these tests are skipped otherwise.
    async fn store() -> Option<PgCmsStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        let store = PgCmsStore::new(pool);
        store.ensure_schema().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn content_publish_round_trip() {
        let Some(store) = store().await else { return };
        let t0 = Utc::now();
        let mut item = ContentItem::draft("pg post", UserId::new(), t0);
        item.schedule(t0 - Duration::seconds(1), None, t0).unwrap();
        store.insert_content(&item).await.unwrap();

        let due = store.due_for_publish(t0, 1000).await.unwrap();
        assert!(due.iter().any(|c| c.id == item.id));

        assert!(store.publish_if_due(item.id, t0).await.unwrap());
        assert!(!store.publish_if_due(item.id, t0).await.unwrap());
        let stored = store.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.publish_status, PublishStatus::Published);
        assert_eq!(stored.title, "pg post");
    }

    #[tokio::test]
    async fn schedule_advance_is_conditional() {
        let Some(store) = store().await else { return };
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let schedule = RecurringSchedule::new(
            ContentId::new(),
            RecurrenceRule::new(Frequency::Daily),
            start,
        );
        store.insert_schedule(&schedule).await.unwrap();

        let now = start + Duration::hours(1);
        let advance = schedule.advance(now);
        assert!(store.advance_schedule(schedule.id, schedule.next_run_at, &advance, now).await.unwrap());
        assert!(!store.advance_schedule(schedule.id, schedule.next_run_at, &advance, now).await.unwrap());

        let stored = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.runs, 1);
        assert_eq!(Some(stored.next_run_at), advance.next_run_at);
    }
}

//! Storage ports for the CMS rows the sweeps and handlers drive.
//!
//! Every mutating method is a conditional write: it re-checks the row's
//! trigger predicate (or expected prior state) and returns `false` when the
//! row no longer matches. That is what makes a second sweep pass a no-op.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use autopilot_cms::{
    AnalyticsExport, ContentItem, ContentLock, ContentVersion, PublishStatus, RecurringSchedule,
    ScheduleAdvance, ScheduledExport,
};
use autopilot_core::{ContentId, ExportId, LockId, ScheduleId, VersionId};

pub use in_memory::InMemoryCms;
pub use postgres::PgCmsStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("row already exists: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn insert_content(&self, item: &ContentItem) -> Result<(), RepositoryError>;

    async fn get_content(&self, id: ContentId) -> Result<Option<ContentItem>, RepositoryError>;

    /// `scheduled` items whose publish time has passed.
    async fn due_for_publish(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError>;

    /// `published` items whose unpublish time has passed.
    async fn due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError>;

    /// `pending_review` items requested at or before `requested_before`.
    async fn awaiting_review(
        &self,
        requested_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError>;

    /// Publish the item if it is still `scheduled` with its publish time at
    /// or before `now`. Only the status columns are written, so an edit made
    /// after discovery is kept (or, if it moved the publish time, wins).
    async fn publish_if_due(&self, id: ContentId, now: DateTime<Utc>) -> Result<bool, RepositoryError>;

    /// Expire the item if it is still `published` with its unpublish time at
    /// or before `now`. Only the status columns are written.
    async fn expire_if_due(&self, id: ContentId, now: DateTime<Utc>) -> Result<bool, RepositoryError>;

    /// Publish immediately if the stored status is still `expected`.
    async fn publish_from(
        &self,
        id: ContentId,
        expected: PublishStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ExportRepository: Send + Sync {
    async fn insert_scheduled_export(&self, export: &ScheduledExport) -> Result<(), RepositoryError>;

    async fn get_scheduled_export(
        &self,
        id: ExportId,
    ) -> Result<Option<ScheduledExport>, RepositoryError>;

    async fn due_exports(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledExport>, RepositoryError>;

    /// Stamp `last_run_at = now` if it still equals `expected_last_run`.
    async fn mark_export_run(
        &self,
        id: ExportId,
        expected_last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn record_analytics_export(&self, export: &AnalyticsExport) -> Result<(), RepositoryError>;

    /// Generated exports created before `cutoff`, oldest first.
    async fn expired_analytics_exports(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AnalyticsExport>, RepositoryError>;

    async fn delete_analytics_export(
        &self,
        id: ExportId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait VersionRepository: Send + Sync {
    async fn insert_version(&self, version: &ContentVersion) -> Result<(), RepositoryError>;

    async fn versions_for(&self, content_id: ContentId) -> Result<Vec<ContentVersion>, RepositoryError>;

    /// Non-current autosaves created before `cutoff`.
    async fn stale_autosaves(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentVersion>, RepositoryError>;

    async fn delete_stale_autosave(
        &self,
        id: VersionId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait LockRepository: Send + Sync {
    async fn insert_lock(&self, lock: &ContentLock) -> Result<(), RepositoryError>;

    async fn get_lock(&self, id: LockId) -> Result<Option<ContentLock>, RepositoryError>;

    async fn expired_locks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentLock>, RepositoryError>;

    /// Delete only if `expires_at <= now` still holds.
    async fn delete_expired_lock(&self, id: LockId, now: DateTime<Utc>) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn insert_schedule(&self, schedule: &RecurringSchedule) -> Result<(), RepositoryError>;

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<RecurringSchedule>, RepositoryError>;

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringSchedule>, RepositoryError>;

    /// Apply `advance` if the schedule is still active at `expected_next_run`.
    async fn advance_schedule(
        &self,
        id: ScheduleId,
        expected_next_run: DateTime<Utc>,
        advance: &ScheduleAdvance,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

/// All CMS ports behind one handle.
pub trait CmsStore:
    ContentRepository + ExportRepository + VersionRepository + LockRepository + ScheduleRepository
{
}

impl<T> CmsStore for T where
    T: ContentRepository + ExportRepository + VersionRepository + LockRepository + ScheduleRepository
{
}

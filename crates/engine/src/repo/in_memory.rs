//! In-memory CMS store for tests/dev.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use autopilot_cms::{
    AnalyticsExport, ContentItem, ContentLock, ContentVersion, PublishStatus, RecurringSchedule,
    ScheduleAdvance, ScheduledExport,
};
use autopilot_core::{ContentId, Entity, ExportId, LockId, ScheduleId, VersionId};

use super::{
    ContentRepository, ExportRepository, LockRepository, RepositoryError, ScheduleRepository,
    VersionRepository,
};

/// One keyed table.
#[derive(Debug)]
struct Table<T: Entity> {
    name: &'static str,
    rows: Mutex<BTreeMap<T::Id, T>>,
}

impl<T: Entity + Clone> Table<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<T::Id, T>>, RepositoryError> {
        self.rows
            .lock()
            .map_err(|_| RepositoryError::Storage(format!("{} table lock poisoned", self.name)))
    }

    fn insert(&self, row: &T) -> Result<(), RepositoryError> {
        let mut rows = self.lock()?;
        if rows.contains_key(&row.id()) {
            return Err(RepositoryError::Conflict(format!("{} {}", self.name, row.id())));
        }
        rows.insert(row.id(), row.clone());
        Ok(())
    }

    fn get(&self, id: T::Id) -> Result<Option<T>, RepositoryError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    /// Matching rows sorted by `key`, truncated to `limit`.
    fn select<K, P, F>(&self, pred: P, key: F, limit: usize) -> Result<Vec<T>, RepositoryError>
    where
        K: Ord,
        P: Fn(&T) -> bool,
        F: Fn(&T) -> K,
    {
        let rows = self.lock()?;
        let mut out: Vec<T> = rows.values().filter(|r| pred(r)).cloned().collect();
        out.sort_by_key(|r| key(r));
        out.truncate(limit);
        Ok(out)
    }

    /// Mutate the row if `pred` still holds. Returns whether it did.
    fn update_if<P, F>(&self, id: T::Id, pred: P, f: F) -> Result<bool, RepositoryError>
    where
        P: FnOnce(&T) -> bool,
        F: FnOnce(&mut T),
    {
        let mut rows = self.lock()?;
        match rows.get_mut(&id) {
            Some(row) if pred(row) => {
                f(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_if<P>(&self, id: T::Id, pred: P) -> Result<bool, RepositoryError>
    where
        P: FnOnce(&T) -> bool,
    {
        let mut rows = self.lock()?;
        let matches = rows.get(&id).is_some_and(pred);
        if matches {
            rows.remove(&id);
        }
        Ok(matches)
    }
}

/// Every CMS table behind mutexes.
#[derive(Debug)]
pub struct InMemoryCms {
    content: Table<ContentItem>,
    scheduled_exports: Table<ScheduledExport>,
    analytics_exports: Table<AnalyticsExport>,
    versions: Table<ContentVersion>,
    locks: Table<ContentLock>,
    schedules: Table<RecurringSchedule>,
}

impl InMemoryCms {
    pub fn new() -> Self {
        Self {
            content: Table::new("content_items"),
            scheduled_exports: Table::new("scheduled_exports"),
            analytics_exports: Table::new("analytics_exports"),
            versions: Table::new("content_versions"),
            locks: Table::new("content_locks"),
            schedules: Table::new("recurring_schedules"),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Edit a stored content row in place, bypassing every predicate.
    #[cfg(test)]
    pub(crate) fn update_content_for_test(&self, id: ContentId, f: impl FnOnce(&mut ContentItem)) {
        assert!(self.content.update_if(id, |_| true, f).unwrap(), "content {id} missing");
    }
}

impl Default for InMemoryCms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentRepository for InMemoryCms {
    async fn insert_content(&self, item: &ContentItem) -> Result<(), RepositoryError> {
        self.content.insert(item)
    }

    async fn get_content(&self, id: ContentId) -> Result<Option<ContentItem>, RepositoryError> {
        self.content.get(id)
    }

    async fn due_for_publish(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError> {
        self.content.select(
            |c| c.is_due_for_publish(now),
            |c| (c.scheduled_publish_at, c.id),
            limit,
        )
    }

    async fn due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError> {
        self.content.select(
            |c| c.is_due_for_expiry(now),
            |c| (c.scheduled_unpublish_at, c.id),
            limit,
        )
    }

    async fn awaiting_review(
        &self,
        requested_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, RepositoryError> {
        self.content.select(
            |c| {
                c.publish_status == PublishStatus::PendingReview
                    && c.review_requested_at.is_some_and(|at| at <= requested_before)
            },
            |c| (c.review_requested_at, c.id),
            limit,
        )
    }

    async fn publish_if_due(&self, id: ContentId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        self.content.update_if(
            id,
            |row| row.is_due_for_publish(now),
            |row| {
                row.publish(now);
            },
        )
    }

    async fn expire_if_due(&self, id: ContentId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        self.content.update_if(
            id,
            |row| row.is_due_for_expiry(now),
            |row| {
                // The predicate already pinned the status to `published`.
                let _ = row.expire(now);
            },
        )
    }

    async fn publish_from(
        &self,
        id: ContentId,
        expected: PublishStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.content.update_if(
            id,
            |row| row.publish_status == expected && expected != PublishStatus::Published,
            |row| {
                row.publish(now);
            },
        )
    }
}

#[async_trait]
impl ExportRepository for InMemoryCms {
    async fn insert_scheduled_export(&self, export: &ScheduledExport) -> Result<(), RepositoryError> {
        self.scheduled_exports.insert(export)
    }

    async fn get_scheduled_export(
        &self,
        id: ExportId,
    ) -> Result<Option<ScheduledExport>, RepositoryError> {
        self.scheduled_exports.get(id)
    }

    async fn due_exports(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledExport>, RepositoryError> {
        self.scheduled_exports
            .select(|e| e.is_due(now), |e| (e.next_due_at(), e.id), limit)
    }

    async fn mark_export_run(
        &self,
        id: ExportId,
        expected_last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.scheduled_exports.update_if(
            id,
            |row| row.active && row.last_run_at == expected_last_run,
            |row| row.last_run_at = Some(now),
        )
    }

    async fn record_analytics_export(&self, export: &AnalyticsExport) -> Result<(), RepositoryError> {
        self.analytics_exports.insert(export)
    }

    async fn expired_analytics_exports(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AnalyticsExport>, RepositoryError> {
        self.analytics_exports
            .select(|e| e.is_expired(cutoff), |e| (e.created_at, e.id), limit)
    }

    async fn delete_analytics_export(
        &self,
        id: ExportId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.analytics_exports.delete_if(id, |e| e.is_expired(cutoff))
    }
}

#[async_trait]
impl VersionRepository for InMemoryCms {
    async fn insert_version(&self, version: &ContentVersion) -> Result<(), RepositoryError> {
        self.versions.insert(version)
    }

    async fn versions_for(&self, content_id: ContentId) -> Result<Vec<ContentVersion>, RepositoryError> {
        self.versions.select(
            |v| v.content_id == content_id,
            |v| (v.created_at, v.id),
            usize::MAX,
        )
    }

    async fn stale_autosaves(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentVersion>, RepositoryError> {
        self.versions
            .select(|v| v.is_stale_autosave(cutoff), |v| (v.created_at, v.id), limit)
    }

    async fn delete_stale_autosave(
        &self,
        id: VersionId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.versions.delete_if(id, |v| v.is_stale_autosave(cutoff))
    }
}

#[async_trait]
impl LockRepository for InMemoryCms {
    async fn insert_lock(&self, lock: &ContentLock) -> Result<(), RepositoryError> {
        self.locks.insert(lock)
    }

    async fn get_lock(&self, id: LockId) -> Result<Option<ContentLock>, RepositoryError> {
        self.locks.get(id)
    }

    async fn expired_locks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContentLock>, RepositoryError> {
        self.locks
            .select(|l| l.is_expired(now), |l| (l.expires_at, l.id), limit)
    }

    async fn delete_expired_lock(&self, id: LockId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        self.locks.delete_if(id, |l| l.is_expired(now))
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryCms {
    async fn insert_schedule(&self, schedule: &RecurringSchedule) -> Result<(), RepositoryError> {
        self.schedules.insert(schedule)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<RecurringSchedule>, RepositoryError> {
        self.schedules.get(id)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringSchedule>, RepositoryError> {
        self.schedules
            .select(|s| s.is_due(now), |s| (s.next_run_at, s.id), limit)
    }

    async fn advance_schedule(
        &self,
        id: ScheduleId,
        expected_next_run: DateTime<Utc>,
        advance: &ScheduleAdvance,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.schedules.update_if(
            id,
            |s| s.active && s.next_run_at == expected_next_run,
            |s| s.apply(advance, now),
        )
    }
}

//! Retention cleanup sweeps. A `null` retention window disables the sweep.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use autopilot_cms::{AnalyticsExport, ContentVersion, RetentionPolicy};

use super::{SideEffect, SweepError, SweepItem, SweepJob, Transition};
use crate::repo::{ExportRepository, VersionRepository};
use crate::tasks::{Task, TaskStore};

/// Deletes non-current autosave versions older than the retention window.
pub struct AutosaveRetentionSweep {
    repo: Arc<dyn VersionRepository>,
    policy: RetentionPolicy,
}

impl AutosaveRetentionSweep {
    pub fn new(repo: Arc<dyn VersionRepository>, policy: RetentionPolicy) -> Self {
        Self { repo, policy }
    }
}

#[async_trait]
impl SweepJob for AutosaveRetentionSweep {
    type Row = ContentVersion;
    type State = ();

    fn name(&self) -> &'static str {
        "autosave_retention"
    }

    fn enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    async fn discover(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ContentVersion>, SweepError> {
        match self.policy.cutoff(now) {
            Some(cutoff) => Ok(self.repo.stale_autosaves(cutoff, limit).await?),
            None => Ok(Vec::new()),
        }
    }

    fn transition(&self, _row: &ContentVersion, _now: DateTime<Utc>) -> Result<Transition<()>, SweepError> {
        Ok(Transition::to(()))
    }

    async fn apply(&self, row: &ContentVersion, _state: &(), now: DateTime<Utc>) -> Result<bool, SweepError> {
        match self.policy.cutoff(now) {
            Some(cutoff) => Ok(self.repo.delete_stale_autosave(row.id, cutoff).await?),
            None => Ok(false),
        }
    }

    fn describe(&self, row: &ContentVersion) -> SweepItem {
        SweepItem::new(row.id, format!("{} of {}", row.version_number, row.content_id))
    }
}

/// Deletes generated export rows past retention; removing the file is a
/// side effect.
pub struct AnalyticsExportRetentionSweep {
    repo: Arc<dyn ExportRepository>,
    policy: RetentionPolicy,
}

impl AnalyticsExportRetentionSweep {
    pub fn new(repo: Arc<dyn ExportRepository>, policy: RetentionPolicy) -> Self {
        Self { repo, policy }
    }
}

#[async_trait]
impl SweepJob for AnalyticsExportRetentionSweep {
    type Row = AnalyticsExport;
    type State = ();

    fn name(&self) -> &'static str {
        "analytics_export_retention"
    }

    fn enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    async fn discover(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<AnalyticsExport>, SweepError> {
        match self.policy.cutoff(now) {
            Some(cutoff) => Ok(self.repo.expired_analytics_exports(cutoff, limit).await?),
            None => Ok(Vec::new()),
        }
    }

    fn transition(&self, row: &AnalyticsExport, _now: DateTime<Utc>) -> Result<Transition<()>, SweepError> {
        Ok(Transition::to(()).with(SideEffect::DeleteFile(row.file_path.clone())))
    }

    async fn apply(&self, row: &AnalyticsExport, _state: &(), now: DateTime<Utc>) -> Result<bool, SweepError> {
        match self.policy.cutoff(now) {
            Some(cutoff) => Ok(self.repo.delete_analytics_export(row.id, cutoff).await?),
            None => Ok(false),
        }
    }

    fn describe(&self, row: &AnalyticsExport) -> SweepItem {
        SweepItem::new(row.id, row.file_path.clone())
    }
}

/// Purges `succeeded` / `dead` tasks last updated before the window.
pub struct TaskRetentionSweep {
    tasks: Arc<dyn TaskStore>,
    policy: RetentionPolicy,
}

impl TaskRetentionSweep {
    pub fn new(tasks: Arc<dyn TaskStore>, policy: RetentionPolicy) -> Self {
        Self { tasks, policy }
    }
}

#[async_trait]
impl SweepJob for TaskRetentionSweep {
    type Row = Task;
    type State = ();

    fn name(&self) -> &'static str {
        "task_retention"
    }

    fn enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    async fn discover(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, SweepError> {
        match self.policy.cutoff(now) {
            Some(cutoff) => Ok(self.tasks.purgeable(cutoff, limit).await?),
            None => Ok(Vec::new()),
        }
    }

    fn transition(&self, _row: &Task, _now: DateTime<Utc>) -> Result<Transition<()>, SweepError> {
        Ok(Transition::to(()))
    }

    async fn apply(&self, row: &Task, _state: &(), now: DateTime<Utc>) -> Result<bool, SweepError> {
        match self.policy.cutoff(now) {
            Some(cutoff) => Ok(self.tasks.purge(row.id, cutoff).await?),
            None => Ok(false),
        }
    }

    fn describe(&self, row: &Task) -> SweepItem {
        SweepItem::new(row.id, format!("{} ({})", row.name, row.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryCms;
    use crate::sweeps::Sweep;
    use crate::sweeps::test_support::harness;
    use crate::tasks::NewTask;
    use autopilot_core::{ContentId, ExportId, UserId};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn null_retention_deletes_nothing() {
        let cms = InMemoryCms::arc();
        let h = harness(now());
        let old = ContentVersion::autosave(ContentId::new(), UserId::new(), now() - Duration::days(400));
        cms.insert_version(&old).await.unwrap();

        let sweep = AutosaveRetentionSweep::new(cms.clone(), RetentionPolicy::disabled());
        let report = Sweep::run(&sweep, &h.ctx).await.unwrap();

        assert!(report.disabled);
        assert_eq!(report.applied, 0);
        assert_eq!(cms.versions_for(old.content_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn autosaves_past_retention_are_deleted_but_manual_versions_stay() {
        let cms = InMemoryCms::arc();
        let h = harness(now());
        let content = ContentId::new();
        let author = UserId::new();
        let stale = ContentVersion::autosave(content, author, now() - Duration::days(31));
        let fresh = ContentVersion::autosave(content, author, now() - Duration::days(2));
        let manual = ContentVersion::manual(content, "1.0", author, now() - Duration::days(90));
        for v in [&stale, &fresh, &manual] {
            cms.insert_version(v).await.unwrap();
        }

        let sweep = AutosaveRetentionSweep::new(cms.clone(), RetentionPolicy::days(30));
        let report = Sweep::run(&sweep, &h.ctx).await.unwrap();

        assert_eq!(report.applied, 1);
        let remaining: Vec<_> = cms
            .versions_for(content)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(&stale.id));
    }

    #[tokio::test]
    async fn expired_export_rows_and_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("old.json");
        std::fs::write(&file, b"{}").unwrap();

        let cms = InMemoryCms::arc();
        let mut h = harness(now());
        h.ctx.writer = Arc::new(crate::export_writer::FsExportWriter::new(dir.path()));
        let old = AnalyticsExport {
            id: ExportId::new(),
            scheduled_export_id: None,
            file_path: file.display().to_string(),
            format: "json".to_string(),
            created_at: now() - Duration::days(10),
        };
        let missing_file = AnalyticsExport {
            id: ExportId::new(),
            scheduled_export_id: None,
            file_path: dir.path().join("gone.json").display().to_string(),
            format: "json".to_string(),
            created_at: now() - Duration::days(9),
        };
        cms.record_analytics_export(&old).await.unwrap();
        cms.record_analytics_export(&missing_file).await.unwrap();

        let sweep = AnalyticsExportRetentionSweep::new(cms.clone(), RetentionPolicy::days(7));
        let report = Sweep::run(&sweep, &h.ctx).await.unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.effect_failures, 0);
        assert!(!file.exists());
        assert!(
            cms.expired_analytics_exports(now(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn terminal_tasks_are_purged_after_the_window() {
        let h = harness(now());
        let old = now() - Duration::days(40);
        let done = h
            .tasks
            .enqueue(NewTask::new("system_health_check", json!({})), old)
            .await
            .unwrap();
        let claimed = h
            .tasks
            .claim_eligible("w", 1, old, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        h.tasks.finalize_success(done.id, "w", old).await.unwrap();
        let waiting = h
            .tasks
            .enqueue(NewTask::new("content_approval_check", json!({})), old)
            .await
            .unwrap();

        let sweep = TaskRetentionSweep::new(h.tasks.clone(), RetentionPolicy::days(30));
        let report = Sweep::run(&sweep, &h.ctx).await.unwrap();

        assert_eq!(report.applied, 1);
        assert!(h.tasks.get(done.id).await.unwrap().is_none());
        assert!(h.tasks.get(waiting.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn oversized_task_window_purges_nothing() {
        let h = harness(now());
        let old = now() - Duration::days(400);
        let done = h
            .tasks
            .enqueue(NewTask::new("system_health_check", json!({})), old)
            .await
            .unwrap();
        h.tasks
            .claim_eligible("w", 1, old, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        h.tasks.finalize_success(done.id, "w", old).await.unwrap();

        let sweep = TaskRetentionSweep::new(h.tasks.clone(), RetentionPolicy::days(100_000_000));
        let report = Sweep::run(&sweep, &h.ctx).await.unwrap();

        assert!(!report.disabled);
        assert_eq!(report.discovered, 0);
        assert_eq!(report.applied, 0);
        assert!(h.tasks.get(done.id).await.unwrap().is_some());
    }
}

//! Scheduled-export dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use autopilot_cms::ScheduledExport;

use super::{SideEffect, SweepError, SweepItem, SweepJob, Transition};
use crate::repo::ExportRepository;
use crate::tasks::NewTask;
use crate::tasks::handlers::ANALYTICS_EXPORT;

/// Stamps `last_run_at` on every due export and enqueues one
/// `analytics_export` task for it.
pub struct ExportDueSweep {
    repo: Arc<dyn ExportRepository>,
}

impl ExportDueSweep {
    pub fn new(repo: Arc<dyn ExportRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SweepJob for ExportDueSweep {
    type Row = ScheduledExport;
    type State = DateTime<Utc>;

    fn name(&self) -> &'static str {
        "export_due"
    }

    async fn discover(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledExport>, SweepError> {
        Ok(self.repo.due_exports(now, limit).await?)
    }

    fn transition(
        &self,
        row: &ScheduledExport,
        now: DateTime<Utc>,
    ) -> Result<Transition<DateTime<Utc>>, SweepError> {
        let task = NewTask::new(
            ANALYTICS_EXPORT,
            json!({
                "scheduled_export_id": row.id,
                "due_at": row.next_due_at(),
            }),
        );
        Ok(Transition::to(now).with(SideEffect::Enqueue(task)))
    }

    async fn apply(
        &self,
        row: &ScheduledExport,
        last_run_at: &DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<bool, SweepError> {
        Ok(self
            .repo
            .mark_export_run(row.id, row.last_run_at, *last_run_at)
            .await?)
    }

    fn describe(&self, row: &ScheduledExport) -> SweepItem {
        SweepItem::new(row.id, format!("{} ({})", row.name, row.frequency.as_str()))
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use autopilot_cms::{RecurringSchedule, ScheduleAdvance};

use super::{SideEffect, SweepError, SweepItem, SweepJob, Transition};
use crate::repo::ScheduleRepository;
use crate::tasks::NewTask;
use crate::tasks::handlers::CONTENT_PUBLISH;

/// Fires due recurring publish schedules.
///
/// Each firing enqueues one `content_publish` task and moves `next_run_at`
/// to the first occurrence after now; missed occurrences are skipped.
pub struct RecurringScheduleSweep {
    repo: Arc<dyn ScheduleRepository>,
}

impl RecurringScheduleSweep {
    pub fn new(repo: Arc<dyn ScheduleRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SweepJob for RecurringScheduleSweep {
    type Row = RecurringSchedule;
    type State = ScheduleAdvance;

    fn name(&self) -> &'static str {
        "recurring_schedules"
    }

    async fn discover(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecurringSchedule>, SweepError> {
        Ok(self.repo.due_schedules(now, limit).await?)
    }

    fn transition(
        &self,
        row: &RecurringSchedule,
        now: DateTime<Utc>,
    ) -> Result<Transition<ScheduleAdvance>, SweepError> {
        let advance = row.advance(now);
        let task = NewTask::new(
            CONTENT_PUBLISH,
            json!({
                "content_id": row.content_id,
                "schedule_id": row.id,
                "occurrence": advance.fired_at,
            }),
        );
        Ok(Transition::to(advance).with(SideEffect::Enqueue(task)))
    }

    async fn apply(
        &self,
        row: &RecurringSchedule,
        advance: &ScheduleAdvance,
        now: DateTime<Utc>,
    ) -> Result<bool, SweepError> {
        Ok(self
            .repo
            .advance_schedule(row.id, row.next_run_at, advance, now)
            .await?)
    }

    fn describe(&self, row: &RecurringSchedule) -> SweepItem {
        SweepItem::new(row.id, format!("{} for content {}", row.rule, row.content_id))
    }
}

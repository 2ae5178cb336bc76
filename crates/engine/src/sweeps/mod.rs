//! Sweeps: periodic query-and-transition passes over time-triggered rows.
//!
//! ## Shape
//!
//! Every sweep is a [`SweepJob`]:
//!
//! - `discover(now)` reads rows whose trigger predicate holds
//! - `transition(row, now)` is pure and decides the new state plus side effects
//! - `apply(row, state, now)` is a conditional write that re-checks the predicate
//!
//! Side effects run only after `apply` reports the row changed, so a second
//! pass over an already-transitioned row neither writes nor notifies.
//! A failed side effect is logged and counted; the state write stands.
//! A failed row is logged and counted; the batch continues.

pub mod content;
pub mod exports;
pub mod locks;
pub mod recurring;
pub mod retention;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use autopilot_cms::RetentionPolicy;
use autopilot_core::{Clock, DomainError};

use crate::export_writer::ExportWriter;
use crate::notify::{Notification, Notifier};
use crate::repo::{CmsStore, RepositoryError};
use crate::tasks::{HandlerError, NewTask, Task, TaskHandler, TaskStore, TaskStoreError};

pub use content::{ContentExpireSweep, ContentPublishSweep};
pub use exports::ExportDueSweep;
pub use locks::ExpiredLockSweep;
pub use recurring::RecurringScheduleSweep;
pub use retention::{AnalyticsExportRetentionSweep, AutosaveRetentionSweep, TaskRetentionSweep};

/// Work performed after a row's state write succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    Notify(Notification),
    /// Enqueued with [`SweepContext::default_max_attempts`].
    Enqueue(NewTask),
    DeleteFile(String),
}

/// The pure result of [`SweepJob::transition`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    pub state: S,
    pub effects: Vec<SideEffect>,
}

impl<S> Transition<S> {
    pub fn to(state: S) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    pub fn with(mut self, effect: SideEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    TaskStore(#[from] TaskStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// A row the sweep transitioned, for console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepItem {
    pub id: String,
    pub label: String,
}

impl SweepItem {
    pub fn new(id: impl ToString, label: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            label: label.into(),
        }
    }
}

/// Aggregate outcome of one pass: "applied N, skipped M, errors K".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sweep: &'static str,
    /// `true` when the sweep is switched off (e.g. retention set to null).
    pub disabled: bool,
    pub discovered: usize,
    pub applied: usize,
    /// Rows that no longer matched the predicate at write time.
    pub skipped: usize,
    pub errors: usize,
    pub effect_failures: usize,
    pub items: Vec<SweepItem>,
}

impl SweepReport {
    fn new(sweep: &'static str) -> Self {
        Self {
            sweep,
            disabled: false,
            discovered: 0,
            applied: 0,
            skipped: 0,
            errors: 0,
            effect_failures: 0,
            items: Vec::new(),
        }
    }
}

/// Collaborators a sweep pass needs for its side effects.
#[derive(Clone)]
pub struct SweepContext {
    pub notifier: Arc<dyn Notifier>,
    pub tasks: Arc<dyn TaskStore>,
    pub writer: Arc<dyn ExportWriter>,
    pub clock: Arc<dyn Clock>,
    /// Maximum rows discovered per pass.
    pub batch_limit: usize,
    /// Attempt budget for tasks a sweep enqueues.
    pub default_max_attempts: u32,
}

impl SweepContext {
    async fn perform(&self, effect: &SideEffect, now: DateTime<Utc>) -> Result<(), String> {
        match effect {
            SideEffect::Notify(notification) => self
                .notifier
                .notify(notification)
                .await
                .map_err(|e| e.to_string()),
            SideEffect::Enqueue(task) => self
                .tasks
                .enqueue(task.clone().max_attempts(self.default_max_attempts), now)
                .await
                .map(|task| debug!(task_id = %task.id, name = %task.name, "sweep enqueued task"))
                .map_err(|e| e.to_string()),
            SideEffect::DeleteFile(path) => self.writer.remove(path).await.map_err(|e| e.to_string()),
        }
    }
}

/// One domain's discover / transition / apply triple.
#[async_trait]
pub trait SweepJob: Send + Sync {
    type Row: Send + Sync;
    type State: Send + Sync;

    fn name(&self) -> &'static str;

    fn enabled(&self) -> bool {
        true
    }

    async fn discover(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Self::Row>, SweepError>;

    fn transition(
        &self,
        row: &Self::Row,
        now: DateTime<Utc>,
    ) -> Result<Transition<Self::State>, SweepError>;

    /// Conditional write. `Ok(false)` means the row no longer qualifies.
    async fn apply(
        &self,
        row: &Self::Row,
        state: &Self::State,
        now: DateTime<Utc>,
    ) -> Result<bool, SweepError>;

    fn describe(&self, row: &Self::Row) -> SweepItem;
}

/// Object-safe view of a [`SweepJob`], so the scheduler can hold a mixed list.
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// A failed `discover` fails the pass; per-row failures never do.
    async fn run(&self, ctx: &SweepContext) -> Result<SweepReport, SweepError>;
}

#[async_trait]
impl<J: SweepJob> Sweep for J {
    fn name(&self) -> &'static str {
        SweepJob::name(self)
    }

    async fn run(&self, ctx: &SweepContext) -> Result<SweepReport, SweepError> {
        let sweep = SweepJob::name(self);
        let mut report = SweepReport::new(sweep);
        if !self.enabled() {
            report.disabled = true;
            debug!(sweep, "sweep disabled");
            return Ok(report);
        }

        let now = ctx.clock.now();
        let rows = self.discover(now, ctx.batch_limit).await?;
        report.discovered = rows.len();

        for row in &rows {
            let item = self.describe(row);
            let transition = match self.transition(row, now) {
                Ok(transition) => transition,
                Err(e) => {
                    warn!(sweep, id = %item.id, error = %e, "sweep transition failed");
                    report.errors += 1;
                    continue;
                }
            };

            match self.apply(row, &transition.state, now).await {
                Ok(true) => {
                    for effect in &transition.effects {
                        if let Err(error) = ctx.perform(effect, now).await {
                            warn!(sweep, id = %item.id, %error, "sweep side effect failed");
                            report.effect_failures += 1;
                        }
                    }
                    report.applied += 1;
                    report.items.push(item);
                }
                Ok(false) => {
                    debug!(sweep, id = %item.id, "row no longer eligible; skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(sweep, id = %item.id, error = %e, "sweep apply failed");
                    report.errors += 1;
                }
            }
        }

        if report.discovered > 0 {
            info!(
                sweep,
                discovered = report.discovered,
                applied = report.applied,
                skipped = report.skipped,
                errors = report.errors,
                effect_failures = report.effect_failures,
                "sweep pass finished"
            );
        }
        Ok(report)
    }
}

/// Runs a sweep as a queued task, so it can be dispatched through the queue.
pub struct SweepHandler {
    sweep: Arc<dyn Sweep>,
    ctx: SweepContext,
}

impl SweepHandler {
    pub fn new(sweep: Arc<dyn Sweep>, ctx: SweepContext) -> Self {
        Self { sweep, ctx }
    }
}

#[async_trait]
impl TaskHandler for SweepHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let report = self
            .sweep
            .run(&self.ctx)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        debug!(
            task_id = %task.id,
            sweep = report.sweep,
            applied = report.applied,
            errors = report.errors,
            "sweep task finished"
        );
        Ok(())
    }
}

/// Retention windows for the cleanup sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSettings {
    pub autosaves: RetentionPolicy,
    pub analytics_exports: RetentionPolicy,
    pub tasks: RetentionPolicy,
}

/// The per-tick sweep set, in the order they run.
pub struct SweepSet {
    pub content_publish: Arc<dyn Sweep>,
    pub content_expire: Arc<dyn Sweep>,
    pub export_due: Arc<dyn Sweep>,
    pub recurring: Arc<dyn Sweep>,
    pub autosave_retention: Arc<dyn Sweep>,
    pub analytics_retention: Arc<dyn Sweep>,
    pub task_retention: Arc<dyn Sweep>,
    pub expired_locks: Arc<dyn Sweep>,
}

impl SweepSet {
    pub fn new<S: CmsStore + 'static>(
        store: &Arc<S>,
        tasks: Arc<dyn TaskStore>,
        retention: RetentionSettings,
    ) -> Self {
        Self {
            content_publish: Arc::new(ContentPublishSweep::new(store.clone())),
            content_expire: Arc::new(ContentExpireSweep::new(store.clone())),
            export_due: Arc::new(ExportDueSweep::new(store.clone())),
            recurring: Arc::new(RecurringScheduleSweep::new(store.clone())),
            autosave_retention: Arc::new(AutosaveRetentionSweep::new(
                store.clone(),
                retention.autosaves,
            )),
            analytics_retention: Arc::new(AnalyticsExportRetentionSweep::new(
                store.clone(),
                retention.analytics_exports,
            )),
            task_retention: Arc::new(TaskRetentionSweep::new(tasks, retention.tasks)),
            expired_locks: Arc::new(ExpiredLockSweep::new(store.clone())),
        }
    }

    pub fn all(&self) -> Vec<Arc<dyn Sweep>> {
        vec![
            self.content_publish.clone(),
            self.content_expire.clone(),
            self.export_due.clone(),
            self.recurring.clone(),
            self.autosave_retention.clone(),
            self.analytics_retention.clone(),
            self.task_retention.clone(),
            self.expired_locks.clone(),
        ]
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use std::sync::Mutex;

    /// Rows are integers; even rows fail to apply, 3 no longer qualifies.
    struct NumberSweep {
        written: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl SweepJob for NumberSweep {
        type Row = u32;
        type State = u32;

        fn name(&self) -> &'static str {
            "numbers"
        }

        async fn discover(&self, _now: DateTime<Utc>, limit: usize) -> Result<Vec<u32>, SweepError> {
            Ok((1..=5).take(limit).collect())
        }

        fn transition(&self, row: &u32, _now: DateTime<Utc>) -> Result<Transition<u32>, SweepError> {
            if *row == 5 {
                return Err(DomainError::invalid_transition("five is not allowed").into());
            }
            Ok(Transition::to(row * 10).with(SideEffect::Notify(Notification::new(
                "ops",
                "number.applied",
                row.to_string(),
            ))))
        }

        async fn apply(&self, row: &u32, state: &u32, _now: DateTime<Utc>) -> Result<bool, SweepError> {
            match row {
                2 | 4 => Err(RepositoryError::Storage("disk full".into()).into()),
                3 => Ok(false),
                _ => {
                    self.written.lock().unwrap().push(*state);
                    Ok(true)
                }
            }
        }

        fn describe(&self, row: &u32) -> SweepItem {
            SweepItem::new(row, format!("number {row}"))
        }
    }

    #[tokio::test]
    async fn per_row_failures_do_not_abort_the_batch() {
        let h = harness(Utc::now());
        let sweep = NumberSweep {
            written: Mutex::new(Vec::new()),
        };

        let report = Sweep::run(&sweep, &h.ctx).await.unwrap();

        assert_eq!(report.discovered, 5);
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 3);
        assert_eq!(report.items, vec![SweepItem::new(1, "number 1")]);
        assert_eq!(*sweep.written.lock().unwrap(), vec![10]);
        // Only the applied row produced a notification.
        assert_eq!(h.notifier.count("number.applied"), 1);
    }

    #[tokio::test]
    async fn effect_failures_are_counted_but_keep_the_write() {
        let h = super::test_support::harness_with(
            Utc::now(),
            Arc::new(crate::notify::RecordingNotifier::failing()),
        );
        let sweep = NumberSweep {
            written: Mutex::new(Vec::new()),
        };

        let report = Sweep::run(&sweep, &h.ctx).await.unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.effect_failures, 1);
        assert_eq!(*sweep.written.lock().unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn sweep_handler_runs_the_sweep_as_a_task() {
        let h = harness(Utc::now());
        let sweep: Arc<NumberSweep> = Arc::new(NumberSweep {
            written: Mutex::new(Vec::new()),
        });
        let handler = SweepHandler::new(sweep.clone(), h.ctx.clone());
        let task = NewTask::new("numbers", serde_json::json!({})).into_task(Utc::now());

        handler.handle(&task).await.unwrap();
        assert_eq!(*sweep.written.lock().unwrap(), vec![10]);
    }
}

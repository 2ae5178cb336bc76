//! Built-in task handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use autopilot_cms::{AnalyticsExport, PublishStatus};
use autopilot_core::{Clock, ContentId, ExportId};

use super::registry::{HandlerError, HandlerRegistry, RegistryError, TaskHandler};
use super::store::TaskStore;
use super::types::Task;
use crate::export_writer::ExportWriter;
use crate::notify::{Notification, Notifier};
use crate::repo::{CmsStore, ContentRepository, ExportRepository};
use crate::sweeps::{Sweep, SweepContext, SweepHandler};

pub const SYSTEM_HEALTH_CHECK: &str = "system_health_check";
pub const CONTENT_APPROVAL_CHECK: &str = "content_approval_check";
pub const ANALYTICS_EXPORT: &str = "analytics_export";
pub const CONTENT_PUBLISH: &str = "content_publish";
pub const RECURRING_SCHEDULES: &str = "recurring_schedules";

/// Default review SLA for `content_approval_check`.
pub const DEFAULT_REVIEW_SLA_HOURS: u64 = 48;

const REVIEW_BATCH: usize = 500;
const MAX_REVIEW_SLA_HOURS: u64 = 24 * 365 * 10;

/// Collaborators shared by the built-in handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub content: Arc<dyn ContentRepository>,
    pub exports: Arc<dyn ExportRepository>,
    pub tasks: Arc<dyn TaskStore>,
    pub notifier: Arc<dyn Notifier>,
    pub writer: Arc<dyn ExportWriter>,
    pub clock: Arc<dyn Clock>,
    pub admin_recipient: Option<String>,
}

impl HandlerContext {
    pub fn new<S: CmsStore + 'static>(
        store: &Arc<S>,
        tasks: Arc<dyn TaskStore>,
        notifier: Arc<dyn Notifier>,
        writer: Arc<dyn ExportWriter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            content: store.clone(),
            exports: store.clone(),
            tasks,
            notifier,
            writer,
            clock,
            admin_recipient: None,
        }
    }

    pub fn with_admin_recipient(mut self, recipient: Option<String>) -> Self {
        self.admin_recipient = recipient;
        self
    }

    /// Notifications are fire-and-forget: a failed delivery is logged and
    /// never fails the task.
    async fn notify(&self, task: &Task, notification: Notification) -> bool {
        match self.notifier.notify(&notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %task.id, event = %notification.event, error = %e, "notification failed");
                false
            }
        }
    }
}

fn transient(err: impl std::fmt::Display) -> HandlerError {
    HandlerError::transient(err.to_string())
}

fn payload_id<T: std::str::FromStr>(task: &Task, key: &str) -> Result<T, HandlerError> {
    let raw = task
        .payload_str(key)
        .ok_or_else(|| HandlerError::permanent(format!("payload is missing `{key}`")))?;
    raw.parse()
        .map_err(|_| HandlerError::permanent(format!("payload `{key}` is not a valid id: {raw}")))
}

/// Logs queue statistics and alerts the admin about dead-lettered tasks.
pub struct SystemHealthCheck {
    ctx: HandlerContext,
}

#[async_trait]
impl TaskHandler for SystemHealthCheck {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let stats = self.ctx.tasks.stats().await.map_err(transient)?;
        info!(
            pending = stats.pending,
            leased = stats.leased,
            succeeded = stats.succeeded,
            failed_retryable = stats.failed_retryable,
            dead = stats.dead,
            "task queue health"
        );

        if stats.dead > 0 {
            warn!(dead = stats.dead, "dead-lettered tasks need attention");
            if let Some(admin) = &self.ctx.admin_recipient {
                let notification = Notification::new(
                    admin.clone(),
                    "system.dead_tasks",
                    format!("{} task(s) are dead-lettered", stats.dead),
                )
                .with_data(json!({ "dead": stats.dead }));
                self.ctx.notify(task, notification).await;
            }
        }
        Ok(())
    }
}

/// Reminds authors of content stuck in review past `payload.sla_hours`.
pub struct ContentApprovalCheck {
    ctx: HandlerContext,
}

#[async_trait]
impl TaskHandler for ContentApprovalCheck {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let sla_hours = match task.payload.get("sla_hours") {
            None | Some(Value::Null) => DEFAULT_REVIEW_SLA_HOURS,
            Some(value) => value
                .as_u64()
                .filter(|h| *h > 0)
                .ok_or_else(|| HandlerError::permanent(format!("invalid sla_hours: {value}")))?,
        };
        let sla = Duration::hours(sla_hours.min(MAX_REVIEW_SLA_HOURS) as i64);
        let now = self.ctx.clock.now();

        let overdue = self
            .ctx
            .content
            .awaiting_review(now - sla, REVIEW_BATCH)
            .await
            .map_err(transient)?;

        let mut reminded = 0usize;
        for item in &overdue {
            let notification = Notification::new(
                item.author_id.to_string(),
                "content.review_overdue",
                format!("\"{}\" has been awaiting review for over {sla_hours}h", item.title),
            )
            .with_data(json!({ "content_id": item.id, "review_requested_at": item.review_requested_at }));
            if self.ctx.notify(task, notification).await {
                reminded += 1;
            }
        }
        info!(overdue = overdue.len(), reminded, sla_hours, "content approval check");
        Ok(())
    }
}

/// Generates the file for one scheduled export and records it.
pub struct AnalyticsExportHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl TaskHandler for AnalyticsExportHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let export_id: ExportId = payload_id(task, "scheduled_export_id")?;
        let scheduled = self
            .ctx
            .exports
            .get_scheduled_export(export_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| HandlerError::permanent(format!("scheduled export {export_id} not found")))?;

        let now = self.ctx.clock.now();
        let document = json!({
            "export_id": scheduled.id,
            "name": scheduled.name,
            "format": scheduled.format,
            "frequency": scheduled.frequency.as_str(),
            "generated_at": now,
            "due_at": task.payload.get("due_at").cloned().unwrap_or(Value::Null),
            "rows": [],
        });
        let file_name = format!("{}-{}.json", scheduled.id, now.format("%Y%m%d%H%M%S"));
        let path = self
            .ctx
            .writer
            .write(&file_name, &document)
            .await
            .map_err(transient)?;

        let generated = AnalyticsExport {
            id: ExportId::new(),
            scheduled_export_id: Some(scheduled.id),
            file_path: path.clone(),
            format: scheduled.format.clone(),
            created_at: now,
        };
        self.ctx
            .exports
            .record_analytics_export(&generated)
            .await
            .map_err(transient)?;

        let notification = Notification::new(
            scheduled.owner_id.to_string(),
            "export.ready",
            format!("export \"{}\" is ready", scheduled.name),
        )
        .with_data(json!({ "path": path }));
        self.ctx.notify(task, notification).await;
        Ok(())
    }
}

/// Publishes one content item (used by recurring schedules).
pub struct ContentPublishHandler {
    ctx: HandlerContext,
}

#[async_trait]
impl TaskHandler for ContentPublishHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let content_id: ContentId = payload_id(task, "content_id")?;
        let item = self
            .ctx
            .content
            .get_content(content_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| HandlerError::permanent(format!("content {content_id} not found")))?;

        if item.publish_status == PublishStatus::Published {
            debug!(task_id = %task.id, %content_id, "content already published");
            return Ok(());
        }
        let written = self
            .ctx
            .content
            .publish_from(content_id, item.publish_status, self.ctx.clock.now())
            .await
            .map_err(transient)?;
        if !written {
            return Err(HandlerError::transient(format!(
                "content {content_id} changed while publishing"
            )));
        }

        let notification = Notification::new(
            item.author_id.to_string(),
            "content.published",
            format!("\"{}\" has been published", item.title),
        )
        .with_data(json!({ "content_id": item.id, "schedule_id": task.payload.get("schedule_id") }));
        self.ctx.notify(task, notification).await;
        Ok(())
    }
}

/// Register every built-in handler. `recurring` runs as the
/// `recurring_schedules` task.
pub fn register_builtin_handlers(
    registry: &mut HandlerRegistry,
    ctx: &HandlerContext,
    recurring: Arc<dyn Sweep>,
    sweep_ctx: SweepContext,
) -> Result<(), RegistryError> {
    registry.register(
        SYSTEM_HEALTH_CHECK,
        Arc::new(SystemHealthCheck { ctx: ctx.clone() }),
    )?;
    registry.register(
        CONTENT_APPROVAL_CHECK,
        Arc::new(ContentApprovalCheck { ctx: ctx.clone() }),
    )?;
    registry.register(
        ANALYTICS_EXPORT,
        Arc::new(AnalyticsExportHandler { ctx: ctx.clone() }),
    )?;
    registry.register(
        CONTENT_PUBLISH,
        Arc::new(ContentPublishHandler { ctx: ctx.clone() }),
    )?;
    registry.register(
        RECURRING_SCHEDULES,
        Arc::new(SweepHandler::new(recurring, sweep_ctx)),
    )?;
    Ok(())
}

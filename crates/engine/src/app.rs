//! Wiring: stores, registry, executor, sweeps and scheduler from one config.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::info;

use autopilot_core::{Clock, SystemClock};

use crate::config::{AutopilotConfig, ConfigError};
use crate::export_writer::{ExportWriter, FsExportWriter};
use crate::notify::{Notifier, TracingNotifier};
use crate::process::{
    InMemoryProcessStateStore, PostgresProcessStateStore, ProcessControl, ProcessError,
    ProcessStateStore,
};
use crate::repo::{CmsStore, InMemoryCms, PgCmsStore, RepositoryError};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::sweeps::{SweepContext, SweepSet};
use crate::tasks::{
    Executor, HandlerContext, HandlerRegistry, InMemoryTaskStore, PostgresTaskStore,
    RegistryError, TaskStore, TaskStoreError, register_builtin_handlers,
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to database: {0}")]
    Connect(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    TaskStore(#[from] TaskStoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// A fully wired engine.
pub struct Autopilot {
    pub config: AutopilotConfig,
    pub tasks: Arc<dyn TaskStore>,
    pub registry: Arc<HandlerRegistry>,
    pub sweeps: SweepSet,
    pub sweep_ctx: SweepContext,
    pub scheduler: Scheduler,
    pub control: ProcessControl,
}

impl Autopilot {
    pub fn assemble<S: CmsStore + 'static>(
        config: AutopilotConfig,
        cms: Arc<S>,
        tasks: Arc<dyn TaskStore>,
        process: Arc<dyn ProcessStateStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let worker_id = config.worker_id();
        let writer: Arc<dyn ExportWriter> =
            Arc::new(FsExportWriter::new(config.exports.output_dir.clone()));

        let sweep_ctx = SweepContext {
            notifier: notifier.clone(),
            tasks: tasks.clone(),
            writer: writer.clone(),
            clock: clock.clone(),
            batch_limit: config.sweeps.batch_limit,
            default_max_attempts: config.retry.default_max_attempts,
        };
        let sweeps = SweepSet::new(&cms, tasks.clone(), config.retention());

        let handler_ctx = HandlerContext::new(&cms, tasks.clone(), notifier, writer, clock.clone())
            .with_admin_recipient(config.notifications.admin_recipient.clone());
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(
            &mut registry,
            &handler_ctx,
            sweeps.recurring.clone(),
            sweep_ctx.clone(),
        )?;
        let registry = Arc::new(registry);

        let executor = Arc::new(Executor::new(
            tasks.clone(),
            registry.clone(),
            config.retry_policy(),
            Duration::from_secs(config.scheduler.task_timeout_secs),
            worker_id.clone(),
            clock.clone(),
        ));
        let scheduler = Scheduler::new(
            tasks.clone(),
            executor,
            sweeps.all(),
            sweep_ctx.clone(),
            SchedulerConfig::from(&config),
        );
        let control = ProcessControl::new(process, worker_id, clock);

        Ok(Self {
            config,
            tasks,
            registry,
            sweeps,
            sweep_ctx,
            scheduler,
            control,
        })
    }

    /// Single-process engine with in-memory stores.
    pub fn in_memory(config: AutopilotConfig) -> Result<Self, AppError> {
        Self::assemble(
            config,
            InMemoryCms::arc(),
            InMemoryTaskStore::arc(),
            Arc::new(InMemoryProcessStateStore::new()),
            Arc::new(TracingNotifier),
            Arc::new(SystemClock),
        )
    }

    /// Connect to PostgreSQL, apply the schema and wire the engine.
    pub async fn connect(config: AutopilotConfig) -> Result<Self, AppError> {
        let url = config.database_url()?.to_string();
        let pool = PgPool::connect(&url)
            .await
            .map_err(|e| AppError::Connect(e.to_string()))?;

        let tasks = PostgresTaskStore::new(pool.clone());
        tasks.ensure_schema().await?;
        let process = PostgresProcessStateStore::new(pool.clone());
        process.ensure_schema().await?;
        let cms = PgCmsStore::new(pool);
        cms.ensure_schema().await?;
        info!("database schema ready");

        Self::assemble(
            config,
            Arc::new(cms),
            Arc::new(tasks),
            Arc::new(process),
            Arc::new(TracingNotifier),
            Arc::new(SystemClock),
        )
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.config.retry.default_max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::handlers::{
        ANALYTICS_EXPORT, CONTENT_APPROVAL_CHECK, CONTENT_PUBLISH, RECURRING_SCHEDULES,
        SYSTEM_HEALTH_CHECK,
    };

    #[tokio::test]
    async fn in_memory_engine_is_wired_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AutopilotConfig::default();
        config.exports.output_dir = dir.path().to_path_buf();
        config.worker_id = Some("test-worker".to_string());

        let app = Autopilot::in_memory(config).unwrap();

        assert_eq!(app.control.owner(), "test-worker");
        assert_eq!(
            app.registry.names(),
            vec![
                ANALYTICS_EXPORT,
                CONTENT_APPROVAL_CHECK,
                CONTENT_PUBLISH,
                RECURRING_SCHEDULES,
                SYSTEM_HEALTH_CHECK,
            ]
        );
        assert_eq!(app.sweeps.all().len(), 8);
        assert!(app.scheduler.tick().await.unwrap().is_idle());
    }
}

//! The control loop: reclaim, claim, execute, sweep, once per tick.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use autopilot_core::Clock;

use crate::config::AutopilotConfig;
use crate::process::{Ownership, ProcessControl, ProcessError};
use crate::sweeps::{Sweep, SweepContext, SweepReport};
use crate::tasks::{ExecutionReport, Executor, TaskStatus, TaskStore, TaskStoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub lease_duration: Duration,
    pub error_backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&AutopilotConfig::default())
    }
}

impl From<&AutopilotConfig> for SchedulerConfig {
    fn from(config: &AutopilotConfig) -> Self {
        let s = &config.scheduler;
        Self {
            tick_interval: Duration::from_millis(s.tick_interval_ms),
            batch_size: s.batch_size,
            max_concurrency: s.max_concurrency.max(1),
            lease_duration: Duration::from_secs(s.lease_duration_secs),
            error_backoff_max: Duration::from_secs(s.error_backoff_max_secs),
        }
    }
}

impl SchedulerConfig {
    /// Delay after the `failures`-th consecutive failed tick: the tick
    /// interval doubled per failure, capped.
    pub fn error_backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(16);
        self.tick_interval
            .checked_mul(factor)
            .unwrap_or(self.error_backoff_max)
            .min(self.error_backoff_max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Everything one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub reclaimed: u64,
    pub claimed: usize,
    #[serde(skip)]
    pub executions: Vec<ExecutionReport>,
    /// Executions whose finalize hit a storage error.
    pub finalize_errors: usize,
    pub sweeps: Vec<SweepReport>,
    pub sweep_failures: usize,
}

impl TickReport {
    fn count_status(&self, status: TaskStatus) -> usize {
        self.executions
            .iter()
            .filter(|r| r.final_status == Some(status))
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count_status(TaskStatus::Succeeded)
    }

    pub fn retried(&self) -> usize {
        self.count_status(TaskStatus::FailedRetryable)
    }

    pub fn dead(&self) -> usize {
        self.count_status(TaskStatus::Dead)
    }

    pub fn is_idle(&self) -> bool {
        self.reclaimed == 0 && self.claimed == 0 && self.sweeps.iter().all(|s| s.applied == 0)
    }
}

/// How [`Scheduler::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// `stop` was requested through the process state.
    StopRequested,
    /// Local shutdown signal (Ctrl-C).
    Shutdown,
    /// Another process took over; state was left untouched.
    Lost,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    executor: Arc<Executor>,
    sweeps: Vec<Arc<dyn Sweep>>,
    sweep_ctx: SweepContext,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<Executor>,
        sweeps: Vec<Arc<dyn Sweep>>,
        sweep_ctx: SweepContext,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            sweeps,
            sweep_ctx,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One pass. Only a store failure on reclaim/claim fails the tick;
    /// task and sweep failures are isolated and counted.
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let now = self.sweep_ctx.clock.now();
        let mut report = TickReport {
            reclaimed: self.store.reclaim_expired_leases(now).await?,
            ..TickReport::default()
        };
        if report.reclaimed > 0 {
            info!(reclaimed = report.reclaimed, "reclaimed expired leases");
        }

        // Claim no more than can run at once, so no lease waits on a permit.
        let round_size = self.config.max_concurrency.max(1);
        while report.claimed < self.config.batch_size {
            let want = round_size.min(self.config.batch_size - report.claimed);
            let tasks = self
                .store
                .claim_eligible(
                    self.executor.worker_id(),
                    want,
                    self.sweep_ctx.clock.now(),
                    self.config.lease_duration,
                )
                .await?;
            let claimed = tasks.len();
            report.claimed += claimed;

            let mut running = JoinSet::new();
            for task in tasks {
                let executor = self.executor.clone();
                running.spawn(async move { executor.run(task).await });
            }
            while let Some(joined) = running.join_next().await {
                match joined {
                    Ok(Ok(execution)) => report.executions.push(execution),
                    Ok(Err(e)) => {
                        warn!(error = %e, "failed to finalize task; lease expiry will recover it");
                        report.finalize_errors += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "task execution join failed");
                        report.finalize_errors += 1;
                    }
                }
            }

            if claimed < want {
                break;
            }
        }

        for sweep in &self.sweeps {
            match sweep.run(&self.sweep_ctx).await {
                Ok(sweep_report) => report.sweeps.push(sweep_report),
                Err(e) => {
                    warn!(sweep = sweep.name(), error = %e, "sweep pass failed");
                    report.sweep_failures += 1;
                }
            }
        }

        if report.is_idle() {
            debug!("tick found nothing to do");
        } else {
            info!(
                reclaimed = report.reclaimed,
                claimed = report.claimed,
                succeeded = report.succeeded(),
                retried = report.retried(),
                dead = report.dead(),
                sweep_failures = report.sweep_failures,
                "tick finished"
            );
        }
        Ok(report)
    }

    /// `start --once`: same precondition as `start`, one tick, and the
    /// process state is never marked running.
    pub async fn run_once(
        &self,
        control: &ProcessControl,
        force: bool,
    ) -> Result<TickReport, SchedulerError> {
        control.check_can_run_once(force).await?;
        self.tick().await
    }

    /// Tick until a stop is requested, `shutdown` fires, or ownership is
    /// lost. `control` must already have been started.
    pub async fn run(
        &self,
        control: &ProcessControl,
        shutdown: Arc<Notify>,
    ) -> Result<RunExit, SchedulerError> {
        info!(
            owner = control.owner(),
            tick_ms = self.config.tick_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "scheduler loop started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut consecutive_failures = 0u32;

        let exit = loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("shutdown signal received; finishing");
                    break RunExit::Shutdown;
                }
                _ = interval.tick() => {
                    let result = match control.heartbeat().await {
                        Ok(Ownership::Owned) => self.tick().await.map(|_| ()),
                        Ok(Ownership::StopRequested) => {
                            info!("stop requested; finishing");
                            break RunExit::StopRequested;
                        }
                        Ok(Ownership::Lost) => {
                            warn!(owner = control.owner(), "process ownership lost; exiting without touching state");
                            return Ok(RunExit::Lost);
                        }
                        Err(e) => Err(SchedulerError::from(e)),
                    };

                    match result {
                        Ok(()) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            let backoff = self.config.error_backoff(consecutive_failures);
                            error!(
                                error = %e,
                                consecutive_failures,
                                backoff_ms = backoff.as_millis() as u64,
                                "tick failed; backing off"
                            );
                            tokio::select! {
                                _ = shutdown.notified() => break RunExit::Shutdown,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
        };

        control.finish().await?;
        Ok(exit)
    }
}

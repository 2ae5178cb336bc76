//! Single-active-instance process control.
//!
//! The process-wide "is autopilot running" flag is an explicit persisted
//! record. Every transition is a compare-and-swap against the stored phase,
//! so two processes racing to `start` cannot both win.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{info, instrument, warn};

use autopilot_core::Clock;

use crate::pg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ProcessPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessPhase::Stopped => "stopped",
            ProcessPhase::Starting => "starting",
            ProcessPhase::Running => "running",
            ProcessPhase::Stopping => "stopping",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, ProcessPhase::Stopped)
    }
}

impl core::str::FromStr for ProcessPhase {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ProcessPhase::Stopped),
            "starting" => Ok(ProcessPhase::Starting),
            "running" => Ok(ProcessPhase::Running),
            "stopping" => Ok(ProcessPhase::Stopping),
            other => Err(ProcessError::Store(format!("unknown process phase: {other}"))),
        }
    }
}

/// The persisted singleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessState {
    pub phase: ProcessPhase,
    pub owner: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessState {
    pub fn stopped(now: DateTime<Utc>) -> Self {
        Self {
            phase: ProcessPhase::Stopped,
            owner: None,
            pid: None,
            started_at: None,
            heartbeat_at: None,
            updated_at: now,
        }
    }

    pub fn running(&self) -> bool {
        self.phase.is_active()
    }

    fn owned_by(&self, owner: &str) -> bool {
        self.owner.as_deref() == Some(owner)
    }
}

/// What a running scheduler learns from its heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    StopRequested,
    /// Another process took over (forced restart) or the state was reset.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("autopilot is already running (owner: {})", owner.as_deref().unwrap_or("unknown"))]
    AlreadyActive { owner: Option<String> },
    #[error("autopilot is not running")]
    NotActive,
    #[error("process state store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait ProcessStateStore: Send + Sync {
    async fn load(&self) -> Result<ProcessState, ProcessError>;

    /// `stopped -> starting` (any phase with `force`).
    async fn try_begin(
        &self,
        owner: &str,
        pid: u32,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<ProcessState, ProcessError>;

    /// `starting -> running` while still owned.
    async fn mark_running(&self, owner: &str, now: DateTime<Utc>) -> Result<bool, ProcessError>;

    async fn heartbeat(&self, owner: &str, now: DateTime<Utc>) -> Result<Ownership, ProcessError>;

    /// `starting|running -> stopping`.
    async fn request_stop(&self, now: DateTime<Utc>) -> Result<ProcessState, ProcessError>;

    /// `* -> stopped` while still owned.
    async fn mark_stopped(&self, owner: &str, now: DateTime<Utc>) -> Result<bool, ProcessError>;

    /// Reset after the stop grace period, only if the row still belongs to
    /// `expected_owner` and is not already stopped.
    async fn force_stopped(
        &self,
        expected_owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ProcessError>;
}

/// Process state for single-process deployments and tests.
#[derive(Debug)]
pub struct InMemoryProcessStateStore {
    state: Mutex<ProcessState>,
}

impl InMemoryProcessStateStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::stopped(Utc::now())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ProcessState>, ProcessError> {
        self.state
            .lock()
            .map_err(|_| ProcessError::Store("process state lock poisoned".to_string()))
    }
}

impl Default for InMemoryProcessStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStateStore for InMemoryProcessStateStore {
    async fn load(&self) -> Result<ProcessState, ProcessError> {
        Ok(self.lock()?.clone())
    }

    async fn try_begin(
        &self,
        owner: &str,
        pid: u32,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<ProcessState, ProcessError> {
        let mut state = self.lock()?;
        if state.running() && !force {
            return Err(ProcessError::AlreadyActive {
                owner: state.owner.clone(),
            });
        }
        *state = ProcessState {
            phase: ProcessPhase::Starting,
            owner: Some(owner.to_string()),
            pid: Some(pid),
            started_at: Some(now),
            heartbeat_at: Some(now),
            updated_at: now,
        };
        Ok(state.clone())
    }

    async fn mark_running(&self, owner: &str, now: DateTime<Utc>) -> Result<bool, ProcessError> {
        let mut state = self.lock()?;
        if state.phase != ProcessPhase::Starting || !state.owned_by(owner) {
            return Ok(false);
        }
        state.phase = ProcessPhase::Running;
        state.heartbeat_at = Some(now);
        state.updated_at = now;
        Ok(true)
    }

    async fn heartbeat(&self, owner: &str, now: DateTime<Utc>) -> Result<Ownership, ProcessError> {
        let mut state = self.lock()?;
        if !state.running() || !state.owned_by(owner) {
            return Ok(Ownership::Lost);
        }
        state.heartbeat_at = Some(now);
        Ok(match state.phase {
            ProcessPhase::Stopping => Ownership::StopRequested,
            _ => Ownership::Owned,
        })
    }

    async fn request_stop(&self, now: DateTime<Utc>) -> Result<ProcessState, ProcessError> {
        let mut state = self.lock()?;
        match state.phase {
            ProcessPhase::Starting | ProcessPhase::Running => {
                state.phase = ProcessPhase::Stopping;
                state.updated_at = now;
                Ok(state.clone())
            }
            ProcessPhase::Stopping => Ok(state.clone()),
            ProcessPhase::Stopped => Err(ProcessError::NotActive),
        }
    }

    async fn mark_stopped(&self, owner: &str, now: DateTime<Utc>) -> Result<bool, ProcessError> {
        let mut state = self.lock()?;
        if !state.running() || !state.owned_by(owner) {
            return Ok(false);
        }
        *state = ProcessState::stopped(now);
        Ok(true)
    }

    async fn force_stopped(
        &self,
        expected_owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ProcessError> {
        let mut state = self.lock()?;
        if state.phase == ProcessPhase::Stopped || state.owner.as_deref() != expected_owner {
            return Ok(false);
        }
        *state = ProcessState::stopped(now);
        Ok(true)
    }
}

/// The singleton row in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresProcessStateStore {
    pool: Arc<PgPool>,
}

impl PostgresProcessStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ProcessError> {
        pg::apply_schema(&self.pool, "process schema", pg::PROCESS_SCHEMA)
            .await
            .map_err(ProcessError::Store)
    }
}

fn map_err(operation: &str, err: sqlx::Error) -> ProcessError {
    ProcessError::Store(pg::map_sqlx_error(operation, err).into_message())
}

const STATE_COLUMNS: &str = "phase, owner, pid, started_at, heartbeat_at, updated_at";

fn state_from_row(row: &PgRow) -> Result<ProcessState, ProcessError> {
    let decode = |e: sqlx::Error| map_err("decode process state", e);
    let phase: String = row.try_get("phase").map_err(decode)?;
    let pid: Option<i32> = row.try_get("pid").map_err(decode)?;
    Ok(ProcessState {
        phase: phase.parse()?,
        owner: row.try_get("owner").map_err(decode)?,
        pid: pid.and_then(|p| u32::try_from(p).ok()),
        started_at: row.try_get("started_at").map_err(decode)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl ProcessStateStore for PostgresProcessStateStore {
    #[instrument(skip(self), err)]
    async fn load(&self) -> Result<ProcessState, ProcessError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM autopilot_process_state WHERE id = 1"
        ))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("load", e))?;
        match row {
            Some(row) => state_from_row(&row),
            None => Ok(ProcessState::stopped(Utc::now())),
        }
    }

    #[instrument(skip(self), err)]
    async fn try_begin(
        &self,
        owner: &str,
        pid: u32,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<ProcessState, ProcessError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE autopilot_process_state SET
                phase = 'starting',
                owner = $1,
                pid = $2,
                started_at = $3,
                heartbeat_at = $3,
                updated_at = $3
            WHERE id = 1 AND ($4 OR phase = 'stopped')
            RETURNING {STATE_COLUMNS}
            "#
        ))
        .bind(owner)
        .bind(i32::try_from(pid).unwrap_or(i32::MAX))
        .bind(now)
        .bind(force)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("try_begin", e))?;

        match row {
            Some(row) => state_from_row(&row),
            None => Err(ProcessError::AlreadyActive {
                owner: self.load().await?.owner,
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn mark_running(&self, owner: &str, now: DateTime<Utc>) -> Result<bool, ProcessError> {
        let result = sqlx::query(
            r#"
            UPDATE autopilot_process_state SET phase = 'running', heartbeat_at = $2, updated_at = $2
            WHERE id = 1 AND phase = 'starting' AND owner = $1
            "#,
        )
        .bind(owner)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("mark_running", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn heartbeat(&self, owner: &str, now: DateTime<Utc>) -> Result<Ownership, ProcessError> {
        let row = sqlx::query(
            r#"
            UPDATE autopilot_process_state SET heartbeat_at = $2
            WHERE id = 1 AND phase <> 'stopped' AND owner = $1
            RETURNING phase
            "#,
        )
        .bind(owner)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("heartbeat", e))?;

        let Some(row) = row else {
            return Ok(Ownership::Lost);
        };
        let phase: String = row.try_get("phase").map_err(|e| map_err("heartbeat", e))?;
        Ok(match phase.parse::<ProcessPhase>()? {
            ProcessPhase::Stopping => Ownership::StopRequested,
            _ => Ownership::Owned,
        })
    }

    #[instrument(skip(self), err)]
    async fn request_stop(&self, now: DateTime<Utc>) -> Result<ProcessState, ProcessError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE autopilot_process_state SET
                phase = CASE WHEN phase = 'stopping' THEN phase ELSE 'stopping' END,
                updated_at = $1
            WHERE id = 1 AND phase <> 'stopped'
            RETURNING {STATE_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_err("request_stop", e))?;
        match row {
            Some(row) => state_from_row(&row),
            None => Err(ProcessError::NotActive),
        }
    }

    #[instrument(skip(self), err)]
    async fn mark_stopped(&self, owner: &str, now: DateTime<Utc>) -> Result<bool, ProcessError> {
        let result = sqlx::query(
            r#"
            UPDATE autopilot_process_state SET
                phase = 'stopped', owner = NULL, pid = NULL,
                started_at = NULL, heartbeat_at = NULL, updated_at = $2
            WHERE id = 1 AND phase <> 'stopped' AND owner = $1
            "#,
        )
        .bind(owner)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("mark_stopped", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn force_stopped(
        &self,
        expected_owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ProcessError> {
        let result = sqlx::query(
            r#"
            UPDATE autopilot_process_state SET
                phase = 'stopped', owner = NULL, pid = NULL,
                started_at = NULL, heartbeat_at = NULL, updated_at = $2
            WHERE id = 1 AND phase <> 'stopped' AND owner IS NOT DISTINCT FROM $1
            "#,
        )
        .bind(expected_owner)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_err("force_stopped", e))?;
        Ok(result.rows_affected() == 1)
    }
}

/// How `stop` concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The running process acknowledged and wrote `stopped`.
    Graceful,
    /// The grace period ran out and the state was reset; in-flight tasks
    /// are left to lease expiry.
    Forced,
    /// Another instance took the singleton over while we waited; its state
    /// was left alone.
    Superseded { owner: Option<String> },
}

/// start/stop/status on top of a [`ProcessStateStore`].
pub struct ProcessControl {
    store: Arc<dyn ProcessStateStore>,
    owner: String,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl ProcessControl {
    pub fn new(store: Arc<dyn ProcessStateStore>, owner: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            owner: owner.into(),
            clock,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn status(&self) -> Result<ProcessState, ProcessError> {
        self.store.load().await
    }

    /// Claim the singleton for a long-running loop and move it to `running`.
    pub async fn start(&self, force: bool) -> Result<ProcessState, ProcessError> {
        let now = self.clock.now();
        let previous = self.store.load().await?;
        let state = self
            .store
            .try_begin(&self.owner, std::process::id(), force, now)
            .await?;
        if force && previous.running() {
            warn!(
                previous_owner = previous.owner.as_deref().unwrap_or("unknown"),
                owner = %self.owner,
                "forced restart; previous instance will lose ownership"
            );
        }
        if !self.store.mark_running(&self.owner, now).await? {
            return Err(ProcessError::AlreadyActive { owner: state.owner });
        }
        info!(owner = %self.owner, "autopilot started");
        self.store.load().await
    }

    /// Precondition for `start --once`: never persists `running`.
    pub async fn check_can_run_once(&self, force: bool) -> Result<(), ProcessError> {
        let state = self.store.load().await?;
        if state.running() && !force {
            return Err(ProcessError::AlreadyActive { owner: state.owner });
        }
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<Ownership, ProcessError> {
        self.store.heartbeat(&self.owner, self.clock.now()).await
    }

    /// Release the singleton from inside the running loop.
    pub async fn finish(&self) -> Result<bool, ProcessError> {
        let released = self.store.mark_stopped(&self.owner, self.clock.now()).await?;
        if released {
            info!(owner = %self.owner, "autopilot stopped");
        }
        Ok(released)
    }

    /// Ask the running instance to stop and wait up to `grace` for it.
    pub async fn stop(&self, grace: Duration) -> Result<StopOutcome, ProcessError> {
        let requested = self.store.request_stop(self.clock.now()).await?;
        info!(
            owner = requested.owner.as_deref().unwrap_or("unknown"),
            "stop requested"
        );

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let state = self.store.load().await?;
            if !state.running() {
                return Ok(StopOutcome::Graceful);
            }
            if state.owner != requested.owner {
                return Ok(superseded(state.owner));
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        warn!(grace_secs = grace.as_secs(), "stop grace period elapsed; forcing stopped state");
        let expected = requested.owner.as_deref();
        if self.store.force_stopped(expected, self.clock.now()).await? {
            return Ok(StopOutcome::Forced);
        }
        let state = self.store.load().await?;
        if state.running() {
            Ok(superseded(state.owner))
        } else {
            Ok(StopOutcome::Graceful)
        }
    }
}

fn superseded(owner: Option<String>) -> StopOutcome {
    info!(
        owner = owner.as_deref().unwrap_or("unknown"),
        "instance taken over during stop; leaving it running"
    );
    StopOutcome::Superseded { owner }
}

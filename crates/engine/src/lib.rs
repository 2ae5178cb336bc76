//! `autopilot-engine`: deferred, retryable, time-triggered execution.
//!
//! ## Components
//!
//! - [`tasks`]: the named-task queue (store, registry, executor, handlers)
//! - [`sweeps`]: periodic discover/transition/apply passes over CMS rows
//! - [`scheduler`]: the tick loop driving both
//! - [`process`]: persisted single-active-instance start/stop/status
//! - [`repo`]: storage ports for the CMS rows (in-memory and PostgreSQL)
//! - [`app`]: wiring everything from an [`AutopilotConfig`]

pub mod app;
pub mod config;
pub mod export_writer;
pub mod notify;
pub(crate) mod pg;
pub mod process;
pub mod repo;
pub mod scheduler;
pub mod sweeps;
pub mod tasks;

#[cfg(test)]
mod integration_tests;

pub use app::{AppError, Autopilot};
pub use config::{AutopilotConfig, ConfigError};
pub use process::{
    InMemoryProcessStateStore, Ownership, PostgresProcessStateStore, ProcessControl,
    ProcessError, ProcessPhase, ProcessState, ProcessStateStore, StopOutcome,
};
pub use scheduler::{RunExit, Scheduler, SchedulerConfig, SchedulerError, TickReport};
pub use sweeps::{Sweep, SweepContext, SweepReport, SweepSet};

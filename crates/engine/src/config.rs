//! Runtime configuration: optional TOML file, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use autopilot_cms::RetentionPolicy;
use autopilot_observability::LogFormat;

use crate::sweeps::RetentionSettings;
use crate::tasks::RetryPolicy;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("database_url is not configured (set DATABASE_URL or database_url in the config file)")]
    MissingDatabaseUrl,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub database_url: Option<String>,
    pub worker_id: Option<String>,
    pub log_format: LogFormat,
    pub scheduler: SchedulerSection,
    pub retry: RetrySection,
    pub sweeps: SweepsSection,
    pub exports: ExportsSection,
    pub notifications: NotificationsSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_ms: u64,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub task_timeout_secs: u64,
    pub lease_duration_secs: u64,
    pub stop_grace_secs: u64,
    pub error_backoff_max_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            batch_size: 10,
            max_concurrency: 4,
            task_timeout_secs: 60,
            lease_duration_secs: 300,
            stop_grace_secs: 30,
            error_backoff_max_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub default_max_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter: 0.2,
            default_max_attempts: crate::tasks::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SweepsSection {
    pub autosave_retention_days: Option<u32>,
    pub export_retention_days: Option<u32>,
    pub task_retention_days: Option<u32>,
    pub batch_limit: usize,
}

impl Default for SweepsSection {
    fn default() -> Self {
        Self {
            autosave_retention_days: None,
            export_retention_days: None,
            task_retention_days: None,
            batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExportsSection {
    pub output_dir: PathBuf,
}

impl Default for ExportsSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("storage/exports"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotificationsSection {
    pub admin_recipient: Option<String>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_id: None,
            log_format: LogFormat::default(),
            scheduler: SchedulerSection::default(),
            retry: RetrySection::default(),
            sweeps: SweepsSection::default(),
            exports: ExportsSection::default(),
            notifications: NotificationsSection::default(),
        }
    }
}

impl AutopilotConfig {
    /// File (if given) + process environment, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents).map_err(|reason| ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(id) = lookup("AUTOPILOT_WORKER_ID").filter(|v| !v.trim().is_empty()) {
            self.worker_id = Some(id);
        }

        let retention = [
            ("AUTOPILOT_EXPORT_RETENTION_DAYS", &mut self.sweeps.export_retention_days),
            ("AUTOPILOT_AUTOSAVE_RETENTION_DAYS", &mut self.sweeps.autosave_retention_days),
            ("AUTOPILOT_TASK_RETENTION_DAYS", &mut self.sweeps.task_retention_days),
        ];
        for (key, slot) in retention {
            if let Some(raw) = lookup(key) {
                *slot = parse_retention(key, &raw)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.tick_interval_ms must be > 0".into()));
        }
        if s.batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be > 0".into()));
        }
        if s.max_concurrency == 0 {
            return Err(ConfigError::Invalid("scheduler.max_concurrency must be > 0".into()));
        }
        if s.lease_duration_secs <= s.task_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "scheduler.lease_duration_secs ({}) must exceed task_timeout_secs ({})",
                s.lease_duration_secs, s.task_timeout_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.default_max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.default_max_attempts must be >= 1".into()));
        }
        if self.sweeps.batch_limit == 0 {
            return Err(ConfigError::Invalid("sweeps.batch_limit must be > 0".into()));
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    /// Configured id, or `<host>-<pid>`.
    pub fn worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "autopilot".to_string());
            format!("{host}-{}", std::process::id())
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.jitter,
        )
    }

    pub fn retention(&self) -> RetentionSettings {
        RetentionSettings {
            autosaves: RetentionPolicy(self.sweeps.autosave_retention_days),
            analytics_exports: RetentionPolicy(self.sweeps.export_retention_days),
            tasks: RetentionPolicy(self.sweeps.task_retention_days),
        }
    }
}

/// `null`, `none` and the empty string disable retention.
fn parse_retention(key: &'static str, raw: &str) -> Result<Option<u32>, ConfigError> {
    let value = raw.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("null") || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    value.parse::<u32>().map(Some).map_err(|_| ConfigError::Env {
        key,
        value: raw.to_string(),
    })
}

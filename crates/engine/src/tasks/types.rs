//! Core task types and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use autopilot_core::{Entity, TaskId};

/// Attempt ceiling used when the caller does not pick one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Queue status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for `available_at`
    Pending,
    /// Claimed by a worker
    Leased,
    /// Completed successfully
    Succeeded,
    /// Failed, waiting out its backoff before the next claim
    FailedRetryable,
    /// Exhausted retries or failed permanently
    Dead,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Leased,
        TaskStatus::Succeeded,
        TaskStatus::FailedRetryable,
        TaskStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Leased => "leased",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::FailedRetryable => "failed_retryable",
            TaskStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Dead)
    }

    /// Statuses `claim_eligible` picks up once `available_at` has passed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::FailedRetryable)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// A named, retryable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Key into the handler registry
    pub name: String,
    /// Passed verbatim to the handler
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Never claimed before this instant
    pub available_at: DateTime<Utc>,
    /// Attempts started so far (counted when the lease is granted)
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Task {
    type Id = TaskId;

    fn id(&self) -> TaskId {
        self.id
    }
}

impl Task {
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.available_at <= now && self.attempts < self.max_attempts
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.status == TaskStatus::Leased && self.lease_owner.as_deref() == Some(owner)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Payload field lookup for handlers.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Request to enqueue a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub payload: serde_json::Value,
    /// `None` means "as soon as possible"
    pub available_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl NewTask {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            available_at: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Reject malformed requests before anything is stored.
    ///
    /// A `null` payload is normalised to `{}`.
    pub fn validate(mut self) -> Result<Self, String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("task name must not be empty".to_string());
        }
        self.name = name.to_string();
        if self.payload.is_null() {
            self.payload = serde_json::Value::Object(Default::default());
        }
        if !self.payload.is_object() {
            return Err(format!(
                "task payload must be a JSON object, got {}",
                json_kind(&self.payload)
            ));
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(self)
    }

    /// Materialise the stored row.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: TaskId::new(),
            name: self.name,
            payload: self.payload,
            status: TaskStatus::Pending,
            available_at: self.available_at.unwrap_or(now),
            attempts: 0,
            max_attempts: self.max_attempts,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap (applied before and after jitter)
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0): the delay is scaled by a uniform factor in
    /// `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay after `attempts` failed attempts (1-indexed).
    ///
    /// `base * 2^(attempts-1)`, capped at `max_delay`; zero for `attempts == 0`.
    pub fn base_delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exp = 2_f64.powi(attempts.saturating_sub(1).min(62) as i32);
        let delay_ms = (self.base_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        self.delay_for_attempt_with(attempts, &mut rand::thread_rng())
    }

    /// Jittered delay with an explicit RNG.
    pub fn delay_for_attempt_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for_attempt(attempts);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if base.is_zero() || jitter == 0.0 {
            return base;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.max_delay)
    }
}

/// `std` to `chrono` duration, saturating at a century.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

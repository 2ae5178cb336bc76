//! Scheduled analytics exports and the files they produce.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use autopilot_core::{DomainError, Entity, ExportId, UserId};

/// How often a scheduled export runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFrequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl ExportFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFrequency::Hourly => "hourly",
            ExportFrequency::Daily => "daily",
            ExportFrequency::Weekly => "weekly",
            ExportFrequency::Monthly => "monthly",
        }
    }

    /// The instant one period after `from`.
    ///
    /// Monthly periods are calendar months (Jan 31 + 1 month = Feb 28/29).
    pub fn after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ExportFrequency::Hourly => from + Duration::hours(1),
            ExportFrequency::Daily => from + Duration::days(1),
            ExportFrequency::Weekly => from + Duration::weeks(1),
            ExportFrequency::Monthly => from
                .checked_add_months(Months::new(1))
                .unwrap_or(from + Duration::days(30)),
        }
    }
}

impl core::fmt::Display for ExportFrequency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ExportFrequency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(ExportFrequency::Hourly),
            "daily" => Ok(ExportFrequency::Daily),
            "weekly" => Ok(ExportFrequency::Weekly),
            "monthly" => Ok(ExportFrequency::Monthly),
            other => Err(DomainError::validation(format!(
                "unknown export frequency: {other}"
            ))),
        }
    }
}

/// A recurring export definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledExport {
    pub id: ExportId,
    pub name: String,
    pub owner_id: UserId,
    pub frequency: ExportFrequency,
    pub format: String,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Entity for ScheduledExport {
    type Id = ExportId;

    fn id(&self) -> ExportId {
        self.id
    }
}

impl ScheduledExport {
    pub fn new(
        name: impl Into<String>,
        owner_id: UserId,
        frequency: ExportFrequency,
        format: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExportId::new(),
            name: name.into(),
            owner_id,
            frequency,
            format: format.into(),
            active: true,
            last_run_at: None,
            created_at: now,
        }
    }

    /// When the next run becomes due. A never-run export is due immediately.
    pub fn next_due_at(&self) -> DateTime<Utc> {
        match self.last_run_at {
            Some(last) => self.frequency.after(last),
            None => self.created_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_due_at() <= now
    }
}

/// A generated export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsExport {
    pub id: ExportId,
    pub scheduled_export_id: Option<ExportId>,
    pub file_path: String,
    pub format: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for AnalyticsExport {
    type Id = ExportId;

    fn id(&self) -> ExportId {
        self.id
    }
}

impl AnalyticsExport {
    /// Retention trigger: created strictly before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_at < cutoff
    }
}

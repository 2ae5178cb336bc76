//! Recurring publish schedules.
//!
//! Rules use a small iCalendar RRULE subset:
//! `FREQ=HOURLY|DAILY|WEEKLY|MONTHLY[;INTERVAL=n][;BYDAY=MO,WE,..][;COUNT=n]`.
//! `BYDAY` is only meaningful for `DAILY` and `WEEKLY`.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use autopilot_core::{ContentId, DomainError, DomainResult, Entity, ScheduleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    fn as_rrule(&self) -> &'static str {
        match self {
            Frequency::Hourly => "HOURLY",
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
        }
    }
}

/// Parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    pub by_day: Vec<Weekday>,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            count: None,
            by_day: Vec::new(),
        }
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval = interval.max(1);
        self
    }

    pub fn times(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn on(mut self, days: &[Weekday]) -> Self {
        self.by_day = days.to_vec();
        self
    }

    /// First occurrence strictly after `after`, for a series anchored at
    /// `anchor` (the anchor is itself an occurrence when its weekday matches).
    ///
    /// Missed occurrences between the anchor and `after` are skipped, never
    /// returned.
    pub fn next_after(&self, anchor: DateTime<Utc>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.by_day.is_empty() {
            return self.next_by_day(anchor, after);
        }
        if after < anchor {
            return Some(anchor);
        }

        // `None` once the series runs past the representable range.
        let interval = i64::from(self.interval.max(1));
        let step = match self.frequency {
            Frequency::Hourly => Duration::try_hours(interval)?,
            Frequency::Daily => Duration::try_days(interval)?,
            Frequency::Weekly => Duration::try_weeks(interval)?,
            Frequency::Monthly => return self.next_monthly(anchor, after),
        };

        let elapsed = (after - anchor).num_seconds();
        let periods = i32::try_from(elapsed / step.num_seconds() + 1).ok()?;
        let mut next = anchor.checked_add_signed(step.checked_mul(periods)?)?;
        // Sub-second anchors can land exactly on `after`.
        while next <= after {
            next = next.checked_add_signed(step)?;
        }
        Some(next)
    }

    fn next_monthly(&self, anchor: DateTime<Utc>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = self.interval.max(1);
        let months_between = (after.year() - anchor.year()) * 12 + after.month() as i32
            - anchor.month() as i32;
        let mut k = (months_between.max(0) as u32 / interval).saturating_sub(1);
        // Always adds from the anchor so day-of-month clamping never drifts.
        loop {
            let occurrence = anchor.checked_add_months(Months::new(k.checked_mul(interval)?))?;
            if occurrence > after {
                return Some(occurrence);
            }
            k += 1;
        }
    }

    fn next_by_day(&self, anchor: DateTime<Utc>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = i64::from(self.interval.max(1));
        let time = anchor.time();
        let anchor_date = anchor.date_naive();
        let anchor_week = week_start(anchor_date);
        let mut date = if after < anchor {
            anchor_date
        } else {
            after.date_naive()
        };

        // Two full cycles always contain a matching day when `by_day` is non-empty.
        let horizon = 14 * interval + 14;
        for _ in 0..horizon {
            let candidate = Utc.from_utc_datetime(&date.and_time(time));
            if candidate >= anchor && candidate > after && self.by_day.contains(&date.weekday()) {
                let in_period = match self.frequency {
                    Frequency::Weekly => {
                        ((week_start(date) - anchor_week).num_days() / 7) % interval == 0
                    }
                    _ => (date - anchor_date).num_days() % interval == 0,
                };
                if in_period {
                    return Some(candidate);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn parse_weekday(s: &str) -> DomainResult<Weekday> {
    match s {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(DomainError::validation(format!("unknown BYDAY value: {other}"))),
    }
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

fn parse_positive(key: &str, value: &str) -> DomainResult<u32> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(DomainError::validation(format!(
            "{key} must be a positive integer, got {value:?}"
        ))),
    }
}

impl core::str::FromStr for RecurrenceRule {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim();
        let body = body.strip_prefix("RRULE:").unwrap_or(body);

        let mut frequency = None;
        let mut interval = 1;
        let mut count = None;
        let mut by_day = Vec::new();

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| DomainError::validation(format!("malformed rule part: {part:?}")))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim().to_ascii_uppercase();
            match key.as_str() {
                "FREQ" => {
                    frequency = Some(match value.as_str() {
                        "HOURLY" => Frequency::Hourly,
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        "MONTHLY" => Frequency::Monthly,
                        other => {
                            return Err(DomainError::validation(format!(
                                "unsupported FREQ: {other}"
                            )));
                        }
                    })
                }
                "INTERVAL" => interval = parse_positive("INTERVAL", &value)?,
                "COUNT" => count = Some(parse_positive("COUNT", &value)?),
                "BYDAY" => {
                    by_day = value
                        .split(',')
                        .map(|d| parse_weekday(d.trim()))
                        .collect::<DomainResult<Vec<_>>>()?;
                }
                other => {
                    return Err(DomainError::validation(format!(
                        "unsupported rule part: {other}"
                    )));
                }
            }
        }

        let frequency =
            frequency.ok_or_else(|| DomainError::validation("recurrence rule requires FREQ"))?;
        if !by_day.is_empty() && !matches!(frequency, Frequency::Daily | Frequency::Weekly) {
            return Err(DomainError::validation(
                "BYDAY is only supported with FREQ=DAILY or FREQ=WEEKLY",
            ));
        }

        Ok(Self {
            frequency,
            interval,
            count,
            by_day,
        })
    }
}

impl core::fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FREQ={}", self.frequency.as_rrule())?;
        if self.interval != 1 {
            write!(f, ";INTERVAL={}", self.interval)?;
        }
        if !self.by_day.is_empty() {
            let days: Vec<&str> = self.by_day.iter().map(|d| weekday_code(*d)).collect();
            write!(f, ";BYDAY={}", days.join(","))?;
        }
        if let Some(count) = self.count {
            write!(f, ";COUNT={count}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for RecurrenceRule {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecurrenceRule> for String {
    fn from(rule: RecurrenceRule) -> Self {
        rule.to_string()
    }
}

/// Re-publishes a content item on a recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub id: ScheduleId,
    pub content_id: ContentId,
    pub rule: RecurrenceRule,
    pub starts_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub runs: u32,
    pub active: bool,
}

/// The pure outcome of firing a due schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleAdvance {
    /// The occurrence being fired.
    pub fired_at: DateTime<Utc>,
    /// `None` once the series is exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
    pub runs: u32,
    pub active: bool,
}

impl Entity for RecurringSchedule {
    type Id = ScheduleId;

    fn id(&self) -> ScheduleId {
        self.id
    }
}

impl RecurringSchedule {
    pub fn new(content_id: ContentId, rule: RecurrenceRule, starts_at: DateTime<Utc>) -> Self {
        let first = rule
            .next_after(starts_at, starts_at - Duration::nanoseconds(1))
            .unwrap_or(starts_at);
        Self {
            id: ScheduleId::new(),
            content_id,
            rule,
            starts_at,
            next_run_at: first,
            last_run_at: None,
            runs: 0,
            active: true,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run_at <= now
    }

    /// Decide what firing at `now` does to the series.
    pub fn advance(&self, now: DateTime<Utc>) -> ScheduleAdvance {
        let runs = self.runs.saturating_add(1);
        let exhausted = self.rule.count.is_some_and(|count| runs >= count);
        let next_run_at = if exhausted {
            None
        } else {
            self.rule.next_after(self.starts_at, now.max(self.next_run_at))
        };
        ScheduleAdvance {
            fired_at: self.next_run_at,
            next_run_at,
            runs,
            active: next_run_at.is_some(),
        }
    }

    pub fn apply(&mut self, advance: &ScheduleAdvance, now: DateTime<Utc>) {
        self.runs = advance.runs;
        self.active = advance.active;
        self.last_run_at = Some(now);
        if let Some(next) = advance.next_run_at {
            self.next_run_at = next;
        }
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Age-based retention window. `None` means retention is disabled and
/// nothing is ever deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionPolicy(pub Option<u32>);

impl RetentionPolicy {
    pub fn days(days: u32) -> Self {
        Self(Some(days))
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    /// Rows created before the returned instant are past retention.
    ///
    /// `None` when disabled, and also when the window reaches past the
    /// earliest representable instant: nothing can be old enough then.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = Duration::try_days(i64::from(self.0?))?;
        now.checked_sub_signed(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn disabled_policy_has_no_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(RetentionPolicy::disabled().cutoff(now), None);
        assert_eq!(
            RetentionPolicy::days(7).cutoff(now),
            Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn zero_days_means_everything_older_than_now() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(RetentionPolicy::days(0).cutoff(now), Some(now));
    }

    #[test]
    fn oversized_window_has_no_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let policy = RetentionPolicy::days(u32::MAX);
        assert!(policy.is_enabled());
        assert_eq!(policy.cutoff(now), None);
        assert_eq!(RetentionPolicy::days(100_000_000).cutoff(now), None);
    }
}

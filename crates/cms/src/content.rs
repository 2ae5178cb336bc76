use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use autopilot_core::{ContentId, DomainError, DomainResult, Entity, UserId};

/// Editorial state of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Draft,
    PendingReview,
    Scheduled,
    Published,
    Expired,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Draft => "draft",
            PublishStatus::PendingReview => "pending_review",
            PublishStatus::Scheduled => "scheduled",
            PublishStatus::Published => "published",
            PublishStatus::Expired => "expired",
        }
    }
}

impl core::fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PublishStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PublishStatus::Draft),
            "pending_review" => Ok(PublishStatus::PendingReview),
            "scheduled" => Ok(PublishStatus::Scheduled),
            "published" => Ok(PublishStatus::Published),
            "expired" => Ok(PublishStatus::Expired),
            other => Err(DomainError::validation(format!(
                "unknown publish status: {other}"
            ))),
        }
    }
}

/// A page/post with optional publish and unpublish trigger times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub title: String,
    pub author_id: UserId,
    pub publish_status: PublishStatus,
    pub scheduled_publish_at: Option<DateTime<Utc>>,
    pub scheduled_unpublish_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub unpublished_at: Option<DateTime<Utc>>,
    pub review_requested_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for ContentItem {
    type Id = ContentId;

    fn id(&self) -> ContentId {
        self.id
    }
}

impl ContentItem {
    /// A fresh draft.
    pub fn draft(title: impl Into<String>, author_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: ContentId::new(),
            title: title.into(),
            author_id,
            publish_status: PublishStatus::Draft,
            scheduled_publish_at: None,
            scheduled_unpublish_at: None,
            published_at: None,
            unpublished_at: None,
            review_requested_at: None,
            updated_at: now,
        }
    }

    /// Schedule publication (and optionally expiry).
    ///
    /// Only drafts, items under review and already-scheduled items can be
    /// (re)scheduled; the unpublish time must come after the publish time.
    pub fn schedule(
        &mut self,
        publish_at: DateTime<Utc>,
        unpublish_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !matches!(
            self.publish_status,
            PublishStatus::Draft | PublishStatus::PendingReview | PublishStatus::Scheduled
        ) {
            return Err(DomainError::invalid_transition(format!(
                "cannot schedule content in status {}",
                self.publish_status
            )));
        }
        if let Some(until) = unpublish_at {
            if until <= publish_at {
                return Err(DomainError::validation(
                    "scheduled_unpublish_at must be after scheduled_publish_at",
                ));
            }
        }
        self.publish_status = PublishStatus::Scheduled;
        self.scheduled_publish_at = Some(publish_at);
        self.scheduled_unpublish_at = unpublish_at;
        self.updated_at = now;
        Ok(())
    }

    /// Hand the item to reviewers.
    pub fn submit_for_review(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.publish_status != PublishStatus::Draft {
            return Err(DomainError::invalid_transition(format!(
                "cannot submit content in status {} for review",
                self.publish_status
            )));
        }
        self.publish_status = PublishStatus::PendingReview;
        self.review_requested_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Publish trigger: `scheduled` and the publish time has passed.
    pub fn is_due_for_publish(&self, now: DateTime<Utc>) -> bool {
        self.publish_status == PublishStatus::Scheduled
            && self.scheduled_publish_at.is_some_and(|at| at <= now)
    }

    /// Expire trigger: `published` and the unpublish time has passed.
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.publish_status == PublishStatus::Published
            && self.scheduled_unpublish_at.is_some_and(|at| at <= now)
    }

    /// Review reminder trigger: still under review after `sla`.
    pub fn is_review_overdue(&self, now: DateTime<Utc>, sla: Duration) -> bool {
        self.publish_status == PublishStatus::PendingReview
            && self.review_requested_at.is_some_and(|at| at + sla <= now)
    }

    /// Publish now. Returns `false` when the item is already published.
    pub fn publish(&mut self, now: DateTime<Utc>) -> bool {
        if self.publish_status == PublishStatus::Published {
            return false;
        }
        self.publish_status = PublishStatus::Published;
        self.published_at = Some(now);
        self.unpublished_at = None;
        self.updated_at = now;
        true
    }

    /// Take a published item offline.
    pub fn expire(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.publish_status != PublishStatus::Published {
            return Err(DomainError::invalid_transition(format!(
                "cannot expire content in status {}",
                self.publish_status
            )));
        }
        self.publish_status = PublishStatus::Expired;
        self.unpublished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn scheduled(publish_at: DateTime<Utc>, unpublish_at: Option<DateTime<Utc>>) -> ContentItem {
        let mut item = ContentItem::draft("Launch post", UserId::new(), t0());
        item.schedule(publish_at, unpublish_at, t0()).unwrap();
        item
    }

    #[test]
    fn due_for_publish_only_once_time_has_passed() {
        let item = scheduled(t0() + Duration::hours(1), None);
        assert!(!item.is_due_for_publish(t0()));
        assert!(item.is_due_for_publish(t0() + Duration::hours(1)));
    }

    #[test]
    fn publish_moves_item_out_of_the_publish_predicate() {
        let mut item = scheduled(t0() - Duration::seconds(1), Some(t0() + Duration::days(1)));
        assert!(item.is_due_for_publish(t0()));

        assert!(item.publish(t0()));
        assert_eq!(item.publish_status, PublishStatus::Published);
        assert_eq!(item.published_at, Some(t0()));
        assert!(!item.is_due_for_publish(t0()));
        assert!(!item.is_due_for_expiry(t0()));
        assert!(item.is_due_for_expiry(t0() + Duration::days(1)));
    }

    #[test]
    fn expire_requires_published() {
        let mut item = scheduled(t0(), None);
        assert!(matches!(
            item.expire(t0()),
            Err(DomainError::InvalidTransition(_))
        ));
    }

    #[test]
    fn schedule_rejects_unpublish_before_publish() {
        let mut item = ContentItem::draft("x", UserId::new(), t0());
        let err = item
            .schedule(t0(), Some(t0() - Duration::minutes(5)), t0())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(item.publish_status, PublishStatus::Draft);
    }

    #[test]
    fn review_overdue_after_sla() {
        let mut item = ContentItem::draft("x", UserId::new(), t0());
        item.submit_for_review(t0()).unwrap();
        assert!(!item.is_review_overdue(t0() + Duration::hours(47), Duration::hours(48)));
        assert!(item.is_review_overdue(t0() + Duration::hours(48), Duration::hours(48)));
    }

    #[test]
    fn status_parses_its_own_rendering() {
        for status in [
            PublishStatus::Draft,
            PublishStatus::PendingReview,
            PublishStatus::Scheduled,
            PublishStatus::Published,
            PublishStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<PublishStatus>().unwrap(), status);
        }
        assert!("archived".parse::<PublishStatus>().is_err());
    }

    proptest! {
        /// Property: publishing is idempotent. A second publish at any later
        /// time changes nothing and reports no transition.
        #[test]
        fn publish_twice_is_a_no_op(offset_secs in 0i64..86_400, later_secs in 0i64..86_400) {
            let mut item = scheduled(t0(), None);
            let first = t0() + Duration::seconds(offset_secs);
            prop_assert!(item.publish(first));
            let snapshot = item.clone();

            prop_assert!(!item.publish(first + Duration::seconds(later_secs)));
            prop_assert_eq!(item, snapshot);
        }
    }
}

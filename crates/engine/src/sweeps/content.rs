//! Content publish / expire sweeps.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use autopilot_cms::ContentItem;

use super::{SideEffect, SweepError, SweepItem, SweepJob, Transition};
use crate::notify::Notification;
use crate::repo::ContentRepository;

/// `scheduled` and `scheduled_publish_at <= now` → `published`, author notified.
pub struct ContentPublishSweep {
    repo: Arc<dyn ContentRepository>,
}

impl ContentPublishSweep {
    pub fn new(repo: Arc<dyn ContentRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SweepJob for ContentPublishSweep {
    type Row = ContentItem;
    type State = ();

    fn name(&self) -> &'static str {
        "content_publish"
    }

    async fn discover(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ContentItem>, SweepError> {
        Ok(self.repo.due_for_publish(now, limit).await?)
    }

    fn transition(
        &self,
        row: &ContentItem,
        now: DateTime<Utc>,
    ) -> Result<Transition<()>, SweepError> {
        let notification = Notification::new(
            row.author_id.to_string(),
            "content.published",
            format!("\"{}\" has been published", row.title),
        )
        .with_data(json!({ "content_id": row.id, "published_at": now }));
        Ok(Transition::to(()).with(SideEffect::Notify(notification)))
    }

    async fn apply(&self, row: &ContentItem, _state: &(), now: DateTime<Utc>) -> Result<bool, SweepError> {
        Ok(self.repo.publish_if_due(row.id, now).await?)
    }

    fn describe(&self, row: &ContentItem) -> SweepItem {
        SweepItem::new(row.id, format!("published \"{}\"", row.title))
    }
}

/// `published` and `scheduled_unpublish_at <= now` → `expired`, author notified.
pub struct ContentExpireSweep {
    repo: Arc<dyn ContentRepository>,
}

impl ContentExpireSweep {
    pub fn new(repo: Arc<dyn ContentRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SweepJob for ContentExpireSweep {
    type Row = ContentItem;
    type State = ();

    fn name(&self) -> &'static str {
        "content_expire"
    }

    async fn discover(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ContentItem>, SweepError> {
        Ok(self.repo.due_for_expiry(now, limit).await?)
    }

    fn transition(
        &self,
        row: &ContentItem,
        now: DateTime<Utc>,
    ) -> Result<Transition<()>, SweepError> {
        // Validates the transition; the write itself only touches status columns.
        row.clone().expire(now)?;
        let notification = Notification::new(
            row.author_id.to_string(),
            "content.expired",
            format!("\"{}\" has been unpublished", row.title),
        )
        .with_data(json!({ "content_id": row.id, "unpublished_at": now }));
        Ok(Transition::to(()).with(SideEffect::Notify(notification)))
    }

    async fn apply(&self, row: &ContentItem, _state: &(), now: DateTime<Utc>) -> Result<bool, SweepError> {
        Ok(self.repo.expire_if_due(row.id, now).await?)
    }

    fn describe(&self, row: &ContentItem) -> SweepItem {
        SweepItem::new(row.id, format!("expired \"{}\"", row.title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryCms;
    use autopilot_cms::PublishStatus;
    use crate::sweeps::Sweep;
    use crate::sweeps::test_support::harness;
    use autopilot_core::UserId;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn publish_pass_is_idempotent_and_notifies_once() {
        let cms = InMemoryCms::arc();
        let h = harness(t0());
        let mut item = ContentItem::draft("Spring launch", UserId::new(), t0() - Duration::hours(1));
        item.schedule(t0() - Duration::seconds(1), None, t0() - Duration::hours(1))
            .unwrap();
        cms.insert_content(&item).await.unwrap();
        let sweep = ContentPublishSweep::new(cms.clone());

        let first = Sweep::run(&sweep, &h.ctx).await.unwrap();
        assert_eq!(first.applied, 1);
        let stored = cms.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.publish_status, PublishStatus::Published);
        assert_eq!(stored.published_at, Some(t0()));
        assert_eq!(h.notifier.count("content.published"), 1);

        let second = Sweep::run(&sweep, &h.ctx).await.unwrap();
        assert_eq!(second.discovered, 0);
        assert_eq!(second.applied, 0);
        assert_eq!(h.notifier.count("content.published"), 1);
    }

    #[tokio::test]
    async fn future_publish_time_is_left_alone() {
        let cms = InMemoryCms::arc();
        let h = harness(t0());
        let mut item = ContentItem::draft("Later", UserId::new(), t0());
        item.schedule(t0() + Duration::minutes(5), None, t0()).unwrap();
        cms.insert_content(&item).await.unwrap();

        let report = Sweep::run(&ContentPublishSweep::new(cms.clone()), &h.ctx)
            .await
            .unwrap();
        assert_eq!(report.discovered, 0);
        assert_eq!(
            cms.get_content(item.id).await.unwrap().unwrap().publish_status,
            PublishStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn publish_then_expire_across_passes() {
        let cms = InMemoryCms::arc();
        let h = harness(t0());
        let mut item = ContentItem::draft("Flash sale", UserId::new(), t0());
        item.schedule(t0(), Some(t0() + Duration::hours(2)), t0()).unwrap();
        cms.insert_content(&item).await.unwrap();
        let publish = ContentPublishSweep::new(cms.clone());
        let expire = ContentExpireSweep::new(cms.clone());

        assert_eq!(Sweep::run(&publish, &h.ctx).await.unwrap().applied, 1);
        assert_eq!(Sweep::run(&expire, &h.ctx).await.unwrap().applied, 0);

        h.clock.advance(Duration::hours(2));
        let report = Sweep::run(&expire, &h.ctx).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.items[0].label, "expired \"Flash sale\"");
        let stored = cms.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.publish_status, PublishStatus::Expired);
        assert_eq!(stored.unpublished_at, Some(t0() + Duration::hours(2)));
        assert_eq!(h.notifier.count("content.expired"), 1);
    }

    #[tokio::test]
    async fn edit_after_discovery_is_not_reverted() {
        let cms = InMemoryCms::arc();
        let mut item = ContentItem::draft("Old title", UserId::new(), t0() - Duration::hours(1));
        item.schedule(t0() - Duration::minutes(1), None, t0() - Duration::hours(1))
            .unwrap();
        cms.insert_content(&item).await.unwrap();
        let sweep = ContentPublishSweep::new(cms.clone());

        let rows = sweep.discover(t0(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let transition = sweep.transition(&rows[0], t0()).unwrap();

        // An editor renames and pushes the publish date out before the write.
        cms.update_content_for_test(item.id, |c| {
            c.title = "New title".to_string();
            c.scheduled_publish_at = Some(t0() + Duration::days(7));
        });

        assert!(!sweep.apply(&rows[0], &transition.state, t0()).await.unwrap());
        let stored = cms.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.publish_status, PublishStatus::Scheduled);
        assert_eq!(stored.title, "New title");
        assert_eq!(stored.scheduled_publish_at, Some(t0() + Duration::days(7)));
        assert_eq!(stored.published_at, None);
    }

    #[tokio::test]
    async fn expire_keeps_edits_made_after_discovery() {
        let cms = InMemoryCms::arc();
        let mut item = ContentItem::draft("Notes", UserId::new(), t0() - Duration::hours(2));
        item.schedule(
            t0() - Duration::hours(2),
            Some(t0() - Duration::minutes(1)),
            t0() - Duration::hours(2),
        )
        .unwrap();
        item.publish(t0() - Duration::hours(2));
        cms.insert_content(&item).await.unwrap();
        let sweep = ContentExpireSweep::new(cms.clone());

        let rows = sweep.discover(t0(), 10).await.unwrap();
        let transition = sweep.transition(&rows[0], t0()).unwrap();
        cms.update_content_for_test(item.id, |c| c.title = "Notes (final)".to_string());

        assert!(sweep.apply(&rows[0], &transition.state, t0()).await.unwrap());
        let stored = cms.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.publish_status, PublishStatus::Expired);
        assert_eq!(stored.title, "Notes (final)");
        assert_eq!(stored.unpublished_at, Some(t0()));
    }
}

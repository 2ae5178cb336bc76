use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use autopilot_cms::ContentLock;

use super::{SweepError, SweepItem, SweepJob, Transition};
use crate::repo::LockRepository;

/// Deletes editing locks past `expires_at`. A lock extended after discovery
/// survives because the delete re-checks expiry.
pub struct ExpiredLockSweep {
    repo: Arc<dyn LockRepository>,
}

impl ExpiredLockSweep {
    pub fn new(repo: Arc<dyn LockRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SweepJob for ExpiredLockSweep {
    type Row = ContentLock;
    type State = ();

    fn name(&self) -> &'static str {
        "expired_locks"
    }

    async fn discover(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ContentLock>, SweepError> {
        Ok(self.repo.expired_locks(now, limit).await?)
    }

    fn transition(&self, _row: &ContentLock, _now: DateTime<Utc>) -> Result<Transition<()>, SweepError> {
        Ok(Transition::to(()))
    }

    async fn apply(&self, row: &ContentLock, _state: &(), now: DateTime<Utc>) -> Result<bool, SweepError> {
        Ok(self.repo.delete_expired_lock(row.id, now).await?)
    }

    fn describe(&self, row: &ContentLock) -> SweepItem {
        SweepItem::new(row.id, format!("lock on {} held by {}", row.content_id, row.user_id))
    }
}

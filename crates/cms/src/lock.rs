use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use autopilot_core::{ContentId, Entity, LockId, UserId};

/// An exclusive editing lock on a content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLock {
    pub id: LockId,
    pub content_id: ContentId,
    pub user_id: UserId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Entity for ContentLock {
    type Id = LockId;

    fn id(&self) -> LockId {
        self.id
    }
}

impl ContentLock {
    pub fn acquire(content_id: ContentId, user_id: UserId, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: LockId::new(),
            content_id,
            user_id,
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Push the expiry out by `ttl` from `now`.
    pub fn extend(&mut self, ttl: Duration, now: DateTime<Utc>) {
        self.expires_at = now + ttl;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn extended_lock_is_no_longer_expired() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut lock = ContentLock::acquire(ContentId::new(), UserId::new(), Duration::minutes(15), t0);
        let later = t0 + Duration::minutes(15);
        assert!(lock.is_expired(later));

        lock.extend(Duration::minutes(15), later);
        assert!(!lock.is_expired(later));
    }
}

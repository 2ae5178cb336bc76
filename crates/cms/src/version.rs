use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use autopilot_core::{ContentId, Entity, UserId, VersionId};

/// A saved revision of a content item. Autosaves are never the current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVersion {
    pub id: VersionId,
    pub content_id: ContentId,
    pub version_number: String,
    pub is_autosave: bool,
    pub is_current: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Entity for ContentVersion {
    type Id = VersionId;

    fn id(&self) -> VersionId {
        self.id
    }
}

impl ContentVersion {
    pub fn autosave(content_id: ContentId, created_by: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: VersionId::new(),
            content_id,
            version_number: format!("autosave-{}", now.format("%Y%m%d%H%M%S")),
            is_autosave: true,
            is_current: false,
            created_by,
            created_at: now,
        }
    }

    pub fn manual(
        content_id: ContentId,
        version_number: impl Into<String>,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: VersionId::new(),
            content_id,
            version_number: version_number.into(),
            is_autosave: false,
            is_current: true,
            created_by,
            created_at: now,
        }
    }

    /// Retention trigger: an autosave (never a manual or current version)
    /// created strictly before `cutoff`.
    pub fn is_stale_autosave(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_autosave && !self.is_current && self.created_at < cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn only_old_autosaves_are_stale() {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let content = ContentId::new();
        let user = UserId::new();
        let cutoff = t0 + Duration::days(1);

        let old_autosave = ContentVersion::autosave(content, user, t0);
        let fresh_autosave = ContentVersion::autosave(content, user, cutoff);
        let old_manual = ContentVersion::manual(content, "1.0", user, t0);

        assert!(old_autosave.is_stale_autosave(cutoff));
        assert!(!fresh_autosave.is_stale_autosave(cutoff));
        assert!(!old_manual.is_stale_autosave(cutoff));
    }
}

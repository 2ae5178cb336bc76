//! First-or-create of the built-in maintenance tasks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use autopilot_core::TaskId;

use super::handlers::{CONTENT_APPROVAL_CHECK, DEFAULT_REVIEW_SLA_HOURS, SYSTEM_HEALTH_CHECK};
use super::store::{TaskStore, TaskStoreError};
use super::types::NewTask;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub created: Vec<(String, TaskId)>,
    pub existing: Vec<(String, TaskId)>,
}

fn builtin_tasks() -> Vec<(&'static str, Value)> {
    vec![
        (SYSTEM_HEALTH_CHECK, json!({})),
        (
            CONTENT_APPROVAL_CHECK,
            json!({ "sla_hours": DEFAULT_REVIEW_SLA_HOURS }),
        ),
    ]
}

/// Enqueue each maintenance task unless an active one with the same name
/// and payload already exists.
pub async fn seed_tasks(
    store: &dyn TaskStore,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<SeedReport, TaskStoreError> {
    let mut report = SeedReport::default();
    for (name, payload) in builtin_tasks() {
        if let Some(task) = store.find_active(name, &payload).await? {
            report.existing.push((name.to_string(), task.id));
            continue;
        }
        let task = store
            .enqueue(NewTask::new(name, payload).max_attempts(max_attempts), now)
            .await?;
        info!(task_id = %task.id, name, "seeded task");
        report.created.push((name.to_string(), task.id));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::InMemoryTaskStore;

    #[tokio::test]
    async fn seeding_twice_creates_nothing_new() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();

        let first = seed_tasks(&store, 3, now).await.unwrap();
        assert_eq!(first.created.len(), 2);
        assert!(first.existing.is_empty());

        let second = seed_tasks(&store, 3, now).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 2);
        assert_eq!(store.stats().await.unwrap().pending, 2);
    }
}

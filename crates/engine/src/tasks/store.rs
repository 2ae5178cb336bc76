//! Task storage: the store contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use autopilot_core::TaskId;

use super::types::{NewTask, Task, TaskStatus, chrono_duration};

/// Durable queue of [`Task`] rows.
///
/// `claim_eligible` is the one operation the whole engine's correctness
/// rests on: two concurrent callers must never receive the same row.
/// Finalize operations are owner-checked and return
/// [`TaskStoreError::LeaseConflict`] once the caller no longer holds the lease.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new pending task after validating it.
    async fn enqueue(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, TaskStoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// A non-terminal task with exactly this name and payload, if any.
    async fn find_active(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// Lease up to `limit` claimable tasks to `owner`, oldest-due first
    /// (ties broken by id). Each claim counts as one attempt.
    async fn claim_eligible(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Task>, TaskStoreError>;

    /// Release leases that expired before `now`. A task whose final attempt's
    /// lease expired becomes dead instead of pending.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, TaskStoreError>;

    async fn finalize_success(
        &self,
        id: TaskId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError>;

    /// Re-queue after `backoff` while attempts remain, otherwise dead-letter.
    async fn finalize_retry(
        &self,
        id: TaskId,
        owner: &str,
        backoff: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError>;

    async fn finalize_fatal(
        &self,
        id: TaskId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError>;

    /// Dead-lettered tasks, most recently failed first.
    async fn list_dead(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError>;

    /// Move a dead task back to pending with a fresh attempt budget.
    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, TaskStoreError>;

    async fn stats(&self) -> Result<TaskStats, TaskStoreError>;

    /// Terminal tasks last updated before `cutoff`.
    async fn purgeable(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, TaskStoreError>;

    /// Delete a task only if it is still terminal and older than `cutoff`.
    async fn purge(&self, id: TaskId, cutoff: DateTime<Utc>) -> Result<bool, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskStoreError {
    #[error("invalid task: {0}")]
    Validation(String),
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("lease on task {0} is no longer held by this worker")]
    LeaseConflict(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub failed_retryable: u64,
    pub dead: u64,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Leased => self.leased += count,
            TaskStatus::Succeeded => self.succeeded += count,
            TaskStatus::FailedRetryable => self.failed_retryable += count,
            TaskStatus::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.succeeded + self.failed_retryable + self.dead
    }
}

/// In-memory task store for tests/dev.
///
/// Claim atomicity comes from one mutex around select+update.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<TaskId, Task>>, TaskStoreError> {
        self.tasks
            .lock()
            .map_err(|_| TaskStoreError::Storage("task store lock poisoned".to_string()))
    }

    /// Apply `f` to a task still leased by `owner`.
    fn with_lease<F>(&self, id: TaskId, owner: &str, f: F) -> Result<Task, TaskStoreError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.lock()?;
        let task = tasks.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;
        if !task.is_leased_by(owner) {
            return Err(TaskStoreError::LeaseConflict(id));
        }
        f(task);
        task.lease_owner = None;
        task.lease_expires_at = None;
        Ok(task.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        let task = task
            .validate()
            .map_err(TaskStoreError::Validation)?
            .into_task(now);
        self.lock()?.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn find_active(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Task>, TaskStoreError> {
        let tasks = self.lock()?;
        Ok(tasks
            .values()
            .filter(|t| !t.status.is_terminal() && t.name == name && &t.payload == payload)
            .min_by_key(|t| (t.created_at, t.id))
            .cloned())
    }

    async fn claim_eligible(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let mut tasks = self.lock()?;

        let mut candidates: Vec<(DateTime<Utc>, TaskId)> = tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .map(|t| (t.available_at, t.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let lease_expires_at = now + chrono_duration(lease);
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(task) = tasks.get_mut(&id) {
                task.status = TaskStatus::Leased;
                task.lease_owner = Some(owner.to_string());
                task.lease_expires_at = Some(lease_expires_at);
                task.attempts += 1;
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        let mut tasks = self.lock()?;
        let mut reclaimed = 0;
        for task in tasks.values_mut().filter(|t| t.is_lease_expired(now)) {
            if task.has_attempts_left() {
                task.status = TaskStatus::Pending;
            } else {
                task.status = TaskStatus::Dead;
                task.last_error = Some("lease expired".to_string());
            }
            task.lease_owner = None;
            task.lease_expires_at = None;
            task.updated_at = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn finalize_success(
        &self,
        id: TaskId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        self.with_lease(id, owner, |task| {
            task.status = TaskStatus::Succeeded;
            task.updated_at = now;
        })
    }

    async fn finalize_retry(
        &self,
        id: TaskId,
        owner: &str,
        backoff: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        self.with_lease(id, owner, |task| {
            if task.has_attempts_left() {
                task.status = TaskStatus::FailedRetryable;
                task.available_at = now + chrono_duration(backoff);
            } else {
                task.status = TaskStatus::Dead;
            }
            task.last_error = Some(error.to_string());
            task.updated_at = now;
        })
    }

    async fn finalize_fatal(
        &self,
        id: TaskId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        self.with_lease(id, owner, |task| {
            task.status = TaskStatus::Dead;
            task.last_error = Some(error.to_string());
            task.updated_at = now;
        })
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.lock()?;
        let mut dead: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        let mut tasks = self.lock()?;
        let task = tasks.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;
        if task.status != TaskStatus::Dead {
            return Err(TaskStoreError::Validation(format!(
                "task {id} is {}, only dead tasks can be requeued",
                task.status
            )));
        }
        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.available_at = now;
        task.last_error = None;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let tasks = self.lock()?;
        let mut stats = TaskStats::default();
        for task in tasks.values() {
            stats.record(task.status, 1);
        }
        Ok(stats)
    }

    async fn purgeable(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.lock()?;
        let mut rows: Vec<Task> = tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.updated_at, t.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn purge(&self, id: TaskId, cutoff: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let mut tasks = self.lock()?;
        let eligible = tasks
            .get(&id)
            .is_some_and(|t| t.status.is_terminal() && t.updated_at < cutoff);
        if eligible {
            tasks.remove(&id);
        }
        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_payload_without_storing() {
        let store = InMemoryTaskStore::new();
        let err = store
            .enqueue(NewTask::new("analytics_export", json!(42)), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::Validation(_)));
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn claim_orders_by_available_at_then_id_and_counts_attempt() {
        let store = InMemoryTaskStore::new();
        let later = store
            .enqueue(NewTask::new("b", json!({})).available_at(t0()), t0())
            .await
            .unwrap();
        let earlier = store
            .enqueue(
                NewTask::new("a", json!({})).available_at(t0() - chrono::Duration::minutes(1)),
                t0(),
            )
            .await
            .unwrap();
        store
            .enqueue(
                NewTask::new("future", json!({})).available_at(t0() + chrono::Duration::hours(1)),
                t0(),
            )
            .await
            .unwrap();

        let claimed = store.claim_eligible("w1", 10, t0(), LEASE).await.unwrap();
        let ids: Vec<TaskId> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
        assert!(claimed.iter().all(|t| t.attempts == 1));
        assert!(claimed.iter().all(|t| t.is_leased_by("w1")));
        assert_eq!(claimed[0].lease_expires_at, Some(t0() + chrono::Duration::seconds(60)));

        // Nothing left that is due.
        assert!(store.claim_eligible("w2", 10, t0(), LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_requires_the_lease_owner() {
        let store = InMemoryTaskStore::new();
        let task = store.enqueue(NewTask::new("x", json!({})), t0()).await.unwrap();
        store.claim_eligible("w1", 1, t0(), LEASE).await.unwrap();

        let err = store.finalize_success(task.id, "w2", t0()).await.unwrap_err();
        assert_eq!(err, TaskStoreError::LeaseConflict(task.id));

        let done = store.finalize_success(task.id, "w1", t0()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.lease_owner, None);

        // A second finalize after success is a conflict, not a rewrite.
        assert!(matches!(
            store.finalize_fatal(task.id, "w1", "late", t0()).await,
            Err(TaskStoreError::LeaseConflict(_))
        ));
    }

    #[tokio::test]
    async fn retry_requeues_with_backoff_until_budget_is_spent() {
        let store = InMemoryTaskStore::new();
        let task = store
            .enqueue(NewTask::new("x", json!({})).max_attempts(2), t0())
            .await
            .unwrap();

        store.claim_eligible("w", 1, t0(), LEASE).await.unwrap();
        let retried = store
            .finalize_retry(task.id, "w", Duration::from_secs(30), "boom", t0())
            .await
            .unwrap();
        assert_eq!(retried.status, TaskStatus::FailedRetryable);
        assert_eq!(retried.available_at, t0() + chrono::Duration::seconds(30));
        assert_eq!(retried.last_error.as_deref(), Some("boom"));

        // Not claimable during backoff.
        assert!(store.claim_eligible("w", 1, t0(), LEASE).await.unwrap().is_empty());

        let later = t0() + chrono::Duration::seconds(30);
        store.claim_eligible("w", 1, later, LEASE).await.unwrap();
        let dead = store
            .finalize_retry(task.id, "w", Duration::from_secs(30), "boom again", later)
            .await
            .unwrap();
        assert_eq!(dead.status, TaskStatus::Dead);
        assert_eq!(dead.attempts, 2);
        assert!(store.claim_eligible("w", 1, later + chrono::Duration::days(1), LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaim_is_idempotent_and_dead_letters_final_attempt() {
        let store = InMemoryTaskStore::new();
        let retryable = store.enqueue(NewTask::new("a", json!({})), t0()).await.unwrap();
        let last = store
            .enqueue(NewTask::new("b", json!({})).max_attempts(1), t0())
            .await
            .unwrap();
        store.claim_eligible("crashed", 10, t0(), LEASE).await.unwrap();

        // Lease not yet expired.
        assert_eq!(store.reclaim_expired_leases(t0() + chrono::Duration::seconds(60)).await.unwrap(), 0);

        let later = t0() + chrono::Duration::seconds(61);
        assert_eq!(store.reclaim_expired_leases(later).await.unwrap(), 2);
        assert_eq!(store.reclaim_expired_leases(later).await.unwrap(), 0);

        let retryable = store.get(retryable.id).await.unwrap().unwrap();
        assert_eq!(retryable.status, TaskStatus::Pending);
        assert_eq!(retryable.lease_owner, None);
        let last = store.get(last.id).await.unwrap().unwrap();
        assert_eq!(last.status, TaskStatus::Dead);
        assert_eq!(last.last_error.as_deref(), Some("lease expired"));

        // The crashed worker finishing late cannot overwrite anything.
        assert!(matches!(
            store.finalize_success(retryable.id, "crashed", later).await,
            Err(TaskStoreError::LeaseConflict(_))
        ));
    }

    #[tokio::test]
    async fn dead_tasks_can_be_listed_and_requeued() {
        let store = InMemoryTaskStore::new();
        let task = store.enqueue(NewTask::new("x", json!({})), t0()).await.unwrap();
        store.claim_eligible("w", 1, t0(), LEASE).await.unwrap();
        store.finalize_fatal(task.id, "w", "malformed", t0()).await.unwrap();

        let dead = store.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("malformed"));

        let later = t0() + chrono::Duration::hours(1);
        let requeued = store.requeue_dead(task.id, later).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.available_at, later);
        assert_eq!(requeued.last_error, None);

        assert!(matches!(
            store.requeue_dead(task.id, later).await,
            Err(TaskStoreError::Validation(_))
        ));
        assert!(matches!(
            store.requeue_dead(TaskId::new(), later).await,
            Err(TaskStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn find_active_ignores_terminal_tasks() {
        let store = InMemoryTaskStore::new();
        let payload = json!({"sla_hours": 48});
        let task = store
            .enqueue(NewTask::new("content_approval_check", payload.clone()), t0())
            .await
            .unwrap();
        let found = store.find_active("content_approval_check", &payload).await.unwrap();
        assert_eq!(found.map(|t| t.id), Some(task.id));
        assert!(store.find_active("content_approval_check", &json!({})).await.unwrap().is_none());

        store.claim_eligible("w", 1, t0(), LEASE).await.unwrap();
        store.finalize_success(task.id, "w", t0()).await.unwrap();
        assert!(store.find_active("content_approval_check", &payload).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_only_removes_old_terminal_tasks() {
        let store = InMemoryTaskStore::new();
        let done = store.enqueue(NewTask::new("x", json!({})), t0()).await.unwrap();
        let open = store.enqueue(NewTask::new("y", json!({})), t0()).await.unwrap();
        store.claim_eligible("w", 1, t0(), LEASE).await.unwrap();
        store.finalize_success(done.id, "w", t0()).await.unwrap();

        let cutoff = t0() + chrono::Duration::days(1);
        let rows = store.purgeable(cutoff, 10).await.unwrap();
        assert_eq!(rows.iter().map(|t| t.id).collect::<Vec<_>>(), vec![done.id]);

        assert!(store.purge(done.id, cutoff).await.unwrap());
        assert!(!store.purge(done.id, cutoff).await.unwrap());
        assert!(!store.purge(open.id, cutoff).await.unwrap());
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Claim,
        Retry,
        Fatal,
        Succeed,
        Expire,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => Just(Step::Claim),
            4 => Just(Step::Retry),
            1 => Just(Step::Fatal),
            1 => Just(Step::Succeed),
            2 => Just(Step::Expire),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Property: whatever sequence of claims, failures and lease expiries
        /// a task goes through, attempts never exceed max_attempts, and a
        /// dead task is never claimed again.
        #[test]
        fn attempts_never_exceed_max(max_attempts in 1u32..6, steps in prop::collection::vec(step(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = InMemoryTaskStore::new();
                let task = store
                    .enqueue(NewTask::new("x", json!({})).max_attempts(max_attempts), t0())
                    .await
                    .unwrap();
                let mut now = t0();

                for step in steps {
                    now += chrono::Duration::minutes(5);
                    match step {
                        Step::Claim => {
                            store.claim_eligible("w", 1, now, LEASE).await.unwrap();
                        }
                        Step::Retry => {
                            let _ = store.finalize_retry(task.id, "w", Duration::from_secs(1), "e", now).await;
                        }
                        Step::Fatal => {
                            let _ = store.finalize_fatal(task.id, "w", "e", now).await;
                        }
                        Step::Succeed => {
                            let _ = store.finalize_success(task.id, "w", now).await;
                        }
                        Step::Expire => {
                            store.reclaim_expired_leases(now + chrono::Duration::hours(1)).await.unwrap();
                        }
                    }
                    let current = store.get(task.id).await.unwrap().unwrap();
                    prop_assert!(current.attempts <= current.max_attempts);
                    if current.status == TaskStatus::Dead {
                        let claimed = store
                            .claim_eligible("w", 1, now + chrono::Duration::days(365), LEASE)
                            .await
                            .unwrap();
                        prop_assert!(claimed.is_empty());
                    }
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}

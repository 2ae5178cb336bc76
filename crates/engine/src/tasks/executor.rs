//! Runs one claimed task and finalizes it in the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use autopilot_core::{Clock, TaskId};

use super::registry::{HandlerError, HandlerRegistry, TaskHandler};
use super::store::{TaskStore, TaskStoreError};
use super::types::{RetryPolicy, Task, TaskStatus};

/// Classified result of running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RetryableFailure(_) => "retryable_failure",
            Outcome::FatalFailure(_) => "fatal_failure",
        }
    }
}

/// Run `handler` on `task` bounded by `timeout`.
///
/// The handler runs in its own tokio task so a panic is contained and
/// reported as a retryable failure. On timeout the handler task is aborted.
pub async fn execute(handler: Arc<dyn TaskHandler>, task: &Task, timeout: Duration) -> Outcome {
    let owned = task.clone();
    let mut join = tokio::spawn(async move { handler.handle(&owned).await });

    match tokio::time::timeout(timeout, &mut join).await {
        Ok(Ok(Ok(()))) => Outcome::Success,
        Ok(Ok(Err(err))) => classify(err),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Outcome::RetryableFailure("handler panicked".to_string())
        }
        Ok(Err(join_err)) => Outcome::RetryableFailure(format!("handler aborted: {join_err}")),
        Err(_) => {
            join.abort();
            Outcome::RetryableFailure(format!("execution timed out after {}ms", timeout.as_millis()))
        }
    }
}

fn classify(err: HandlerError) -> Outcome {
    if err.is_retryable() {
        Outcome::RetryableFailure(err.to_string())
    } else {
        Outcome::FatalFailure(err.to_string())
    }
}

/// What happened to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub name: String,
    pub attempts: u32,
    pub outcome: Outcome,
    /// Status written by the finalize call; `None` when the lease had
    /// already been lost.
    pub final_status: Option<TaskStatus>,
    pub duration: Duration,
}

/// Resolves handlers, runs them and finalizes the claimed row.
pub struct Executor {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    timeout: Duration,
    worker_id: String,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        retry: RetryPolicy,
        timeout: Duration,
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
            timeout,
            worker_id: worker_id.into(),
            clock,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute a task this worker has leased and record the outcome.
    ///
    /// Only storage failures surface as errors; a lost lease is logged and
    /// reported with `final_status: None`.
    pub async fn run(&self, task: Task) -> Result<ExecutionReport, TaskStoreError> {
        let started = Instant::now();
        let outcome = match self.registry.resolve(&task.name) {
            Ok(handler) => execute(handler, &task, self.timeout).await,
            Err(err) => Outcome::FatalFailure(err.to_string()),
        };
        let duration = started.elapsed();
        let now = self.clock.now();

        let finalized = match &outcome {
            Outcome::Success => self.store.finalize_success(task.id, &self.worker_id, now).await,
            Outcome::RetryableFailure(error) => {
                let backoff = self.retry.delay_for_attempt(task.attempts);
                self.store
                    .finalize_retry(task.id, &self.worker_id, backoff, error, now)
                    .await
            }
            Outcome::FatalFailure(error) => {
                self.store
                    .finalize_fatal(task.id, &self.worker_id, error, now)
                    .await
            }
        };

        let final_status = match finalized {
            Ok(row) => Some(row.status),
            Err(TaskStoreError::LeaseConflict(_)) => {
                debug!(
                    task_id = %task.id,
                    name = %task.name,
                    "lease lost before finalize; another worker owns the task"
                );
                None
            }
            Err(err) => return Err(err),
        };

        let duration_ms = duration.as_millis() as u64;
        let status = final_status.map(|s| s.as_str()).unwrap_or("lease_lost");
        match &outcome {
            Outcome::Success => info!(
                task_id = %task.id,
                name = %task.name,
                attempts = task.attempts,
                duration_ms,
                outcome = outcome.label(),
                status,
                "task executed"
            ),
            Outcome::RetryableFailure(error) | Outcome::FatalFailure(error) => warn!(
                task_id = %task.id,
                name = %task.name,
                attempts = task.attempts,
                duration_ms,
                outcome = outcome.label(),
                status,
                error = %error,
                "task failed"
            ),
        }

        Ok(ExecutionReport {
            task_id: task.id,
            name: task.name,
            attempts: task.attempts,
            outcome,
            final_status,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::registry::handler_fn;
    use crate::tasks::store::InMemoryTaskStore;
    use crate::tasks::types::NewTask;
    use autopilot_core::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()))
    }

    fn executor(
        store: Arc<InMemoryTaskStore>,
        registry: HandlerRegistry,
        clock: Arc<ManualClock>,
        timeout: Duration,
    ) -> Executor {
        Executor::new(
            store,
            Arc::new(registry),
            RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60), 0.0),
            timeout,
            "worker-1",
            clock,
        )
    }

    async fn claim_one(store: &InMemoryTaskStore, clock: &ManualClock) -> Task {
        store
            .claim_eligible("worker-1", 1, clock.now(), LEASE)
            .await
            .unwrap()
            .pop()
            .unwrap()
    }

    #[tokio::test]
    async fn classifies_handler_signals() {
        let ok = handler_fn(|_| async { Ok(()) });
        let transient = handler_fn(|_| async { Err(HandlerError::transient("503")) });
        let permanent = handler_fn(|_| async { Err(HandlerError::permanent("bad id")) });
        let unclassified = handler_fn(|_| async { Err(anyhow::anyhow!("eof").into()) });
        let task = NewTask::new("x", json!({})).into_task(Utc::now());
        let t = Duration::from_secs(1);

        assert_eq!(execute(ok, &task, t).await, Outcome::Success);
        assert!(matches!(execute(transient, &task, t).await, Outcome::RetryableFailure(_)));
        assert!(matches!(execute(permanent, &task, t).await, Outcome::FatalFailure(_)));
        assert!(matches!(execute(unclassified, &task, t).await, Outcome::RetryableFailure(_)));
    }

    #[tokio::test]
    async fn timeout_and_panic_are_retryable() {
        let slow = handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let panicking = handler_fn(|task: Task| async move {
            if task.payload.is_object() {
                panic!("handler bug");
            }
            Ok(())
        });
        let task = NewTask::new("x", json!({})).into_task(Utc::now());

        let outcome = execute(slow, &task, Duration::from_millis(20)).await;
        assert!(matches!(outcome, Outcome::RetryableFailure(ref e) if e.contains("timed out")));

        let outcome = execute(panicking, &task, Duration::from_secs(1)).await;
        assert_eq!(outcome, Outcome::RetryableFailure("handler panicked".to_string()));
    }

    #[tokio::test]
    async fn missing_handler_dead_letters_on_first_attempt() {
        let store = InMemoryTaskStore::arc();
        let clock = clock();
        store
            .enqueue(NewTask::new("unknown", json!({})).max_attempts(5), clock.now())
            .await
            .unwrap();
        let exec = executor(store.clone(), HandlerRegistry::new(), clock.clone(), Duration::from_secs(1));

        let task = claim_one(&store, &clock).await;
        let report = exec.run(task).await.unwrap();
        assert!(matches!(report.outcome, Outcome::FatalFailure(_)));
        assert_eq!(report.final_status, Some(TaskStatus::Dead));
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_by_attempt() {
        let store = InMemoryTaskStore::arc();
        let clock = clock();
        let mut registry = HandlerRegistry::new();
        registry
            .register("flaky", handler_fn(|_| async { Err(HandlerError::transient("down")) }))
            .unwrap();
        let task = store
            .enqueue(NewTask::new("flaky", json!({})).max_attempts(3), clock.now())
            .await
            .unwrap();
        let exec = executor(store.clone(), registry, clock.clone(), Duration::from_secs(1));

        let report = exec.run(claim_one(&store, &clock).await).await.unwrap();
        assert_eq!(report.final_status, Some(TaskStatus::FailedRetryable));
        let row = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(row.available_at, clock.now() + chrono::Duration::seconds(10));

        clock.advance(chrono::Duration::seconds(10));
        exec.run(claim_one(&store, &clock).await).await.unwrap();
        let row = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(row.available_at, clock.now() + chrono::Duration::seconds(20));
    }

    #[tokio::test]
    async fn lost_lease_is_reported_not_raised() {
        let store = InMemoryTaskStore::arc();
        let clock = clock();
        let mut registry = HandlerRegistry::new();
        registry.register("noop", handler_fn(|_| async { Ok(()) })).unwrap();
        store.enqueue(NewTask::new("noop", json!({})), clock.now()).await.unwrap();
        let exec = executor(store.clone(), registry, clock.clone(), Duration::from_secs(1));

        let task = claim_one(&store, &clock).await;
        // The lease expires and another worker re-claims before we finish.
        store
            .reclaim_expired_leases(clock.now() + chrono::Duration::seconds(61))
            .await
            .unwrap();
        store
            .claim_eligible("worker-2", 1, clock.now() + chrono::Duration::seconds(61), LEASE)
            .await
            .unwrap();

        let report = exec.run(task.clone()).await.unwrap();
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.final_status, None);
        let row = store.get(task.id).await.unwrap().unwrap();
        assert!(row.is_leased_by("worker-2"));
    }
}

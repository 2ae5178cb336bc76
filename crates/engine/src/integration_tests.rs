//! Cross-module scenarios: queue + executor + scheduler + sweeps together.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use autopilot_cms::{AnalyticsExport, ContentItem, PublishStatus, RetentionPolicy};
use autopilot_core::{Clock, ExportId, ManualClock, UserId};

use crate::export_writer::FsExportWriter;
use crate::notify::RecordingNotifier;
use crate::repo::{ContentRepository, ExportRepository, InMemoryCms};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::sweeps::{AnalyticsExportRetentionSweep, RetentionSettings, Sweep, SweepContext, SweepSet};
use crate::tasks::{
    Executor, HandlerError, HandlerRegistry, InMemoryTaskStore, NewTask, RetryPolicy, TaskStatus,
    TaskStore, handler_fn,
};

const LEASE: Duration = Duration::from_secs(60);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
}

struct World {
    clock: Arc<ManualClock>,
    tasks: Arc<InMemoryTaskStore>,
    cms: Arc<InMemoryCms>,
    notifier: Arc<RecordingNotifier>,
    ctx: SweepContext,
}

impl World {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let tasks = InMemoryTaskStore::arc();
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = SweepContext {
            notifier: notifier.clone(),
            tasks: tasks.clone(),
            writer: Arc::new(FsExportWriter::new(std::env::temp_dir().join("autopilot-it"))),
            clock: clock.clone(),
            batch_limit: 100,
            default_max_attempts: 3,
        };
        Self {
            clock,
            tasks,
            cms: InMemoryCms::arc(),
            notifier,
            ctx,
        }
    }

    fn scheduler(&self, worker: &str, registry: HandlerRegistry, with_sweeps: bool) -> Scheduler {
        let executor = Arc::new(Executor::new(
            self.tasks.clone(),
            Arc::new(registry),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 0.0),
            Duration::from_secs(5),
            worker,
            self.clock.clone(),
        ));
        let sweeps = if with_sweeps {
            SweepSet::new(&self.cms, self.tasks.clone(), RetentionSettings::default()).all()
        } else {
            Vec::new()
        };
        Scheduler::new(
            self.tasks.clone(),
            executor,
            sweeps,
            self.ctx.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_millis(10),
                batch_size: 10,
                max_concurrency: 4,
                lease_duration: LEASE,
                error_backoff_max: Duration::from_millis(100),
            },
        )
    }
}

#[tokio::test]
async fn fails_twice_then_succeeds_on_the_third_attempt() {
    let world = World::new();
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let calls = calls.clone();
        registry
            .register(
                "analytics_export",
                handler_fn(move |_task| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(HandlerError::transient("upstream unavailable"))
                        } else {
                            Ok(())
                        }
                    }
                }),
            )
            .unwrap();
    }
    let scheduler = world.scheduler("w1", registry, false);
    let task = world
        .tasks
        .enqueue(NewTask::new("analytics_export", json!({})).max_attempts(3), t0())
        .await
        .unwrap();

    for _ in 0..3 {
        scheduler.tick().await.unwrap();
        // Past the largest possible backoff.
        world.clock.advance(chrono::Duration::seconds(11));
    }

    let done = world.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(done.attempts, 3);
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Terminal: further ticks never touch it.
    scheduler.tick().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_can_be_replayed() {
    let world = World::new();
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "flaky",
            handler_fn(|_task| async { Err(HandlerError::transient("still down")) }),
        )
        .unwrap();
    let scheduler = world.scheduler("w1", registry, false);
    let task = world
        .tasks
        .enqueue(NewTask::new("flaky", json!({})).max_attempts(2), t0())
        .await
        .unwrap();

    for _ in 0..4 {
        scheduler.tick().await.unwrap();
        world.clock.advance(chrono::Duration::seconds(11));
    }

    let dead = world.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(dead.status, TaskStatus::Dead);
    assert_eq!(dead.attempts, 2);
    assert_eq!(dead.last_error.as_deref(), Some("transient failure: still down"));
    assert_eq!(world.tasks.list_dead(10).await.unwrap().len(), 1);

    let replayed = world.tasks.requeue_dead(task.id, world.clock.now()).await.unwrap();
    assert_eq!(replayed.status, TaskStatus::Pending);
    assert_eq!(replayed.attempts, 0);
}

#[tokio::test]
async fn scheduled_content_is_published_once_across_ticks() {
    let world = World::new();
    let mut item = ContentItem::draft("Release notes", UserId::new(), t0() - chrono::Duration::hours(1));
    item.schedule(t0() - chrono::Duration::seconds(1), None, t0() - chrono::Duration::hours(1))
        .unwrap();
    world.cms.insert_content(&item).await.unwrap();
    let scheduler = world.scheduler("w1", HandlerRegistry::new(), true);

    let first = scheduler.tick().await.unwrap();
    let publish = first
        .sweeps
        .iter()
        .find(|s| s.sweep == "content_publish")
        .unwrap();
    assert_eq!(publish.applied, 1);

    let stored = world.cms.get_content(item.id).await.unwrap().unwrap();
    assert_eq!(stored.publish_status, PublishStatus::Published);
    assert_eq!(stored.published_at, Some(t0()));
    assert_eq!(world.notifier.count("content.published"), 1);

    let second = scheduler.tick().await.unwrap();
    assert!(second.is_idle());
    assert_eq!(world.cms.get_content(item.id).await.unwrap().unwrap(), stored);
    assert_eq!(world.notifier.count("content.published"), 1);
}

#[tokio::test]
async fn null_export_retention_deletes_nothing() {
    let world = World::new();
    let old = AnalyticsExport {
        id: ExportId::new(),
        scheduled_export_id: None,
        file_path: "/nonexistent/old.json".to_string(),
        format: "json".to_string(),
        created_at: t0() - chrono::Duration::days(365),
    };
    world.cms.record_analytics_export(&old).await.unwrap();

    let sweep = AnalyticsExportRetentionSweep::new(world.cms.clone(), RetentionPolicy(None));
    let report = Sweep::run(&sweep, &world.ctx).await.unwrap();

    assert_eq!(report.applied, 0);
    assert_eq!(report.errors, 0);
    assert_eq!(
        world
            .cms
            .expired_analytics_exports(t0(), 10)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_schedulers_partition_ten_tasks() {
    let world = World::new();
    let executed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let registry = {
        let mut registry = HandlerRegistry::new();
        let executed = executed.clone();
        registry
            .register(
                "work",
                handler_fn(move |task| {
                    let executed = executed.clone();
                    async move {
                        executed.lock().unwrap().push(task.id);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        registry
    };
    for i in 0..10 {
        world
            .tasks
            .enqueue(NewTask::new("work", json!({ "i": i })), t0())
            .await
            .unwrap();
    }
    let a = world.scheduler("worker-a", registry.clone(), false);
    let b = world.scheduler("worker-b", registry, false);

    let (ra, rb) = tokio::join!(a.tick(), b.tick());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let ids_a: HashSet<_> = ra.executions.iter().map(|r| r.task_id).collect();
    let ids_b: HashSet<_> = rb.executions.iter().map(|r| r.task_id).collect();
    assert!(ids_a.is_disjoint(&ids_b));
    assert_eq!(ids_a.len() + ids_b.len(), 10);
    assert_eq!(executed.lock().unwrap().len(), 10);
    assert_eq!(world.tasks.stats().await.unwrap().succeeded, 10);
}

#[tokio::test]
async fn crashed_worker_leases_are_recovered_once() {
    let world = World::new();
    world
        .tasks
        .enqueue(NewTask::new("work", json!({})), t0())
        .await
        .unwrap();
    let claimed = world
        .tasks
        .claim_eligible("crashed", 10, t0(), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    world.clock.advance(chrono::Duration::seconds(31));
    let now = world.clock.now();
    assert_eq!(world.tasks.reclaim_expired_leases(now).await.unwrap(), 1);
    assert_eq!(world.tasks.reclaim_expired_leases(now).await.unwrap(), 0);

    // The crashed worker's late finalize is rejected.
    assert!(
        world
            .tasks
            .finalize_success(claimed[0].id, "crashed", now)
            .await
            .is_err()
    );

    let mut registry = HandlerRegistry::new();
    registry
        .register("work", handler_fn(|_task| async { Ok(()) }))
        .unwrap();
    let report = world.scheduler("healthy", registry, false).tick().await.unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(
        world.tasks.get(claimed[0].id).await.unwrap().unwrap().attempts,
        2
    );
}

#[tokio::test]
async fn slow_handlers_time_out_as_retryable() {
    let world = World::new();
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "slow",
            handler_fn(|_task| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        )
        .unwrap();
    let executor = Executor::new(
        world.tasks.clone(),
        Arc::new(registry),
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 0.0),
        Duration::from_millis(20),
        "w1",
        world.clock.clone(),
    );
    let task = world
        .tasks
        .enqueue(NewTask::new("slow", json!({})), t0())
        .await
        .unwrap();
    let claimed = world
        .tasks
        .claim_eligible("w1", 1, t0(), LEASE)
        .await
        .unwrap();

    let report = executor.run(claimed[0].clone()).await.unwrap();

    assert_eq!(report.final_status, Some(TaskStatus::FailedRetryable));
    let stored = world.tasks.get(task.id).await.unwrap().unwrap();
    assert!(stored.last_error.unwrap().contains("timed out"));
}

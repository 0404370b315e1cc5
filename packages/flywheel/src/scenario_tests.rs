//! End-to-end scenarios across the arbiter, monitors, workers, and backend.
//!
//! Timing-bound scenarios run under paused tokio time: every wait in the
//! runtime rides the tokio clock, so these advance deterministically.
//! Scheduler cadence is driven with synthetic wall-clock values instead of
//! sleeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::arbiter::Arbiter;
use crate::backend::{LocalBackend, SubmitOptions, TaskBackend};
use crate::config::Config;
use crate::job::{Job, JobGroup, JobRegistry, Schedule};
use crate::monitor::Monitor;
use crate::task::{Task, TaskErrorKind, TaskStatus};
use crate::worker::WorkerFactory;

struct AddOne;

#[async_trait]
impl Job for AddOne {
    fn name(&self) -> &str {
        "addone"
    }

    async fn run(&self, _task: &Task, args: &Value, _kwargs: &Value) -> anyhow::Result<Value> {
        let x = args
            .get(0)
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("expected one integer argument"))?;
        Ok(json!(x + 1))
    }
}

struct Sleepy;

#[async_trait]
impl Job for Sleepy {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    async fn run(&self, _task: &Task, _args: &Value, _kwargs: &Value) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    }
}

struct Slow;

#[async_trait]
impl Job for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn run(&self, _task: &Task, _args: &Value, _kwargs: &Value) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!("done"))
    }
}

struct Stall;

#[async_trait]
impl Job for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    async fn run(&self, _task: &Task, _args: &Value, _kwargs: &Value) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_secs(100)).await;
        Ok(Value::Null)
    }
}

struct HeartbeatJob;

#[async_trait]
impl Job for HeartbeatJob {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn schedule(&self) -> Option<Schedule> {
        Some(Schedule::every(Duration::from_secs(1)))
    }

    async fn run(&self, _task: &Task, _args: &Value, _kwargs: &Value) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

fn jobs() -> JobGroup {
    JobGroup::new("scenarios")
        .register(AddOne)
        .register(Sleepy)
        .register(Slow)
        .register(Stall)
        .register(HeartbeatJob)
}

fn config() -> Config {
    Config::builder()
        .task_paths(vec!["scenarios".to_string()])
        .claim_timeout(Duration::from_millis(50))
        .build()
}

fn trace_init() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn arbiter_with(cfg: Config) -> Arbiter {
    let mut arbiter = Arbiter::builder(cfg).group(jobs()).build().unwrap();
    arbiter.add_worker_pool("test").unwrap();
    arbiter
}

async fn wait_for_terminal(backend: &dyn TaskBackend, id: &str, max: Duration) -> Task {
    let deadline = Instant::now() + max;
    loop {
        let task = backend.get_task(id).await.unwrap();
        if task.status.is_terminal() {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {id} never reached a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn worker_aids(handle: &crate::arbiter::ArbiterHandle) -> Vec<String> {
    let info = handle.info().await.unwrap();
    info["monitors"][0]["workers"]
        .as_array()
        .map(|workers| {
            workers
                .iter()
                .filter_map(|w| w["aid"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// Scenario: ping, echo, and info against a monitor named "test".
#[tokio::test(start_paused = true)]
async fn ping_echo_and_info() {
    let arbiter = arbiter_with(config());
    let handle = arbiter.handle();
    let serving = tokio::spawn(arbiter.serve());

    assert_eq!(handle.ping().await.unwrap(), "pong");
    assert_eq!(handle.echo("Hello!").await.unwrap(), "Hello!");

    let info = handle.info().await.unwrap();
    assert_eq!(info["monitors"][0]["name"], "test");

    assert!(handle.quit().await.unwrap());
    serving.await.unwrap().unwrap();
}

// Scenario: submit addone(41) and read back SUCCESS with result 42.
#[tokio::test(start_paused = true)]
async fn submit_and_run_to_success() {
    let arbiter = arbiter_with(config());
    let handle = arbiter.handle();
    let backend = arbiter.backend();
    let serving = tokio::spawn(arbiter.serve());

    let id = backend
        .submit("addone", json!([41]), json!({}), SubmitOptions::default())
        .await
        .unwrap();

    let task = wait_for_terminal(&*backend, &id, Duration::from_secs(2)).await;
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.result, Some(json!(42)));
    assert!(task.time_enqueued <= task.time_started);
    assert!(task.time_started <= task.time_ended);

    handle.quit().await.unwrap();
    serving.await.unwrap().unwrap();
}

// Scenario: a job that outlives its timeout fails with a timeout envelope
// and the worker is replaced (different aid afterwards).
#[tokio::test(start_paused = true)]
async fn timeout_fails_task_and_respawns_worker() {
    let arbiter = arbiter_with(config());
    let handle = arbiter.handle();
    let backend = arbiter.backend();
    let serving = tokio::spawn(arbiter.serve());

    // Wait for the pool to come up and note the original worker.
    let spawn_deadline = Instant::now() + Duration::from_secs(5);
    let before = loop {
        let aids = worker_aids(&handle).await;
        if !aids.is_empty() {
            break aids;
        }
        assert!(Instant::now() < spawn_deadline, "pool never came up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let id = backend
        .submit("sleepy", json!([]), json!({}), SubmitOptions::default())
        .await
        .unwrap();

    let task = wait_for_terminal(&*backend, &id, Duration::from_secs(3)).await;
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.error.unwrap().kind, TaskErrorKind::Timeout);

    // The monitor reaps the dead worker and spawns a fresh one.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let after = worker_aids(&handle).await;
        if !after.is_empty() && after.iter().all(|aid| !before.contains(aid)) {
            break;
        }
        assert!(Instant::now() < deadline, "worker was never replaced");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.quit().await.unwrap();
    serving.await.unwrap().unwrap();
}

// Scenario: a 1-second periodic job over 3.5 seconds of scheduler time
// produces at least 3 and at most 4 tasks.
#[tokio::test]
async fn periodic_job_fires_on_cadence() {
    let cfg = Config::builder()
        .task_paths(vec!["scenarios".to_string()])
        .schedule_periodic(true)
        .build();
    let registry = Arc::new(JobRegistry::build(vec![jobs()], &cfg.task_paths).unwrap());
    let backend = LocalBackend::open(&cfg, registry);

    let t0 = Utc::now();
    let mut fired = 0;
    for step_ms in (250..=3500).step_by(250) {
        let now = t0 + chrono::Duration::milliseconds(step_ms as i64);
        fired += backend.tick(now).await.unwrap();
    }
    assert!((3..=4).contains(&fired), "fired {fired} times");
    assert_eq!(backend.queue_depth().await, fired);

    let scheduled = backend.next_scheduled(None).await;
    assert_eq!(scheduled[0].0, "heartbeat");
    assert!(scheduled[0].1 > t0 + chrono::Duration::milliseconds(3500));
}

// Scenario: graceful close under backlog leaves no task in STARTED.
#[tokio::test(start_paused = true)]
async fn graceful_close_leaves_nothing_started() {
    trace_init();
    let cfg = Config::builder()
        .task_paths(vec!["scenarios".to_string()])
        .claim_timeout(Duration::from_millis(50))
        .num_workers(4)
        .build();
    let arbiter = arbiter_with(cfg);
    let handle = arbiter.handle();
    let backend = arbiter.backend();
    let serving = tokio::spawn(arbiter.serve());

    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(
            backend
                .submit("slow", json!([]), json!({}), SubmitOptions::default())
                .await
                .unwrap(),
        );
    }

    // Let the pool spin up and start chewing on the backlog, then quit
    // while executions are still in flight.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(handle.quit().await.unwrap());
    serving.await.unwrap().unwrap();

    for id in ids {
        let task = backend.get_task(&id).await.unwrap();
        assert_ne!(
            task.status,
            TaskStatus::Started,
            "task {id} was left started"
        );
        if task.status == TaskStatus::Success {
            assert_eq!(task.result, Some(json!("done")));
        }
    }
}

// Scenario: a worker killed mid-task. The task fails as actor-died within
// the lease miss window and the pool returns to its configured size.
#[tokio::test(start_paused = true)]
async fn killed_worker_fails_its_task_and_is_replaced() {
    trace_init();
    let cfg = config();
    let registry = Arc::new(JobRegistry::build(vec![jobs()], &cfg.task_paths).unwrap());
    let backend = LocalBackend::open(&cfg, registry.clone());
    let factory = Arc::new(WorkerFactory::new(backend.clone(), registry));
    let mut monitor = Monitor::new(
        "test".to_string(),
        factory,
        1,
        0,
        &cfg,
        None,
        crate::arbiter::ActorIndex::default(),
        None,
    );

    let id = backend
        .submit("stall", json!([]), json!({}), SubmitOptions::default())
        .await
        .unwrap();

    // Maintain until the lone worker has claimed the task.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        monitor.maintain().await;
        let task = backend.get_task(&id).await.unwrap();
        if task.status == TaskStatus::Started {
            break;
        }
        assert!(Instant::now() < deadline, "task was never claimed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let before = monitor.aids();
    assert_eq!(before.len(), 1);

    // Simulated kill: force-terminate the worker mid-task.
    if let Some(proxy) = monitor.proxy(&before[0]) {
        proxy.terminate();
    }

    // Supervision recovers: the task fails as actor-died once the lease
    // lapses, and the pool converges back to one fresh worker.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        monitor.maintain().await;
        let task = backend.get_task(&id).await.unwrap();
        let replaced = monitor
            .aids()
            .first()
            .is_some_and(|aid| *aid != before[0]);
        if task.status == TaskStatus::Failure && replaced {
            assert_eq!(task.error.clone().unwrap().kind, TaskErrorKind::ActorDied);
            break;
        }
        assert!(
            Instant::now() < deadline,
            "worker death was never recovered (status {:?})",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(monitor.live_count(), 1);

    monitor.close_actors().await;
}

// Property: pool size converges to the configured count within a bounded
// number of maintenance intervals.
#[tokio::test(start_paused = true)]
async fn pool_size_converges() {
    let cfg = Config::builder()
        .task_paths(vec!["scenarios".to_string()])
        .num_workers(3)
        .build();
    let arbiter = arbiter_with(cfg.clone());
    let handle = arbiter.handle();
    let serving = tokio::spawn(arbiter.serve());

    tokio::time::sleep(cfg.maintenance_interval * 10).await;
    let aids = worker_aids(&handle).await;
    assert_eq!(aids.len(), 3);

    handle.quit().await.unwrap();
    serving.await.unwrap().unwrap();
}

// The forced-off scheduling flag: even a leader's spawn params reach
// workers with schedule_periodic disabled.
#[tokio::test(start_paused = true)]
async fn workers_never_inherit_the_scheduling_flag() {
    let cfg = Config::builder()
        .task_paths(vec!["scenarios".to_string()])
        .schedule_periodic(true)
        .build();
    let registry = Arc::new(JobRegistry::build(vec![jobs()], &cfg.task_paths).unwrap());
    let backend = LocalBackend::open(&cfg, registry.clone());
    let factory = Arc::new(WorkerFactory::new(backend, registry));
    let monitor = Monitor::new(
        "test".to_string(),
        factory,
        1,
        0,
        &cfg,
        None,
        crate::arbiter::ActorIndex::default(),
        None,
    );
    assert!(cfg.schedule_periodic);
    assert!(!monitor.spawn_params().schedule_periodic);
}

// Submit validation: an unregistered job name is rejected before any task
// record is created.
#[tokio::test(start_paused = true)]
async fn unknown_jobs_never_become_tasks() {
    let arbiter = arbiter_with(config());
    let handle = arbiter.handle();
    let backend = arbiter.backend();
    let serving = tokio::spawn(arbiter.serve());

    let err = backend
        .submit("missing", json!([]), json!({}), SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::FlywheelError::UnknownJob(_)));
    assert_eq!(backend.queue_depth().await, 0);

    handle.quit().await.unwrap();
    serving.await.unwrap().unwrap();
}

// Revoke-before-execution: a queued task pulled back before any worker
// claims it never runs.
#[tokio::test(start_paused = true)]
async fn revoked_tasks_never_execute() {
    let cfg = Config::builder()
        .task_paths(vec!["scenarios".to_string()])
        .claim_timeout(Duration::from_millis(50))
        .build();
    let mut arbiter = Arbiter::builder(cfg).group(jobs()).build().unwrap();
    // No worker pool yet: the task sits queued.
    let backend = arbiter.backend();
    let id = backend
        .submit("addone", json!([1]), json!({}), SubmitOptions::default())
        .await
        .unwrap();
    assert!(backend.revoke(&id).await.unwrap());

    arbiter.add_worker_pool("test").unwrap();
    let handle = arbiter.handle();
    let serving = tokio::spawn(arbiter.serve());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let task = backend.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Revoked);
    assert!(task.result.is_none());
    assert!(task.time_started.is_none());

    handle.quit().await.unwrap();
    serving.await.unwrap().unwrap();
}

//! Worker actor: the backend consumer loop.
//!
//! ```text
//! WorkerActor turn
//!     │
//!     ├─► reap finished executions (a timed-out one kills the actor)
//!     ├─► claim(worker_id, short timeout)
//!     │       └─► BackendUnavailable → exponential backoff, retry
//!     └─► spawn execution (bounded by `backlog`)
//!             ├─► lease heartbeat every half claim-timeout
//!             ├─► Job::run wrapped in the per-job timeout
//!             └─► publish Success / Failure
//! ```
//!
//! A task that outlives its timeout is published `Failure/Timeout` and the
//! worker self-terminates so its monitor replaces it with a fresh one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::{Actor, ActorContext, ActorFactory, SpawnParams};
use crate::backend::TaskBackend;
use crate::error::{FlywheelError, Result};
use crate::job::JobRegistry;
use crate::task::{Task, TaskError, TaskErrorKind, TaskId, TaskStatus};

/// Claim backoff bounds for an unavailable backend.
const CLAIM_BACKOFF_MIN: Duration = Duration::from_millis(100);
const CLAIM_BACKOFF_MAX: Duration = Duration::from_secs(2);

enum ExecOutcome {
    Completed(TaskId),
    TimedOut { task_id: TaskId, after: Duration },
}

/// Consumes tasks from the backend while `Running`.
pub struct WorkerActor {
    backend: Arc<dyn TaskBackend>,
    registry: Arc<JobRegistry>,
    worker_id: String,
    backlog: usize,
    claim_timeout: Duration,
    default_timeout: Duration,
    close_timeout: Duration,
    inflight: JoinSet<ExecOutcome>,
    current: Arc<Mutex<HashSet<TaskId>>>,
    backoff: Duration,
}

impl WorkerActor {
    fn new(
        backend: Arc<dyn TaskBackend>,
        registry: Arc<JobRegistry>,
        params: &SpawnParams,
    ) -> Self {
        Self {
            backend,
            registry,
            worker_id: String::new(),
            backlog: params.backlog.max(1),
            claim_timeout: params.claim_timeout,
            default_timeout: params.default_timeout,
            close_timeout: params.close_timeout,
            inflight: JoinSet::new(),
            current: Arc::new(Mutex::new(HashSet::new())),
            backoff: CLAIM_BACKOFF_MIN,
        }
    }

    fn current_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .current
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn track(&self, task_id: &str) {
        if let Ok(mut set) = self.current.lock() {
            set.insert(task_id.to_string());
        }
    }

    /// Inspect one finished execution. A timeout kills the worker.
    fn settle(
        &self,
        joined: std::result::Result<ExecOutcome, tokio::task::JoinError>,
    ) -> Result<()> {
        match joined {
            Ok(ExecOutcome::Completed(_)) => Ok(()),
            Ok(ExecOutcome::TimedOut { task_id, after }) => {
                warn!(
                    worker_id = %self.worker_id,
                    task_id = %task_id,
                    "task timed out; worker self-terminating"
                );
                Err(FlywheelError::Timeout(after))
            }
            Err(err) if err.is_panic() => {
                // The task record stays Started; the lease sweep will fail
                // it as actor-died once the miss window elapses.
                error!(worker_id = %self.worker_id, "task execution panicked");
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    fn spawn_execution(&mut self, task: Task) {
        let Some(job) = self.registry.lookup(&task.job_name).cloned() else {
            // Submit validates names, so this only happens when registries
            // diverge across processes.
            let backend = self.backend.clone();
            let task_id = task.id.clone();
            let job_name = task.job_name.clone();
            self.inflight.spawn(async move {
                let envelope = TaskError {
                    kind: TaskErrorKind::Job,
                    message: format!("job {job_name} not registered on this worker"),
                    backtrace: None,
                };
                if let Err(err) = backend
                    .publish(&task_id, TaskStatus::Failure, None, Some(envelope))
                    .await
                {
                    error!(task_id = %task_id, error = %err, "failed to publish");
                }
                ExecOutcome::Completed(task_id)
            });
            return;
        };

        let backend = self.backend.clone();
        let current = self.current.clone();
        let timeout = job.timeout().unwrap_or(self.default_timeout);
        let heartbeat_every = (self.claim_timeout / 2).max(Duration::from_millis(10));
        self.track(&task.id);

        self.inflight.spawn(async move {
            let task_id = task.id.clone();

            // Lease heartbeat runs beside the execution. The drop guard
            // cancels it even when this execution is aborted mid-run, so a
            // dead worker's lease really does lapse.
            let cancel = CancellationToken::new();
            let beat_cancel = cancel.clone();
            let beat_backend = backend.clone();
            let beat_id = task_id.clone();
            let beats = tokio::spawn(async move {
                let mut interval = tokio::time::interval(heartbeat_every);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = beat_cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(err) = beat_backend.heartbeat(&beat_id).await {
                                debug!(task_id = %beat_id, error = %err, "lease heartbeat failed");
                            }
                        }
                    }
                }
            });
            let beat_guard = cancel.drop_guard();

            let started = Instant::now();
            let run = job.run(&task, &task.args, &task.kwargs);
            let outcome = match tokio::time::timeout(timeout, run).await {
                Ok(Ok(result)) => {
                    debug!(
                        task_id = %task_id,
                        job_name = %task.job_name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "task succeeded"
                    );
                    publish(&*backend, &task_id, TaskStatus::Success, Some(result), None).await;
                    ExecOutcome::Completed(task_id.clone())
                }
                Ok(Err(err)) => {
                    warn!(
                        task_id = %task_id,
                        job_name = %task.job_name,
                        error = %err,
                        "task failed"
                    );
                    publish(
                        &*backend,
                        &task_id,
                        TaskStatus::Failure,
                        None,
                        Some(TaskError::job(&err)),
                    )
                    .await;
                    ExecOutcome::Completed(task_id.clone())
                }
                Err(_) => {
                    publish(
                        &*backend,
                        &task_id,
                        TaskStatus::Failure,
                        None,
                        Some(TaskError::timeout(timeout)),
                    )
                    .await;
                    ExecOutcome::TimedOut {
                        task_id: task_id.clone(),
                        after: timeout,
                    }
                }
            };

            drop(beat_guard);
            let _ = beats.await;
            if let Ok(mut set) = current.lock() {
                set.remove(&task_id);
            }
            outcome
        });
    }
}

async fn publish(
    backend: &dyn TaskBackend,
    task_id: &str,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<TaskError>,
) {
    if let Err(err) = backend.publish(task_id, status, result, error).await {
        // An invalid transition is an internal invariant violation; record
        // it and leave the task where it is.
        error!(task_id = %task_id, status = %status, error = %err, "publish failed");
    }
}

#[async_trait]
impl Actor for WorkerActor {
    fn actor_class(&self) -> &'static str {
        "worker"
    }

    async fn on_start(&mut self, ctx: &ActorContext) -> Result<()> {
        self.worker_id = format!("worker-{}", ctx.aid().simple());
        info!(worker_id = %self.worker_id, backlog = self.backlog, "worker started");
        Ok(())
    }

    async fn on_turn(&mut self, _ctx: &ActorContext) -> Result<()> {
        // Settle whatever finished since the last turn.
        while let Some(joined) = self.inflight.try_join_next() {
            self.settle(joined)?;
        }

        if self.inflight.len() >= self.backlog {
            // Saturated: wait for capacity instead of claiming more.
            match tokio::time::timeout(self.claim_timeout, self.inflight.join_next()).await {
                Ok(Some(joined)) => self.settle(joined)?,
                Ok(None) | Err(_) => {}
            }
            return Ok(());
        }

        match self.backend.claim(&self.worker_id, self.claim_timeout).await {
            Ok(Some(task)) => {
                self.backoff = CLAIM_BACKOFF_MIN;
                debug!(
                    worker_id = %self.worker_id,
                    task_id = %task.id,
                    job_name = %task.job_name,
                    "task claimed"
                );
                self.spawn_execution(task);
            }
            Ok(None) => {}
            Err(FlywheelError::BackendUnavailable(reason)) => {
                warn!(
                    worker_id = %self.worker_id,
                    backoff_ms = self.backoff.as_millis() as u64,
                    %reason,
                    "backend unavailable during claim"
                );
                tokio::time::sleep(self.backoff).await;
                self.backoff = (self.backoff * 2).min(CLAIM_BACKOFF_MAX);
            }
            Err(err) => {
                error!(worker_id = %self.worker_id, error = %err, "claim failed");
            }
        }
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ActorContext) {
        // Two-phase close: drain in-flight work, then cut the rest loose.
        let deadline = Instant::now() + self.close_timeout;
        while !self.inflight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.inflight.join_next()).await {
                Ok(Some(joined)) => {
                    // Self-termination is moot while stopping.
                    let _ = self.settle(joined);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        let residual = self.inflight.len();
        if residual > 0 {
            warn!(
                worker_id = %self.worker_id,
                count = residual,
                "aborting in-flight executions at close"
            );
            self.inflight.abort_all();
            while self.inflight.join_next().await.is_some() {}
        }
        if let Err(err) = self.backend.close(&self.worker_id).await {
            warn!(worker_id = %self.worker_id, error = %err, "backend close failed");
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    fn info(&self) -> serde_json::Value {
        let current = self.current_tasks();
        let mut info = json!({
            "worker_id": self.worker_id,
            "inflight": current.len(),
        });
        if let Some(first) = current.first() {
            info["current_task_id"] = json!(first);
        }
        info
    }
}

/// Builds worker actors for a pool.
pub struct WorkerFactory {
    backend: Arc<dyn TaskBackend>,
    registry: Arc<JobRegistry>,
}

impl WorkerFactory {
    pub fn new(backend: Arc<dyn TaskBackend>, registry: Arc<JobRegistry>) -> Self {
        Self { backend, registry }
    }
}

impl ActorFactory for WorkerFactory {
    fn actor_class(&self) -> &'static str {
        "worker"
    }

    fn build(&self, params: &SpawnParams) -> Box<dyn Actor> {
        Box::new(WorkerActor::new(
            self.backend.clone(),
            self.registry.clone(),
            params,
        ))
    }
}

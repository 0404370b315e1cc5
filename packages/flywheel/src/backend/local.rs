//! In-process task backend behind the `local://` scheme.
//!
//! One mutex guards the whole store; claimers block on a notify handle with
//! a deadline. Dispatch order is (priority descending, submission order), so
//! a single producer observes FIFO within a priority level.
//!
//! Claim leases are tracked per task. A worker that stops heartbeating for
//! longer than the miss window is presumed dead and its task fails with an
//! actor-died envelope; the sweep runs on every claim attempt and every
//! scheduler tick.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{SubmitOptions, TaskBackend};
use crate::config::Config;
use crate::error::{FlywheelError, Result};
use crate::job::JobRegistry;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskError, TaskErrorKind, TaskId, TaskStatus};

struct Claim {
    worker_id: String,
    last_beat: Instant,
}

/// Ready-queue key: priority is negated so the set's ascending order yields
/// higher priorities first, then submission order.
type ReadyKey = (i64, u64, TaskId);

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    ready: BTreeSet<ReadyKey>,
    delayed: BTreeSet<(DateTime<Utc>, TaskId)>,
    claims: HashMap<TaskId, Claim>,
    /// Submission sequence per still-queued task.
    order: HashMap<TaskId, u64>,
    next_seq: u64,
    scheduler: Scheduler,
}

impl State {
    fn enqueue(&mut self, mut task: Task, now: DateTime<Utc>) -> Result<TaskId> {
        task.transition(TaskStatus::Queued, now)?;
        let id = task.id.clone();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(id.clone(), seq);
        match task.eta.filter(|eta| *eta > now) {
            Some(eta) => {
                self.delayed.insert((eta, id.clone()));
            }
            None => {
                self.ready.insert((-i64::from(task.priority), seq, id.clone()));
            }
        }
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    fn remove_from_queues(&mut self, id: &str) {
        let Some((priority, eta)) = self.tasks.get(id).map(|t| (t.priority, t.eta)) else {
            self.order.remove(id);
            return;
        };
        if let Some(seq) = self.order.remove(id) {
            self.ready.remove(&(-i64::from(priority), seq, id.to_string()));
        }
        if let Some(eta) = eta {
            self.delayed.remove(&(eta, id.to_string()));
        }
    }

    fn expire(&mut self, id: &str, now: DateTime<Utc>) {
        self.remove_from_queues(id);
        if let Some(task) = self.tasks.get_mut(id) {
            if task.transition(TaskStatus::Revoked, now).is_ok() {
                task.error = Some(TaskError {
                    kind: TaskErrorKind::Revoked,
                    message: "expiry elapsed before start".into(),
                    backtrace: None,
                });
                debug!(task_id = %id, "task expired before start");
            }
        }
    }

    /// Promote due delayed tasks, revoke expired ones, and fail tasks whose
    /// claim lease ran past the miss window.
    fn sweep(&mut self, now: DateTime<Utc>, miss_window: Duration) {
        let due: Vec<(DateTime<Utc>, TaskId)> = self
            .delayed
            .iter()
            .take_while(|(at, _)| *at <= now)
            .cloned()
            .collect();
        for key in due {
            self.delayed.remove(&key);
            let (_, id) = key;
            let Some(task) = self.tasks.get(&id) else {
                self.order.remove(&id);
                continue;
            };
            if task.status != TaskStatus::Queued {
                self.order.remove(&id);
                continue;
            }
            let priority = task.priority;
            if let Some(seq) = self.order.get(&id).copied() {
                self.ready.insert((-i64::from(priority), seq, id));
            }
        }

        let expired: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Queued && t.expiry.is_some_and(|at| at <= now)
            })
            .map(|t| t.id.clone())
            .collect();
        for id in expired {
            self.expire(&id, now);
        }

        let stale: Vec<TaskId> = self
            .claims
            .iter()
            .filter(|(_, claim)| claim.last_beat.elapsed() > miss_window)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            let Some(claim) = self.claims.remove(&id) else {
                continue;
            };
            if let Some(task) = self.tasks.get_mut(&id) {
                if task.status == TaskStatus::Started
                    && task.transition(TaskStatus::Failure, now).is_ok()
                {
                    task.error = Some(TaskError::actor_died(&claim.worker_id));
                    warn!(
                        task_id = %id,
                        worker_id = %claim.worker_id,
                        "claim lease expired; failing task"
                    );
                }
            }
        }
    }

    /// Pop the next dispatchable task and start it under `worker_id`.
    fn pop_ready(&mut self, worker_id: &str, now: DateTime<Utc>) -> Option<Task> {
        while let Some(key) = self.ready.iter().next().cloned() {
            self.ready.remove(&key);
            let (_, _, id) = key;
            let Some(task) = self.tasks.get_mut(&id) else {
                self.order.remove(&id);
                continue;
            };
            if task.status != TaskStatus::Queued {
                self.order.remove(&id);
                continue;
            }
            if task.expiry.is_some_and(|at| at <= now) {
                if task.transition(TaskStatus::Revoked, now).is_ok() {
                    task.error = Some(TaskError {
                        kind: TaskErrorKind::Revoked,
                        message: "expiry elapsed before start".into(),
                        backtrace: None,
                    });
                }
                self.order.remove(&id);
                continue;
            }
            if let Err(err) = task.start(worker_id, now) {
                error!(task_id = %id, error = %err, "claim hit an invalid transition");
                self.order.remove(&id);
                continue;
            }
            let snapshot = task.clone();
            self.order.remove(&id);
            self.claims.insert(
                id,
                Claim {
                    worker_id: worker_id.to_string(),
                    last_beat: Instant::now(),
                },
            );
            return Some(snapshot);
        }
        None
    }
}

/// In-memory backend: a blocking queue plus the periodic scheduler.
pub struct LocalBackend {
    state: Mutex<State>,
    notify: Notify,
    jobs: Arc<JobRegistry>,
    miss_window: Duration,
}

impl LocalBackend {
    /// Open the backend. The scheduler is seeded from the registry's
    /// periodic jobs only when this process is the scheduling leader.
    pub fn open(cfg: &Config, jobs: Arc<JobRegistry>) -> Arc<Self> {
        let scheduler = if cfg.schedule_periodic {
            Scheduler::from_registry(&jobs, Utc::now())
        } else {
            Scheduler::empty()
        };
        Arc::new(Self {
            state: Mutex::new(State {
                scheduler,
                ..State::default()
            }),
            notify: Notify::new(),
            jobs,
            miss_window: cfg.heartbeat_miss_window(),
        })
    }
}

#[async_trait]
impl TaskBackend for LocalBackend {
    async fn submit(
        &self,
        job_name: &str,
        args: Value,
        kwargs: Value,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        if self.jobs.lookup(job_name).is_none() {
            return Err(FlywheelError::UnknownJob(job_name.to_string()));
        }
        let mut task = Task::new(job_name, args, kwargs);
        task.eta = options.eta;
        task.expiry = options.expiry;
        task.priority = options.priority;

        let now = Utc::now();
        let id = {
            let mut st = self.state.lock().await;
            st.enqueue(task, now)?
        };
        self.notify.notify_one();
        debug!(task_id = %id, job_name = %job_name, "task submitted");
        Ok(id)
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let st = self.state.lock().await;
        st.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| FlywheelError::NotFound(format!("task {id}")))
    }

    async fn claim(&self, worker_id: &str, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let next_eta;
            let more_ready;
            let popped = {
                let mut st = self.state.lock().await;
                let now = Utc::now();
                st.sweep(now, self.miss_window);
                let popped = st.pop_ready(worker_id, now);
                next_eta = st.delayed.iter().next().map(|(at, _)| *at);
                more_ready = !st.ready.is_empty();
                popped
            };
            if let Some(task) = popped {
                if more_ready {
                    // Chain the wakeup so a second waiter sees the rest.
                    self.notify.notify_one();
                }
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wake = deadline;
            if let Some(eta) = next_eta {
                let until = (eta - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wake = wake.min(now + until);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn publish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let now = Utc::now();
        let terminal = {
            let Some(task) = st.tasks.get_mut(task_id) else {
                return Err(FlywheelError::NotFound(format!("task {task_id}")));
            };
            task.transition(status, now)?;
            if result.is_some() {
                task.result = result;
            }
            if error.is_some() {
                task.error = error;
            }
            task.status.is_terminal()
        };
        if terminal {
            st.claims.remove(task_id);
            st.remove_from_queues(task_id);
        }
        Ok(())
    }

    async fn revoke(&self, task_id: &str) -> Result<bool> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let now = Utc::now();
        let status = st
            .tasks
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| FlywheelError::NotFound(format!("task {task_id}")))?;
        match status {
            TaskStatus::Pending | TaskStatus::Queued => {
                st.remove_from_queues(task_id);
                if let Some(task) = st.tasks.get_mut(task_id) {
                    task.transition(TaskStatus::Revoked, now)?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, task_id: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(claim) = st.claims.get_mut(task_id) {
            claim.last_beat = Instant::now();
        }
        Ok(())
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let fired = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            st.sweep(now, self.miss_window);

            let mut due = Vec::new();
            st.scheduler.tick(now, |name| due.push(name.to_string()));
            let fired = due.len();
            for name in due {
                let task = Task::new(&name, Value::Array(vec![]), Value::Object(Default::default()));
                if let Err(err) = st.enqueue(task, now) {
                    error!(job_name = %name, error = %err, "failed to enqueue periodic task");
                }
            }
            fired
        };
        for _ in 0..fired {
            self.notify.notify_one();
        }
        Ok(fired)
    }

    async fn next_run_at(&self) -> Option<DateTime<Utc>> {
        let st = self.state.lock().await;
        st.scheduler.next_run_at()
    }

    async fn next_scheduled(&self, job_names: Option<&[String]>) -> Vec<(String, DateTime<Utc>)> {
        let st = self.state.lock().await;
        st.scheduler.next_scheduled(job_names)
    }

    async fn close(&self, worker_id: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let now = Utc::now();
        let held: Vec<TaskId> = st
            .claims
            .iter()
            .filter(|(_, claim)| claim.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &held {
            st.claims.remove(id);
            if let Some(task) = st.tasks.get_mut(id) {
                if task.status == TaskStatus::Started
                    && task.transition(TaskStatus::Failure, now).is_ok()
                {
                    task.error = Some(TaskError::actor_died(worker_id));
                }
            }
        }
        if !held.is_empty() {
            warn!(
                worker_id = %worker_id,
                count = held.len(),
                "worker closed with unfinished claims"
            );
        }
        Ok(())
    }

    async fn queue_depth(&self) -> usize {
        let st = self.state.lock().await;
        st.ready.len() + st.delayed.len()
    }

    fn describe(&self) -> String {
        "local://".to_string()
    }
}

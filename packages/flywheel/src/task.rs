//! Task model: identity, status state machine, and the result envelope.
//!
//! A task is a single execution instance of a [`Job`](crate::job::Job). Its
//! status moves along
//!
//! ```text
//! Pending ──► Queued ──► Started ──► { Success | Failure | Revoked }
//!    │           │
//!    └───────────┴─────► Revoked
//! ```
//!
//! Terminal states are absorbing; transitions are monotonic and the backend
//! rejects anything else with `InvalidTransition`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlywheelError, Result};

/// Opaque unique task identifier (128-bit random, simple uuid form).
pub type TaskId = String;

/// Status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Queued,
    Started,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Revoked)
                | (Queued, Started)
                | (Queued, Revoked)
                | (Started, Success)
                | (Started, Failure)
                | (Started, Revoked)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Started => "started",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Revoked => "revoked",
        };
        write!(f, "{s}")
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The job body returned an error.
    Job,
    /// Execution exceeded the per-job timeout.
    Timeout,
    /// The executing worker died before publishing a result.
    ActorDied,
    /// The task was revoked before or during execution.
    Revoked,
}

/// The structured error envelope recorded on a failed task.
///
/// This is the only failure shape that crosses the backend; raw errors from
/// job bodies are captured here at the execution boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl TaskError {
    /// Envelope for an error returned by the job body.
    pub fn job(err: &anyhow::Error) -> Self {
        Self {
            kind: TaskErrorKind::Job,
            message: err.to_string(),
            backtrace: Some(format!("{err:?}")),
        }
    }

    /// Envelope for an execution that exceeded its timeout.
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: TaskErrorKind::Timeout,
            message: format!("execution exceeded timeout of {after:?}"),
            backtrace: None,
        }
    }

    /// Envelope for a task whose worker died mid-execution.
    pub fn actor_died(worker_id: &str) -> Self {
        Self {
            kind: TaskErrorKind::ActorDied,
            message: format!("worker {worker_id} died before publishing"),
            backtrace: None,
        }
    }
}

/// A single execution instance of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_name: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub status: TaskStatus,
    pub time_enqueued: Option<DateTime<Utc>>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_ended: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    /// Identity of the executing worker while the task is `Started`.
    pub worker: Option<String>,
    /// Earliest time the task may be dispatched.
    pub eta: Option<DateTime<Utc>>,
    /// Auto-revoke deadline: the task is revoked if not started by then.
    pub expiry: Option<DateTime<Utc>>,
    /// Higher values dispatch first; FIFO within equal priority.
    pub priority: i32,
}

impl Task {
    /// Create a fresh task in `Pending`.
    pub fn new(job_name: &str, args: serde_json::Value, kwargs: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            job_name: job_name.to_string(),
            args,
            kwargs,
            status: TaskStatus::Pending,
            time_enqueued: None,
            time_started: None,
            time_ended: None,
            result: None,
            error: None,
            worker: None,
            eta: None,
            expiry: None,
            priority: 0,
        }
    }

    /// Apply a status transition, stamping the matching timestamp.
    ///
    /// Rejects transitions the state machine does not permit and leaves the
    /// task unchanged in that case.
    pub fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(FlywheelError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        match to {
            TaskStatus::Queued => {
                if self.time_enqueued.is_none() {
                    self.time_enqueued = Some(now);
                }
            }
            TaskStatus::Started => self.time_started = Some(now),
            terminal if terminal.is_terminal() => self.time_ended = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Transition to `Started` under `worker_id`'s claim.
    pub fn start(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.worker = Some(worker_id.to_string());
        self.transition(TaskStatus::Started, now)
    }
}

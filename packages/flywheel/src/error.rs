//! Structured error types for the runtime and the task queue.
//!
//! `FlywheelError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. `anyhow` remains the ergonomic transport *inside* job
//! bodies; at the execution boundary job errors are captured into the
//! structured task-error envelope and never cross the backend as `anyhow`.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskStatus;

/// Structured error type for supervision and queue operations.
#[derive(Debug, Error)]
pub enum FlywheelError {
    /// Invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A job name that is not present in the registry.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// The task backend cannot be reached or opened.
    #[error("task backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A status transition that violates the task state machine.
    #[error("invalid transition {from} -> {to} for task {task_id}")]
    InvalidTransition {
        /// The task whose transition was rejected.
        task_id: String,
        /// Status the task currently holds.
        from: TaskStatus,
        /// Status the caller attempted to move to.
        to: TaskStatus,
    },

    /// A deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An actor exited or stopped responding.
    #[error("actor {0} died")]
    ActorDied(String),

    /// A monitor name collision on `add_monitor`.
    #[error("monitor already registered: {0}")]
    DuplicateMonitor(String),

    /// A task, job, or command that does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl FlywheelError {
    /// Process exit code for this error: 1 for configuration errors,
    /// 2 for unrecoverable supervision failures. The clean path is 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlywheelError::Config(_) => 1,
            _ => 2,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlywheelError>;

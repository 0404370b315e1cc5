//! Pluggable task backends, selected by URL scheme.
//!
//! A backend stores tasks and hands them to workers with at-most-once claim
//! semantics. Backends are opened through a [`BackendRegistry`] keyed by
//! scheme; the built-in `local://` backend is an in-process queue.
//!
//! ```text
//! submit ──► Pending ─► Queued ──► claim ──► Started ──► publish
//!                         │                    │
//!                     (eta holds back)     (lease heartbeats)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use crate::config::Config;
use crate::error::{FlywheelError, Result};
use crate::job::JobRegistry;
use crate::task::{Task, TaskError, TaskId, TaskStatus};

mod local;

pub use local::LocalBackend;

/// Options recognized by [`TaskBackend::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Earliest dispatch time; delays availability.
    pub eta: Option<DateTime<Utc>>,
    /// Auto-revoke deadline if the task has not started by then.
    pub expiry: Option<DateTime<Utc>>,
    /// Higher values dispatch first; FIFO within equal priority.
    pub priority: i32,
}

/// Storage and dispatch for tasks.
///
/// Implementations must be safe under concurrent `claim` and `publish`. A
/// task returned from `claim` is dispatched at most once: it reaches no
/// other caller unless it is relinquished with `publish(.., Revoked, ..)`
/// or the backend detects worker death through the lease miss window.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Validate `job_name`, allocate an id, and enqueue atomically.
    async fn submit(
        &self,
        job_name: &str,
        args: Value,
        kwargs: Value,
        options: SubmitOptions,
    ) -> Result<TaskId>;

    /// Snapshot of a task by id.
    async fn get_task(&self, id: &str) -> Result<Task>;

    /// Claim the next available task for `worker_id`, waiting up to
    /// `timeout`. `None` means the queue stayed empty.
    async fn claim(&self, worker_id: &str, timeout: Duration) -> Result<Option<Task>>;

    /// Record a status transition, with result or error payload.
    async fn publish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> Result<()>;

    /// Revoke a task that has not started. Returns whether it was revoked.
    async fn revoke(&self, task_id: &str) -> Result<bool>;

    /// Extend the claim lease of a running task.
    async fn heartbeat(&self, task_id: &str) -> Result<()>;

    /// Advance the periodic scheduler to `now`. Returns the number of
    /// periodic tasks enqueued.
    async fn tick(&self, now: DateTime<Utc>) -> Result<usize>;

    /// The scheduler's global minimum next-run time.
    async fn next_run_at(&self) -> Option<DateTime<Utc>>;

    /// Next-run times per periodic job, optionally filtered by name.
    async fn next_scheduled(&self, job_names: Option<&[String]>) -> Vec<(String, DateTime<Utc>)>;

    /// Relinquish every claim held by `worker_id`; its unfinished tasks
    /// fail with an actor-died envelope.
    async fn close(&self, worker_id: &str) -> Result<()>;

    /// Number of tasks waiting for dispatch (ready plus delayed).
    async fn queue_depth(&self) -> usize;

    /// Human-readable backend address for introspection payloads.
    fn describe(&self) -> String;
}

impl std::fmt::Debug for dyn TaskBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TaskBackend").field(&self.describe()).finish()
    }
}

/// Factory signature for a backend scheme.
pub type BackendFactory =
    Arc<dyn Fn(&Url, &Config, &Arc<JobRegistry>) -> Result<Arc<dyn TaskBackend>> + Send + Sync>;

/// Registry of backend factories keyed by URL scheme.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// A registry with the built-in `local://` backend installed.
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("local", |_url, cfg, jobs| {
            Ok(LocalBackend::open(cfg, jobs.clone()))
        });
        registry
    }

    /// Register a factory for `scheme`, replacing any existing one.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Url, &Config, &Arc<JobRegistry>) -> Result<Arc<dyn TaskBackend>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(scheme.to_string(), Arc::new(factory));
    }

    /// Parse `cfg.task_backend` and open the matching backend.
    pub fn open(&self, cfg: &Config, jobs: &Arc<JobRegistry>) -> Result<Arc<dyn TaskBackend>> {
        let url = Url::parse(&cfg.task_backend).map_err(|e| {
            FlywheelError::BackendUnavailable(format!(
                "invalid backend url {:?}: {e}",
                cfg.task_backend
            ))
        })?;
        let factory = self.factories.get(url.scheme()).ok_or_else(|| {
            FlywheelError::BackendUnavailable(format!(
                "no backend registered for scheme {:?}",
                url.scheme()
            ))
        })?;
        factory(&url, cfg, jobs)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobGroup;

    fn empty_jobs() -> Arc<JobRegistry> {
        Arc::new(JobRegistry::build(vec![JobGroup::new("none")], &[]).unwrap())
    }

    #[test]
    fn builtin_local_scheme_opens() {
        let registry = BackendRegistry::with_builtin();
        let cfg = Config::default();
        let backend = registry.open(&cfg, &empty_jobs()).unwrap();
        assert_eq!(backend.describe(), "local://");
    }

    #[test]
    fn unknown_scheme_is_unavailable() {
        let registry = BackendRegistry::with_builtin();
        let cfg = Config::builder().task_backend("amqp://broker:5672").build();
        let err = registry.open(&cfg, &empty_jobs()).unwrap_err();
        assert!(matches!(err, FlywheelError::BackendUnavailable(_)));
    }

    #[test]
    fn garbage_url_is_unavailable() {
        let registry = BackendRegistry::with_builtin();
        let cfg = Config::builder().task_backend("not a url").build();
        let err = registry.open(&cfg, &empty_jobs()).unwrap_err();
        assert!(matches!(err, FlywheelError::BackendUnavailable(_)));
    }

    #[test]
    fn custom_scheme_can_be_registered() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register("mock", |_url, cfg, jobs| {
            Ok(LocalBackend::open(cfg, jobs.clone()))
        });
        let cfg = Config::builder().task_backend("mock://anywhere").build();
        assert!(registry.open(&cfg, &empty_jobs()).is_ok());
    }
}

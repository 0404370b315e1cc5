//! Runtime configuration consumed by the arbiter, monitors, and backend.
//!
//! File parsing and command-line flags live outside the core; this is the
//! plain value the core consumes. Timing knobs default to the supervision
//! constants and only need overriding in tests or unusual deployments.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::actor::HEARTBEAT_TIMEOUT;
use crate::monitor::CLOSE_TIMEOUT;

/// Worker isolation model.
///
/// `Thread` runs actors as tasks on the shared multi-thread runtime.
/// `Process` gives each actor a dedicated OS thread with its own
/// single-thread runtime; forced termination in that mode is cooperative
/// (terminate token plus join deadline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    #[default]
    Thread,
    Process,
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Thread => write!(f, "thread"),
            Concurrency::Process => write!(f, "process"),
        }
    }
}

/// Configuration for a task-queue process.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Config {
    /// Backend URL; the scheme selects the backend factory.
    #[builder(default = "local://".to_string(), setter(into))]
    pub task_backend: String,

    /// Job registration groups to enable. A trailing `.*` (or a bare `*`)
    /// enables every group nested under the dotted prefix.
    #[builder(default)]
    pub task_paths: Vec<String>,

    /// Whether this process schedules periodic jobs. Exactly one process in
    /// a deployment should carry this flag; workers always have it forced
    /// off at spawn.
    #[builder(default = false)]
    pub schedule_periodic: bool,

    /// Max concurrent in-flight tasks per worker.
    #[builder(default = 5)]
    pub backlog: usize,

    /// Default per-task execution timeout, used when the job declares none.
    #[builder(default = Duration::from_secs(600))]
    pub timeout: Duration,

    /// Worker isolation model.
    #[builder(default)]
    pub concurrency: Concurrency,

    /// Number of worker actors a worker pool maintains.
    #[builder(default = 1)]
    pub num_workers: usize,

    /// How long a worker blocks on a single claim attempt.
    #[builder(default = Duration::from_millis(500))]
    pub claim_timeout: Duration,

    /// Cadence of the monitor maintenance cycle.
    #[builder(default = Duration::from_millis(100))]
    pub maintenance_interval: Duration,

    /// Heartbeat staleness beyond which an actor is eligible for
    /// termination by its monitor.
    #[builder(default = HEARTBEAT_TIMEOUT)]
    pub heartbeat_timeout: Duration,

    /// Grace period for draining in-flight work on stop.
    #[builder(default = CLOSE_TIMEOUT)]
    pub close_timeout: Duration,

    /// Claim-lease miss window; `None` means twice the claim timeout.
    #[builder(default, setter(strip_option))]
    pub heartbeat_miss: Option<Duration>,
}

impl Config {
    /// The effective claim-lease miss window.
    pub fn heartbeat_miss_window(&self) -> Duration {
        self.heartbeat_miss.unwrap_or(self.claim_timeout * 2)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

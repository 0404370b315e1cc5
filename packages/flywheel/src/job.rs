//! Job declarations, registration groups, and the immutable registry.
//!
//! A [`Job`] is declarative work code identified by a unique name. Jobs are
//! registered into named [`JobGroup`]s at startup and the `task_paths`
//! configuration selects which groups a process enables; a trailing `.*`
//! enables a whole dotted subtree of groups. The built [`JobRegistry`] is
//! immutable.
//!
//! A job that declares a [`Schedule`] is periodic: the scheduler converts
//! its cadence into submitted tasks on each tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{FlywheelError, Result};
use crate::task::Task;

/// Cadence of a periodic job.
///
/// `next_after(now)` yields the next fire time given "now"; the scheduler
/// uses [`Schedule::advance`] to step from the previously *scheduled* target
/// so actual fire jitter never compounds into drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    period: chrono::Duration,
}

impl Schedule {
    /// Fire every `period`, anchored at the instant the scheduler starts.
    pub fn every(period: Duration) -> Self {
        let period = chrono::Duration::from_std(period)
            .unwrap_or_else(|_| chrono::Duration::days(365_000));
        Self { period }
    }

    pub fn period(&self) -> chrono::Duration {
        self.period
    }

    /// Next fire strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.period
    }

    /// Step from the previously scheduled `target` to the next fire past
    /// `now`. A missed window collapses to a single upcoming fire.
    pub fn advance(&self, target: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut next = target + self.period;
        if next <= now {
            let millis = self.period.num_milliseconds().max(1);
            let missed = (now - target).num_milliseconds() / millis;
            next = target + self.period * (missed as i32 + 1);
            if next <= now {
                next = next + self.period;
            }
        }
        next
    }
}

/// A named unit of work code.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Unique job name; the registry key.
    fn name(&self) -> &str;

    /// Per-task execution timeout. `None` falls back to the configured
    /// default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Periodic cadence. `Some` marks this job periodic.
    fn schedule(&self) -> Option<Schedule> {
        None
    }

    /// Execute one task. Errors are captured into the task's failure
    /// envelope; the worker keeps running.
    async fn run(
        &self,
        task: &Task,
        args: &serde_json::Value,
        kwargs: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Job").field(&self.name()).finish()
    }
}

/// A named registration group of jobs.
///
/// Groups replace reflective module discovery: each deployment constructs
/// its groups explicitly and `task_paths` selects which ones are live.
pub struct JobGroup {
    name: String,
    jobs: Vec<Arc<dyn Job>>,
}

impl JobGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
        }
    }

    /// Add a job to the group.
    pub fn register(mut self, job: impl Job) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn path_matches(path: &str, group: &str) -> bool {
    if path == "*" {
        return true;
    }
    if let Some(prefix) = path.strip_suffix(".*") {
        return group == prefix || group.starts_with(&format!("{prefix}."));
    }
    path == group
}

/// Immutable index of enabled jobs, keyed by name.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    /// Build the registry from `groups`, enabling those selected by
    /// `task_paths`. Duplicate job names and paths matching no group are
    /// configuration errors.
    pub fn build(groups: Vec<JobGroup>, task_paths: &[String]) -> Result<Self> {
        let mut enabled = vec![false; groups.len()];
        for path in task_paths {
            let mut hit = false;
            for (i, group) in groups.iter().enumerate() {
                if path_matches(path, group.name()) {
                    enabled[i] = true;
                    hit = true;
                }
            }
            if !hit {
                return Err(FlywheelError::Config(format!(
                    "task path {path:?} matches no registered job group"
                )));
            }
        }

        let mut jobs: BTreeMap<String, Arc<dyn Job>> = BTreeMap::new();
        for (group, _) in groups.into_iter().zip(&enabled).filter(|(_, on)| **on) {
            for job in group.jobs {
                let name = job.name().to_string();
                if jobs.insert(name.clone(), job).is_some() {
                    return Err(FlywheelError::Config(format!(
                        "duplicate job name: {name}"
                    )));
                }
            }
        }
        Ok(Self { jobs })
    }

    /// Look up a job by name.
    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn Job>> {
        self.jobs.get(name)
    }

    /// All periodic jobs, in stable order by name.
    pub fn periodic(&self) -> impl Iterator<Item = &Arc<dyn Job>> {
        self.jobs.values().filter(|job| job.schedule().is_some())
    }

    /// All registered job names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

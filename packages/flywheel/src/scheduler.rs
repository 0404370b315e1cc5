//! Periodic scheduler: a tick loop over a time-ordered entry set.
//!
//! The scheduler never owns a thread. It lives inside the task backend and
//! is advanced from the monitor's maintenance cycle: whenever `now` passes
//! [`Scheduler::next_run_at`], a tick drains every due entry, submits one
//! task per entry (ties break lexicographically by job name through the set
//! ordering), and reinserts each entry advanced past `now`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::job::{JobRegistry, Schedule};

/// Time-ordered view of `(next_run_at, job_name)` entries.
#[derive(Debug, Default)]
pub struct Scheduler {
    entries: BTreeSet<(DateTime<Utc>, String)>,
    schedules: BTreeMap<String, Schedule>,
}

impl Scheduler {
    /// A scheduler with no entries; `tick` is a no-op. Used by processes
    /// that only consume tasks.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seed entries from every periodic job in the registry, anchoring each
    /// first fire one period after `now`.
    pub fn from_registry(registry: &JobRegistry, now: DateTime<Utc>) -> Self {
        let mut scheduler = Self::default();
        for job in registry.periodic() {
            if let Some(schedule) = job.schedule() {
                let name = job.name().to_string();
                scheduler.entries.insert((schedule.next_after(now), name.clone()));
                scheduler.schedules.insert(name, schedule);
            }
        }
        scheduler
    }

    /// Drain all entries due at `now`, invoking `submit` once per fire, and
    /// reinsert each at its next scheduled target. Returns the fire count.
    pub fn tick<F>(&mut self, now: DateTime<Utc>, mut submit: F) -> usize
    where
        F: FnMut(&str),
    {
        let mut fired = 0;
        loop {
            let due = match self.entries.iter().next() {
                Some((at, name)) if *at <= now => (*at, name.clone()),
                _ => break,
            };
            self.entries.remove(&due);
            let (target, name) = due;
            submit(&name);
            fired += 1;
            if let Some(schedule) = self.schedules.get(&name) {
                self.entries.insert((schedule.advance(target, now), name));
            }
        }
        fired
    }

    /// The global minimum next-run time, if any entry exists.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().next().map(|(at, _)| *at)
    }

    /// Next-run times per job, sorted by name, optionally filtered.
    pub fn next_scheduled(&self, job_names: Option<&[String]>) -> Vec<(String, DateTime<Utc>)> {
        let mut per_job: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for (at, name) in &self.entries {
            per_job.entry(name).or_insert(*at);
        }
        per_job
            .into_iter()
            .filter(|(name, _)| match job_names {
                Some(filter) => filter.iter().any(|f| f == name),
                None => true,
            })
            .map(|(name, at)| (name.to_string(), at))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::{Job, JobGroup, Schedule};
    use crate::task::Task;
    use async_trait::async_trait;

    struct Beat {
        name: &'static str,
        period: Duration,
    }

    #[async_trait]
    impl Job for Beat {
        fn name(&self) -> &str {
            self.name
        }

        fn schedule(&self) -> Option<Schedule> {
            Some(Schedule::every(self.period))
        }

        async fn run(
            &self,
            _task: &Task,
            _args: &serde_json::Value,
            _kwargs: &serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    fn registry_with(periods: &[(&'static str, u64)]) -> JobRegistry {
        let mut group = JobGroup::new("beats");
        for &(name, secs) in periods {
            group = group.register(Beat {
                name,
                period: Duration::from_secs(secs),
            });
        }
        JobRegistry::build(vec![group], &["beats".to_string()]).unwrap()
    }

    #[test]
    fn empty_scheduler_never_fires() {
        let mut scheduler = Scheduler::empty();
        assert_eq!(scheduler.next_run_at(), None);
        assert_eq!(scheduler.tick(Utc::now(), |_| panic!("fired")), 0);
    }

    #[test]
    fn first_fire_is_one_period_after_seeding() {
        let registry = registry_with(&[("pulse", 10)]);
        let t0 = Utc::now();
        let scheduler = Scheduler::from_registry(&registry, t0);
        assert_eq!(
            scheduler.next_run_at(),
            Some(t0 + chrono::Duration::seconds(10))
        );
    }

    #[test]
    fn tick_drains_only_due_entries() {
        let registry = registry_with(&[("fast", 1), ("slow", 60)]);
        let t0 = Utc::now();
        let mut scheduler = Scheduler::from_registry(&registry, t0);

        let mut fired = Vec::new();
        let n = scheduler.tick(t0 + chrono::Duration::seconds(2), |name| {
            fired.push(name.to_string());
        });
        assert_eq!(n, 1);
        assert_eq!(fired, vec!["fast"]);
    }

    #[test]
    fn simultaneous_fires_break_ties_by_name() {
        let registry = registry_with(&[("zeta", 5), ("alpha", 5)]);
        let t0 = Utc::now();
        let mut scheduler = Scheduler::from_registry(&registry, t0);

        let mut fired = Vec::new();
        scheduler.tick(t0 + chrono::Duration::seconds(5), |name| {
            fired.push(name.to_string());
        });
        assert_eq!(fired, vec!["alpha", "zeta"]);
    }

    #[test]
    fn repeated_ticks_fire_once_per_period() {
        let registry = registry_with(&[("pulse", 1)]);
        let t0 = Utc::now();
        let mut scheduler = Scheduler::from_registry(&registry, t0);

        let mut total = 0;
        for half_secs in 2..=7 {
            let now = t0 + chrono::Duration::milliseconds(half_secs * 500);
            total += scheduler.tick(now, |_| {});
        }
        // 3.5 seconds of half-second ticks on a 1 s cadence: fires at 1, 2, 3.
        assert_eq!(total, 3);
    }

    #[test]
    fn missed_windows_fire_once_not_in_a_burst() {
        let registry = registry_with(&[("pulse", 1)]);
        let t0 = Utc::now();
        let mut scheduler = Scheduler::from_registry(&registry, t0);

        // No ticks for 30 seconds, then one tick: exactly one fire.
        let n = scheduler.tick(t0 + chrono::Duration::seconds(30), |_| {});
        assert_eq!(n, 1);
        // And the next entry is in the future, on the original grid.
        let next = scheduler.next_run_at().unwrap();
        assert!(next > t0 + chrono::Duration::seconds(30));
    }

    #[test]
    fn next_scheduled_filters_and_sorts() {
        let registry = registry_with(&[("zeta", 10), ("alpha", 20)]);
        let t0 = Utc::now();
        let scheduler = Scheduler::from_registry(&registry, t0);

        let all = scheduler.next_scheduled(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "alpha");
        assert_eq!(all[1].0, "zeta");

        let only = scheduler.next_scheduled(Some(&["zeta".to_string()]));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].0, "zeta");
    }
}

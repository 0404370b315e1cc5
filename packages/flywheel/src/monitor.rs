//! Monitors: supervisors that keep a fixed-size pool of one actor class.
//!
//! Each maintenance cycle reaps dead actors, probes the rest for
//! responsiveness, spawns up to the configured size, trims any excess
//! (oldest first), and finally runs the subclass hook. For a task-queue
//! pool the hook advances the periodic scheduler when its next-run time
//! has passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::actor::{spawn_actor, ActorFactory, ActorProxy, Aid, SpawnParams};
use crate::arbiter::ActorIndex;
use crate::backend::TaskBackend;
use crate::config::{Concurrency, Config};

/// Grace period for draining actors before forced termination.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to wait for a dead actor to join while reaping.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Subclass hook run at the end of every maintenance cycle.
#[async_trait]
pub trait MonitorHook: Send + Sync {
    async fn monitor_task(&self);
}

/// Task-queue hook: advance the scheduler whenever its next-run time has
/// passed. Only the scheduling leader's backend carries schedule entries,
/// so follower monitors fall through without work.
pub struct SchedulerHook {
    backend: Arc<dyn TaskBackend>,
}

impl SchedulerHook {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl MonitorHook for SchedulerHook {
    async fn monitor_task(&self) {
        let Some(next_run) = self.backend.next_run_at().await else {
            return;
        };
        let now = Utc::now();
        if next_run > now {
            return;
        }
        match self.backend.tick(now).await {
            Ok(count) if count > 0 => {
                debug!(count, "periodic tasks enqueued");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "scheduler tick failed"),
        }
    }
}

/// Maintains `num_actors` live actors of one class.
pub struct Monitor {
    name: String,
    factory: Arc<dyn ActorFactory>,
    num_actors: usize,
    concurrency: Concurrency,
    actors: HashMap<Aid, ActorProxy>,
    next_age: u64,
    spawning: usize,
    /// Registration order within the arbiter.
    age: u64,
    hook: Option<Arc<dyn MonitorHook>>,
    spawn_params: SpawnParams,
    heartbeat_timeout: Duration,
    close_timeout: Duration,
    index: ActorIndex,
    ioqueue: Option<Arc<dyn TaskBackend>>,
}

impl Monitor {
    pub(crate) fn new(
        name: String,
        factory: Arc<dyn ActorFactory>,
        num_actors: usize,
        age: u64,
        cfg: &Config,
        hook: Option<Arc<dyn MonitorHook>>,
        index: ActorIndex,
        ioqueue: Option<Arc<dyn TaskBackend>>,
    ) -> Self {
        let mut spawn_params = SpawnParams::from_config(cfg);
        // Workers never schedule; only the monitor's hook does.
        spawn_params.schedule_periodic = false;
        Self {
            name,
            factory,
            num_actors,
            concurrency: cfg.concurrency,
            actors: HashMap::new(),
            next_age: 0,
            spawning: 0,
            age,
            hook,
            spawn_params,
            heartbeat_timeout: cfg.heartbeat_timeout,
            close_timeout: cfg.close_timeout,
            index,
            ioqueue,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn live_count(&self) -> usize {
        self.actors.len()
    }

    pub(crate) fn spawn_params(&self) -> &SpawnParams {
        &self.spawn_params
    }

    /// Aids of the currently managed actors.
    pub fn aids(&self) -> Vec<Aid> {
        self.actors.keys().copied().collect()
    }

    pub(crate) fn proxy(&self, aid: &Aid) -> Option<&ActorProxy> {
        self.actors.get(aid)
    }

    /// One pool maintenance cycle: reap, probe, spawn, trim, hook.
    pub async fn maintain(&mut self) {
        self.reap().await;
        self.probe();
        self.spawn_missing();
        self.trim().await;
        if let Some(hook) = self.hook.clone() {
            hook.monitor_task().await;
        }
    }

    /// Drop actors whose task or thread has finished.
    async fn reap(&mut self) {
        let dead: Vec<Aid> = self
            .actors
            .iter()
            .filter(|(_, proxy)| !proxy.is_alive())
            .map(|(aid, _)| *aid)
            .collect();
        for aid in dead {
            if let Some(mut proxy) = self.actors.remove(&aid) {
                if !proxy.join(JOIN_TIMEOUT).await {
                    warn!(aid = %aid, monitor = %self.name, "dead actor did not join");
                }
                self.index.remove(&aid);
                debug!(aid = %aid, monitor = %self.name, "reaped dead actor");
            }
        }
    }

    /// Terminate live actors whose heartbeat has gone stale.
    fn probe(&mut self) {
        for proxy in self.actors.values() {
            if !proxy.is_responsive() {
                warn!(
                    aid = %proxy.aid(),
                    monitor = %self.name,
                    "actor unresponsive; terminating"
                );
                proxy.terminate();
            }
        }
    }

    /// Spawn up to the configured pool size. Spawning is serialized by the
    /// `spawning` counter so one cycle cannot start a second batch.
    fn spawn_missing(&mut self) {
        let live = self.actors.len();
        if live >= self.num_actors || self.spawning > 0 {
            return;
        }
        let missing = self.num_actors - live;
        self.spawning = missing;
        for _ in 0..missing {
            let age = self.next_age;
            self.next_age += 1;
            match spawn_actor(
                self.factory.as_ref(),
                &self.spawn_params,
                age,
                self.concurrency,
                self.heartbeat_timeout,
            ) {
                Ok(proxy) => {
                    self.index
                        .insert(proxy.aid(), &self.name, proxy.control_sender());
                    self.actors.insert(proxy.aid(), proxy);
                }
                Err(err) => {
                    error!(monitor = %self.name, error = %err, "actor spawn failed");
                }
            }
            self.spawning -= 1;
        }
    }

    /// Stop the oldest actors when the pool has grown past its size.
    async fn trim(&mut self) {
        if self.actors.len() <= self.num_actors {
            return;
        }
        let excess = self.actors.len() - self.num_actors;
        let mut by_age: Vec<(u64, Aid)> = self
            .actors
            .values()
            .map(|proxy| (proxy.age(), proxy.aid()))
            .collect();
        by_age.sort_unstable();
        for (_, aid) in by_age.into_iter().take(excess) {
            if let Some(proxy) = self.actors.get(&aid) {
                debug!(aid = %aid, monitor = %self.name, "trimming excess actor");
                proxy.stop().await;
            }
        }
    }

    /// Two-phase close: ask every actor to stop, deadline-poll the pool
    /// empty, then terminate whatever remains.
    pub async fn close_actors(&mut self) {
        for proxy in self.actors.values() {
            proxy.stop().await;
        }
        let deadline = Instant::now() + self.close_timeout;
        loop {
            self.reap().await;
            if self.actors.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let residual = self.actors.len();
        warn!(
            monitor = %self.name,
            count = residual,
            "could not stop all actors; terminating the rest"
        );
        let drained: Vec<(Aid, ActorProxy)> = self.actors.drain().collect();
        for (aid, mut proxy) in drained {
            proxy.terminate();
            proxy.join(JOIN_TIMEOUT).await;
            self.index.remove(&aid);
        }
    }

    /// Introspection payload for this pool; worker entries are proxy-side
    /// snapshots enriched with actor-reported fields when the actor answers
    /// quickly.
    pub async fn info(&self) -> serde_json::Value {
        let mut workers = Vec::with_capacity(self.actors.len());
        let mut by_age: Vec<&ActorProxy> = self.actors.values().collect();
        by_age.sort_unstable_by_key(|proxy| proxy.age());
        for proxy in by_age {
            let mut entry = proxy.snapshot();
            if let Ok(serde_json::Value::Object(extra)) =
                proxy.info(Duration::from_millis(250)).await
            {
                if let Some(fields) = entry.as_object_mut() {
                    for (key, value) in extra {
                        fields.entry(key).or_insert(value);
                    }
                }
            }
            workers.push(entry);
        }

        let mut info = json!({
            "name": self.name,
            "actor_class": self.factory.actor_class(),
            "num_actors": self.num_actors,
            "concurrency": self.concurrency.to_string(),
            "age": self.age,
            "workers": workers,
        });
        if let Some(backend) = &self.ioqueue {
            info["ioqueue"] = json!(backend.describe());
            info["ioqueue_size"] = json!(backend.queue_depth().await);
        }
        info
    }
}

//! The arbiter: root supervisor and control plane.
//!
//! ```text
//! ArbiterHandle (ping / echo / quit / info / next_scheduled / call)
//!     │  mpsc + oneshot, transport-neutral
//!     ▼
//! Arbiter.serve() loop
//!     ├─► control requests (priority)
//!     └─► maintenance interval ──► Monitor.maintain() per monitor
//!                                      └─► worker pools, scheduler hook
//! ```
//!
//! The arbiter owns its monitors in registration order; `quit` drains them
//! sequentially in that order. It also keeps the global actor index used
//! for introspection and message routing; actors belong to exactly one
//! monitor's pool.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::actor::{ActorFactory, Aid, Control};
use crate::backend::{BackendRegistry, TaskBackend};
use crate::config::Config;
use crate::error::{FlywheelError, Result};
use crate::job::{JobGroup, JobRegistry};
use crate::monitor::{Monitor, MonitorHook, SchedulerHook};
use crate::worker::WorkerFactory;

struct IndexEntry {
    monitor: String,
    control: mpsc::Sender<Control>,
}

/// Global `aid → (monitor, control channel)` index.
///
/// Monitors write their own entries; readers get snapshots. The index is a
/// lookup surface only; the owning monitor keeps the real proxy.
#[derive(Clone, Default)]
pub struct ActorIndex {
    inner: Arc<RwLock<HashMap<Aid, IndexEntry>>>,
}

impl ActorIndex {
    pub(crate) fn insert(&self, aid: Aid, monitor: &str, control: mpsc::Sender<Control>) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(
                aid,
                IndexEntry {
                    monitor: monitor.to_string(),
                    control,
                },
            );
        }
    }

    pub(crate) fn remove(&self, aid: &Aid) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(aid);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The pool an actor belongs to.
    pub fn monitor_of(&self, aid: &Aid) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(aid).map(|entry| entry.monitor.clone()))
    }

    /// Control channel for routing a message to an actor.
    pub fn control_of(&self, aid: &Aid) -> Option<mpsc::Sender<Control>> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(aid).map(|entry| entry.control.clone()))
    }
}

/// Execution context handed to registered control commands.
#[derive(Clone)]
pub struct CommandContext {
    pub backend: Arc<dyn TaskBackend>,
    pub registry: Arc<JobRegistry>,
}

type CommandFn = Box<
    dyn Fn(CommandContext, Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Transport-neutral control-plane requests.
pub enum ControlRequest {
    Ping {
        reply: oneshot::Sender<String>,
    },
    Echo {
        message: String,
        reply: oneshot::Sender<String>,
    },
    Quit {
        reply: oneshot::Sender<bool>,
    },
    Info {
        reply: oneshot::Sender<Value>,
    },
    NextScheduled {
        job_names: Option<Vec<String>>,
        reply: oneshot::Sender<Vec<(String, DateTime<Utc>)>>,
    },
    Command {
        name: String,
        args: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
}

/// Builds an [`Arbiter`]: job groups, backend schemes, and named control
/// commands are all registered before `build`.
pub struct ArbiterBuilder {
    config: Config,
    groups: Vec<JobGroup>,
    backends: BackendRegistry,
    commands: HashMap<String, CommandFn>,
}

impl ArbiterBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            groups: Vec::new(),
            backends: BackendRegistry::with_builtin(),
            commands: HashMap::new(),
        }
    }

    /// Register a job group.
    pub fn group(mut self, group: JobGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Register a backend factory for a URL scheme.
    pub fn backend<F>(mut self, scheme: &str, factory: F) -> Self
    where
        F: Fn(&url::Url, &Config, &Arc<JobRegistry>) -> Result<Arc<dyn TaskBackend>>
            + Send
            + Sync
            + 'static,
    {
        self.backends.register(scheme, factory);
        self
    }

    /// Register a named control-plane command.
    pub fn command<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CommandContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.commands.insert(
            name.into(),
            Box::new(move |ctx, args| Box::pin(handler(ctx, args))),
        );
        self
    }

    /// Build the registry, open the backend, and assemble the arbiter.
    pub fn build(self) -> Result<Arbiter> {
        let registry = Arc::new(JobRegistry::build(self.groups, &self.config.task_paths)?);
        let backend = self.backends.open(&self.config, &registry)?;
        let (control_tx, control_rx) = mpsc::channel(64);
        Ok(Arbiter {
            config: self.config,
            registry,
            backend,
            monitors: Vec::new(),
            index: ActorIndex::default(),
            commands: self.commands,
            control_tx,
            control_rx,
            started: Instant::now(),
        })
    }
}

/// Root supervisor: hosts monitors and serves the control plane.
pub struct Arbiter {
    config: Config,
    registry: Arc<JobRegistry>,
    backend: Arc<dyn TaskBackend>,
    monitors: Vec<Monitor>,
    index: ActorIndex,
    commands: HashMap<String, CommandFn>,
    control_tx: mpsc::Sender<ControlRequest>,
    control_rx: mpsc::Receiver<ControlRequest>,
    started: Instant,
}

impl Arbiter {
    pub fn builder(config: Config) -> ArbiterBuilder {
        ArbiterBuilder::new(config)
    }

    /// A cloneable client for the control plane.
    pub fn handle(&self) -> ArbiterHandle {
        ArbiterHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn backend(&self) -> Arc<dyn TaskBackend> {
        self.backend.clone()
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn index(&self) -> ActorIndex {
        self.index.clone()
    }

    /// Add a monitor for an arbitrary actor class.
    pub fn add_monitor(
        &mut self,
        name: &str,
        factory: Arc<dyn ActorFactory>,
        num_actors: usize,
    ) -> Result<()> {
        self.add_monitor_with(name, factory, num_actors, None, None)
    }

    /// Add a worker pool consuming the task backend. When this process is
    /// the scheduling leader the pool's hook also drives the scheduler.
    pub fn add_worker_pool(&mut self, name: &str) -> Result<()> {
        let factory = Arc::new(WorkerFactory::new(self.backend.clone(), self.registry.clone()));
        let hook: Option<Arc<dyn MonitorHook>> = if self.config.schedule_periodic {
            Some(Arc::new(SchedulerHook::new(self.backend.clone())))
        } else {
            None
        };
        self.add_monitor_with(
            name,
            factory,
            self.config.num_workers,
            hook,
            Some(self.backend.clone()),
        )
    }

    fn add_monitor_with(
        &mut self,
        name: &str,
        factory: Arc<dyn ActorFactory>,
        num_actors: usize,
        hook: Option<Arc<dyn MonitorHook>>,
        ioqueue: Option<Arc<dyn TaskBackend>>,
    ) -> Result<()> {
        if self.monitors.iter().any(|monitor| monitor.name() == name) {
            return Err(FlywheelError::DuplicateMonitor(name.to_string()));
        }
        let age = self.monitors.len() as u64;
        self.monitors.push(Monitor::new(
            name.to_string(),
            factory,
            num_actors,
            age,
            &self.config,
            hook,
            self.index.clone(),
            ioqueue,
        ));
        info!(monitor = %name, num_actors, "monitor added");
        Ok(())
    }

    /// Serve monitors and the control plane until `quit`.
    pub async fn serve(mut self) -> Result<()> {
        info!(monitors = self.monitors.len(), "arbiter serving");
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                request = self.control_rx.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request).await {
                            break;
                        }
                    }
                    None => {
                        // Every handle dropped; nothing can reach us anymore.
                        self.shutdown().await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    for monitor in &mut self.monitors {
                        monitor.maintain().await;
                    }
                }
            }
        }
        info!("arbiter stopped");
        Ok(())
    }

    /// Drain monitors sequentially in registration order.
    async fn shutdown(&mut self) {
        for monitor in &mut self.monitors {
            debug!(monitor = %monitor.name(), "closing monitor");
            monitor.close_actors().await;
        }
    }

    /// Returns `false` when the arbiter should stop serving.
    async fn handle_request(&mut self, request: ControlRequest) -> bool {
        match request {
            ControlRequest::Ping { reply } => {
                let _ = reply.send("pong".to_string());
            }
            ControlRequest::Echo { message, reply } => {
                let _ = reply.send(message);
            }
            ControlRequest::Quit { reply } => {
                self.shutdown().await;
                let _ = reply.send(true);
                return false;
            }
            ControlRequest::Info { reply } => {
                let mut monitors = Vec::with_capacity(self.monitors.len());
                for monitor in &self.monitors {
                    monitors.push(monitor.info().await);
                }
                let payload = json!({
                    "monitors": monitors,
                    "server": {
                        "version": env!("CARGO_PKG_VERSION"),
                        "actors": self.index.len(),
                        "uptime_ms": self.started.elapsed().as_millis() as u64,
                    },
                });
                let _ = reply.send(payload);
            }
            ControlRequest::NextScheduled { job_names, reply } => {
                let scheduled = self.backend.next_scheduled(job_names.as_deref()).await;
                let _ = reply.send(scheduled);
            }
            ControlRequest::Command { name, args, reply } => {
                let result = match self.commands.get(&name) {
                    Some(handler) => {
                        let ctx = CommandContext {
                            backend: self.backend.clone(),
                            registry: self.registry.clone(),
                        };
                        handler(ctx, args).await
                    }
                    None => {
                        warn!(command = %name, "unknown control command");
                        Err(FlywheelError::NotFound(format!("command {name}")))
                    }
                };
                let _ = reply.send(result);
            }
        }
        true
    }
}

/// Cloneable control-plane client.
#[derive(Clone)]
pub struct ArbiterHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ArbiterHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| FlywheelError::ActorDied("arbiter".to_string()))?;
        rx.await
            .map_err(|_| FlywheelError::ActorDied("arbiter".to_string()))
    }

    pub async fn ping(&self) -> Result<String> {
        self.request(|reply| ControlRequest::Ping { reply }).await
    }

    pub async fn echo(&self, message: impl Into<String>) -> Result<String> {
        let message = message.into();
        self.request(|reply| ControlRequest::Echo { message, reply })
            .await
    }

    /// Ask the arbiter to drain its monitors and stop.
    pub async fn quit(&self) -> Result<bool> {
        self.request(|reply| ControlRequest::Quit { reply }).await
    }

    pub async fn info(&self) -> Result<Value> {
        self.request(|reply| ControlRequest::Info { reply }).await
    }

    pub async fn next_scheduled(
        &self,
        job_names: Option<Vec<String>>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.request(|reply| ControlRequest::NextScheduled { job_names, reply })
            .await
    }

    /// Invoke a named command registered at build time.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let name = name.to_string();
        self.request(|reply| ControlRequest::Command { name, args, reply })
            .await?
    }
}

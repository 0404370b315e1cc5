//! Actors: cooperative event-loop owners with identity and a mailbox.
//!
//! The framework owns the loop; behaviors plug in through the [`Actor`]
//! trait (`on_start` / `on_turn` / `on_stop`). Each loop iteration drains
//! control messages ahead of work, runs one turn, touches the heartbeat,
//! and yields. A turn that returns an error self-terminates the actor; its
//! monitor respawns it.
//!
//! ```text
//! Initial ─► Starting ─► Running ─► Stopping ─► Stopped
//!                          │
//!                 (terminate token short-circuits to Stopped)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{Concurrency, Config};
use crate::error::{FlywheelError, Result};

/// Heartbeat staleness beyond which a monitor may terminate an actor.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Actor identity.
pub type Aid = Uuid;

/// Lifecycle state of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Initial,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ActorState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorState::Initial => "initial",
            ActorState::Starting => "starting",
            ActorState::Running => "running",
            ActorState::Stopping => "stopping",
            ActorState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared lifecycle cell, readable from the proxy.
#[derive(Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ActorState::Initial as u8)))
    }

    pub(crate) fn get(&self) -> ActorState {
        match self.0.load(Ordering::Acquire) {
            0 => ActorState::Initial,
            1 => ActorState::Starting,
            2 => ActorState::Running,
            3 => ActorState::Stopping,
            _ => ActorState::Stopped,
        }
    }

    fn set(&self, state: ActorState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Monotonic heartbeat cell shared between an actor and its proxy.
#[derive(Clone)]
pub struct Heartbeat {
    epoch: Instant,
    millis: Arc<AtomicU64>,
}

impl Heartbeat {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a beat now.
    pub fn touch(&self) {
        self.millis
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last beat.
    pub fn elapsed(&self) -> Duration {
        let last = Duration::from_millis(self.millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Control messages an actor services with priority over work.
pub enum Control {
    Ping { reply: oneshot::Sender<&'static str> },
    Stop,
    Info { reply: oneshot::Sender<serde_json::Value> },
    Notify,
}

/// Execution context handed to behavior hooks.
pub struct ActorContext {
    aid: Aid,
    heartbeat: Heartbeat,
    terminate: CancellationToken,
}

impl ActorContext {
    pub fn aid(&self) -> Aid {
        self.aid
    }

    /// Whether forced termination has been requested.
    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }
}

/// Behavior seam for an actor class.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Class name shown in introspection payloads.
    fn actor_class(&self) -> &'static str;

    /// Called once before the event loop. An error aborts the actor.
    async fn on_start(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }

    /// One unit of work. Must suspend (await) at least once when idle.
    /// An error self-terminates the actor.
    async fn on_turn(&mut self, ctx: &ActorContext) -> Result<()>;

    /// Called once after the event loop exits, before `Stopped`.
    async fn on_stop(&mut self, _ctx: &ActorContext) {}

    /// Behavior-specific fields merged into the `info` snapshot.
    fn info(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Per-spawn parameter overrides a monitor hands to its factory.
#[derive(Debug, Clone)]
pub struct SpawnParams {
    /// Always forced to `false` by the monitor so only the monitor's own
    /// hook schedules periodic tasks.
    pub schedule_periodic: bool,
    pub backlog: usize,
    pub claim_timeout: Duration,
    pub default_timeout: Duration,
    pub close_timeout: Duration,
}

impl SpawnParams {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            schedule_periodic: cfg.schedule_periodic,
            backlog: cfg.backlog,
            claim_timeout: cfg.claim_timeout,
            default_timeout: cfg.timeout,
            close_timeout: cfg.close_timeout,
        }
    }
}

/// Builds actor behaviors for a pool.
pub trait ActorFactory: Send + Sync {
    fn actor_class(&self) -> &'static str;
    fn build(&self, params: &SpawnParams) -> Box<dyn Actor>;
}

fn actor_info(
    aid: Aid,
    state: &StateCell,
    heartbeat: &Heartbeat,
    behavior: &dyn Actor,
) -> serde_json::Value {
    let mut info = json!({
        "aid": aid.simple().to_string(),
        "status": state.get().as_str(),
        "last_heartbeat": heartbeat.elapsed().as_millis() as u64,
    });
    if let (Some(fields), serde_json::Value::Object(extra)) =
        (info.as_object_mut(), behavior.info())
    {
        for (key, value) in extra {
            fields.insert(key, value);
        }
    }
    info
}

async fn run_actor(
    mut behavior: Box<dyn Actor>,
    aid: Aid,
    state: StateCell,
    mut inbox: mpsc::Receiver<Control>,
    heartbeat: Heartbeat,
    terminate: CancellationToken,
) {
    state.set(ActorState::Starting);
    let ctx = ActorContext {
        aid,
        heartbeat: heartbeat.clone(),
        terminate: terminate.clone(),
    };
    if let Err(err) = behavior.on_start(&ctx).await {
        error!(aid = %aid, error = %err, "actor failed to start");
        state.set(ActorState::Stopped);
        return;
    }
    state.set(ActorState::Running);
    heartbeat.touch();

    'event_loop: loop {
        // Control drains ahead of work.
        loop {
            match inbox.try_recv() {
                Ok(Control::Stop) => break 'event_loop,
                Ok(Control::Ping { reply }) => {
                    let _ = reply.send("pong");
                }
                Ok(Control::Info { reply }) => {
                    let _ = reply.send(actor_info(aid, &state, &heartbeat, behavior.as_ref()));
                }
                Ok(Control::Notify) => heartbeat.touch(),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'event_loop,
            }
        }

        tokio::select! {
            biased;
            _ = terminate.cancelled() => {
                debug!(aid = %aid, "actor terminated");
                state.set(ActorState::Stopped);
                return;
            }
            turn = behavior.on_turn(&ctx) => {
                heartbeat.touch();
                if let Err(err) = turn {
                    warn!(aid = %aid, error = %err, "actor turn failed; self-terminating");
                    break 'event_loop;
                }
            }
        }
        tokio::task::yield_now().await;
    }

    state.set(ActorState::Stopping);
    behavior.on_stop(&ctx).await;
    state.set(ActorState::Stopped);
    debug!(aid = %aid, "actor stopped");
}

enum ActorHandle {
    Task(JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

impl ActorHandle {
    fn is_finished(&self) -> bool {
        match self {
            ActorHandle::Task(handle) => handle.is_finished(),
            ActorHandle::Thread(handle) => handle.is_finished(),
        }
    }

    fn abort(&self) {
        if let ActorHandle::Task(handle) = self {
            handle.abort();
        }
    }

    async fn join(&mut self, timeout: Duration) -> bool {
        match self {
            ActorHandle::Task(handle) => {
                tokio::time::timeout(timeout, &mut *handle).await.is_ok()
            }
            ActorHandle::Thread(handle) => {
                // Dedicated threads cannot be awaited; deadline-poll instead.
                let deadline = Instant::now() + timeout;
                while !handle.is_finished() {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                true
            }
        }
    }
}

/// Monitor-side record of a managed actor.
pub struct ActorProxy {
    aid: Aid,
    actor_class: &'static str,
    age: u64,
    control: mpsc::Sender<Control>,
    heartbeat: Heartbeat,
    state: StateCell,
    handle: ActorHandle,
    terminate: CancellationToken,
    heartbeat_timeout: Duration,
}

impl ActorProxy {
    pub fn aid(&self) -> Aid {
        self.aid
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn actor_class(&self) -> &'static str {
        self.actor_class
    }

    pub fn state(&self) -> ActorState {
        self.state.get()
    }

    pub fn control_sender(&self) -> mpsc::Sender<Control> {
        self.control.clone()
    }

    /// Whether the underlying task or thread is still running.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Whether the actor heartbeated within the staleness window.
    pub fn is_responsive(&self) -> bool {
        self.heartbeat.elapsed() < self.heartbeat_timeout
    }

    /// Request graceful shutdown.
    pub async fn stop(&self) {
        if self.control.send(Control::Stop).await.is_err() {
            debug!(aid = %self.aid, "stop sent to a dead actor");
        }
    }

    /// Poke the heartbeat from outside.
    pub fn notify(&self) {
        let _ = self.control.try_send(Control::Notify);
    }

    /// Force termination: cancel the token and abort the task.
    pub fn terminate(&self) {
        self.terminate.cancel();
        self.handle.abort();
    }

    /// Wait for the actor to finish, up to `timeout`.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        self.handle.join(timeout).await
    }

    pub async fn ping(&self, timeout: Duration) -> Result<&'static str> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Ping { reply: tx })
            .await
            .map_err(|_| FlywheelError::ActorDied(self.aid.simple().to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(pong)) => Ok(pong),
            Ok(Err(_)) => Err(FlywheelError::ActorDied(self.aid.simple().to_string())),
            Err(_) => Err(FlywheelError::Timeout(timeout)),
        }
    }

    /// Ask the actor for its own info payload.
    pub async fn info(&self, timeout: Duration) -> Result<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Info { reply: tx })
            .await
            .map_err(|_| FlywheelError::ActorDied(self.aid.simple().to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(FlywheelError::ActorDied(self.aid.simple().to_string())),
            Err(_) => Err(FlywheelError::Timeout(timeout)),
        }
    }

    /// Proxy-side snapshot that never blocks on the actor loop.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "aid": self.aid.simple().to_string(),
            "status": self.state.get().as_str(),
            "age": self.age,
            "last_heartbeat": self.heartbeat.elapsed().as_millis() as u64,
        })
    }
}

/// Spawn an actor from `factory` and return its proxy.
pub(crate) fn spawn_actor(
    factory: &dyn ActorFactory,
    params: &SpawnParams,
    age: u64,
    concurrency: Concurrency,
    heartbeat_timeout: Duration,
) -> Result<ActorProxy> {
    let behavior = factory.build(params);
    let aid = Uuid::new_v4();
    let (control_tx, control_rx) = mpsc::channel(32);
    let state = StateCell::new();
    let heartbeat = Heartbeat::new();
    let terminate = CancellationToken::new();
    let fut = run_actor(
        behavior,
        aid,
        state.clone(),
        control_rx,
        heartbeat.clone(),
        terminate.clone(),
    );

    let handle = match concurrency {
        Concurrency::Thread => ActorHandle::Task(tokio::spawn(fut)),
        Concurrency::Process => {
            let thread = std::thread::Builder::new()
                .name(format!("actor-{}", aid.simple()))
                .spawn(move || {
                    match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt.block_on(fut),
                        Err(err) => error!(error = %err, "failed to build actor runtime"),
                    }
                })
                .map_err(|err| {
                    FlywheelError::ActorDied(format!("spawn failed for {aid}: {err}"))
                })?;
            ActorHandle::Thread(thread)
        }
    };

    debug!(aid = %aid, class = factory.actor_class(), age, "actor spawned");
    Ok(ActorProxy {
        aid,
        actor_class: factory.actor_class(),
        age,
        control: control_tx,
        heartbeat,
        state,
        handle,
        terminate,
        heartbeat_timeout,
    })
}

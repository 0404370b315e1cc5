//! # Flywheel
//!
//! A distributed task queue built on an actor/monitor supervision runtime.
//! Producers submit named jobs; worker actors claim tasks from a shared
//! backend, execute them, and publish results; one elected process converts
//! periodic schedules into tasks.
//!
//! ## Architecture
//!
//! ```text
//! Arbiter ── owns ──► Monitor("tasks") ── owns ──► worker actors (N)
//!    │                    │                            │
//!    │ control plane      │ maintenance cycle          │ consumer loop
//!    │ (ping/echo/info/   │ (reap, probe, spawn,       │ claim ─► run ─► publish
//!    │  quit/commands)    │  trim, hook)               │
//!    │                    └─► SchedulerHook.tick()     │
//!    ▼                               │                 ▼
//! ArbiterHandle                      └──────► TaskBackend (local://, …)
//!                                                     ▲
//! producers ── submit(job, args, kwargs) ─────────────┘
//! ```
//!
//! ## Key invariants
//!
//! 1. **Task transitions are monotonic** - `Pending → Queued → Started →
//!    {Success | Failure | Revoked}`; terminal states are absorbing.
//! 2. **Claims are at-most-once** - a claimed task reaches no other worker
//!    unless it is relinquished or the worker's lease lapses.
//! 3. **One scheduling leader** - only the process with `schedule_periodic`
//!    ticks the scheduler, and workers always have the flag forced off.
//! 4. **Single-pool membership** - every actor belongs to exactly one
//!    monitor; the arbiter's index is a lookup surface, not an owner.
//!
//! ## Example
//!
//! ```ignore
//! use flywheel::{Arbiter, Config, Job, JobGroup};
//!
//! let cfg = Config::builder()
//!     .task_paths(vec!["mail".to_string()])
//!     .schedule_periodic(true)
//!     .num_workers(4)
//!     .build();
//!
//! let mut arbiter = Arbiter::builder(cfg)
//!     .group(JobGroup::new("mail").register(SendWelcome))
//!     .build()?;
//! arbiter.add_worker_pool("tasks")?;
//!
//! let handle = arbiter.handle();
//! let backend = arbiter.backend();
//! tokio::spawn(arbiter.serve());
//!
//! let id = backend
//!     .submit("send_welcome", json!([user_id]), json!({}), Default::default())
//!     .await?;
//! ```

pub mod actor;
pub mod arbiter;
pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod monitor;
pub mod scheduler;
pub mod task;
pub mod worker;

#[cfg(test)]
mod scenario_tests;

pub use actor::{
    Actor, ActorContext, ActorFactory, ActorProxy, ActorState, Aid, Control, Heartbeat,
    SpawnParams, HEARTBEAT_TIMEOUT,
};
pub use arbiter::{
    ActorIndex, Arbiter, ArbiterBuilder, ArbiterHandle, CommandContext, ControlRequest,
};
pub use backend::{BackendRegistry, LocalBackend, SubmitOptions, TaskBackend};
pub use config::{Concurrency, Config};
pub use error::{FlywheelError, Result};
pub use job::{Job, JobGroup, JobRegistry, Schedule};
pub use monitor::{Monitor, MonitorHook, SchedulerHook, CLOSE_TIMEOUT, JOIN_TIMEOUT};
pub use scheduler::Scheduler;
pub use task::{Task, TaskError, TaskErrorKind, TaskId, TaskStatus};
pub use worker::{WorkerActor, WorkerFactory};

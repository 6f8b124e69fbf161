//! Autopilot engine: scheduled browser-workflow automation for many
//! tenants.
//!
//! A cron [`scheduler`] enqueues due runs into an at-least-once
//! [`queue`]; a pool of [`worker`]s claims them and drives the
//! [`engine`], which interprets each workflow's compiled [`program`]
//! against an isolated browser session while streaming ordered run
//! events back to the worker for persistence and realtime fan-out.
//! Browser primitives, storage, and the push transport are external
//! collaborators reached through the traits in [`browser`] and
//! [`persistence`].

pub mod browser;
pub mod condition;
pub mod cron;
pub mod engine;
pub mod error;
mod interpreter;
pub mod persistence;
pub mod program;
pub mod queue;
pub mod scheduler;
pub mod substitute;
pub mod types;
pub mod worker;

pub use engine::{ExecutionEngine, RunOutcome};
pub use error::{EngineError, Result};
pub use queue::{JobQueue, QueueOptions};
pub use scheduler::{ScheduleMonitor, Scheduler, SchedulerOptions};
pub use types::{
    EngineConfig, ExecutionContext, ExecutionStatus, RunEvent, WorkflowDefinition, WorkflowStep,
};
pub use worker::{Worker, WorkerPool};

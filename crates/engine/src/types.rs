//! Core domain types for the automation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Run-scoped variable bag: name -> JSON value, keys unique.
pub type VariableMap = serde_json::Map<String, Value>;

/// A stored automation definition: an ordered step sequence plus an
/// optional initial variable bag. Immutable input to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub variables: VariableMap,
}

/// One step as persisted: a type tag plus an untyped config blob.
///
/// Definitions are compiled into a typed [`crate::program::Program`]
/// before anything executes; the raw form exists only at the storage
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: Value,
    /// Canvas layout hint, ignored by the interpreter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Failed steps normally abort the run; best-effort steps opt out.
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Per-engine configuration, set once at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub headless: bool,
    /// Bound on each individual step, including its browser-level waits.
    pub step_timeout: Duration,
    /// Ceiling on simultaneously active runs across the whole engine.
    pub max_concurrent: usize,
    pub screenshot_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            headless: true,
            step_timeout: Duration::from_secs(30),
            max_concurrent: 5,
            screenshot_on_error: true,
        }
    }
}

/// Mutable state of one run. Created by the worker when a job is
/// dequeued, mutated only by the step interpreter, discarded after the
/// run's events have been drained.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub definition: WorkflowDefinition,
    pub variables: VariableMap,
    pub extracted_data: VariableMap,
    pub loop_context: Option<LoopContext>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        user_id: impl Into<String>,
        definition: WorkflowDefinition,
    ) -> Self {
        let variables = definition.variables.clone();
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            user_id: user_id.into(),
            definition,
            variables,
            extracted_data: VariableMap::new(),
            loop_context: None,
        }
    }
}

/// Loop bookkeeping, present only while the interpreter is inside a
/// `loop` step.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopContext {
    pub step_id: String,
    pub total_iterations: usize,
    /// 0-based.
    pub current_iteration: usize,
    /// Match index in elements mode, `None` in count mode.
    pub current_element: Option<usize>,
    pub should_break: bool,
}

/// Outcome of a single step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw image bytes, uploaded out-of-band by the worker.
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

impl StepResult {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Events emitted over a run's ordered event channel.
///
/// The interpreter and engine are the producers, the worker is the
/// consumer; emission order is preserved end to end (progress before the
/// step's own completion event, logs interleaved as produced).
#[derive(Debug, Clone)]
pub enum RunEvent {
    Progress {
        current_step: usize,
        total_steps: usize,
        percentage: u8,
    },
    Log {
        level: LogLevel,
        message: String,
        step_id: Option<String>,
    },
    StepCompleted {
        step_id: String,
        result: StepResult,
    },
    Completed {
        extracted_data: VariableMap,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Execution record as exchanged with the external persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub scheduled_job_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub extracted_data: Option<VariableMap>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Work item payload carried through the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub workflow_id: String,
    pub execution_id: String,
    pub user_id: String,
    pub definition: WorkflowDefinition,
    /// Set when the run was enqueued by the scheduler; drives the
    /// post-run failure-rate check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub data: JobPayload,
    pub status: JobStatus,
    /// Delivery attempts so far, incremented on claim.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the job may be claimed (moved forward on retry).
    pub available_at: DateTime<Utc>,
    /// Claim lease; an expired lease makes the job re-deliverable.
    pub leased_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// A cron-bound recurring trigger for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub cron_schedule: String,
    /// Always the next cron occurrence strictly after `last_run_at`
    /// (or after creation if never run).
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Cleared by user action or by an automatic failure-rate pause.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Failure statistics for one scheduled job, for operational dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct FailureStats {
    pub consecutive_failures: usize,
    /// Percentage over the monitored window.
    pub recent_failure_rate: f64,
    pub total_recent_executions: usize,
    pub is_paused: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
}

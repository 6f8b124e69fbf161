use thiserror::Error;

/// Engine-wide error type.
///
/// Variants fall into the fault classes the rest of the system reasons
/// about: validation errors (bad definitions, bad cron expressions) are
/// fatal to the operation that raised them and never retried; automation
/// faults are fatal to the individual run only; infrastructure faults
/// (queue, session allocation, engine shut down) are retried through the
/// queue's redelivery mechanism.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Invalid config for step '{step_id}': {reason}")]
    InvalidStepConfig { step_id: String, reason: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Automation fault: {0}")]
    Automation(String),

    #[error("Step '{0}' timed out")]
    StepTimeout(String),

    #[error("Browser session error: {0}")]
    Session(String),

    #[error("Engine is shut down")]
    EngineClosed,

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether redelivery could plausibly succeed. Validation and
    /// automation faults are deterministic; infrastructure faults are
    /// not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Session(_)
                | EngineError::EngineClosed
                | EngineError::Queue(_)
                | EngineError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Execution engine: owns the pool of concurrently running workflows.
//!
//! Each run gets an exclusively-owned browser session and one slot of
//! the engine's `max_concurrent` budget. Slots queue rather than reject
//! when the ceiling is reached; backpressure belongs to the job queue
//! and worker layer, not here. Teardown of the session and release of
//! the slot happen on every exit path.

use crate::browser::{BrowserDriver, SessionOptions};
use crate::error::{EngineError, Result};
use crate::interpreter::StepInterpreter;
use crate::program::Program;
use crate::types::{
    EngineConfig, ExecutionContext, ExecutionStatus, LogLevel, RunEvent, VariableMap,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Terminal result of one run as seen by the caller.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub extracted_data: VariableMap,
    pub error: Option<String>,
}

pub struct ExecutionEngine {
    driver: Arc<dyn BrowserDriver>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            driver,
            config,
            permits,
            active: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of runs currently holding a session.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Execute one workflow run, emitting its ordered event stream into
    /// `events`.
    ///
    /// Returns `Ok` with the run outcome for both completed and failed
    /// runs; `Err` is reserved for faults the queue should retry
    /// (engine shut down, session allocation failure) and for invalid
    /// definitions, which fail before any step executes.
    pub async fn execute(
        &self,
        mut context: ExecutionContext,
        events: mpsc::Sender<RunEvent>,
    ) -> Result<RunOutcome> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::EngineClosed);
        }

        // reject invalid definitions before acquiring any resources
        let program = match Program::compile(&context.definition) {
            Ok(program) => program,
            Err(err) => {
                let _ = events
                    .send(RunEvent::Failed {
                        error: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(EngineError::EngineClosed),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| EngineError::EngineClosed)?
            }
        };

        let options = SessionOptions {
            headless: self.config.headless,
        };
        let mut session = match self.driver.open_session(&options).await {
            Ok(session) => session,
            Err(err) => {
                let message = format!("session allocation failed: {err}");
                let _ = events
                    .send(RunEvent::Failed {
                        error: message.clone(),
                    })
                    .await;
                drop(permit);
                return Err(EngineError::Session(message));
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        info!(execution_id = %context.execution_id, "workflow run started");
        let _ = events
            .send(RunEvent::Log {
                level: LogLevel::Info,
                message: format!(
                    "Workflow execution started ({} steps)",
                    context.definition.steps.len()
                ),
                step_id: None,
            })
            .await;

        let run_result = {
            let run = async {
                let mut interpreter =
                    StepInterpreter::new(session.as_mut(), &self.config, &mut context, &events);
                interpreter.run(&program).await
            };
            tokio::select! {
                _ = self.cancel.cancelled() => Err(EngineError::EngineClosed),
                result = run => result,
            }
        };

        if let Err(err) = session.close().await {
            warn!(execution_id = %context.execution_id, error = %err, "session teardown failed");
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        match run_result {
            Ok(()) => {
                let _ = events
                    .send(RunEvent::Completed {
                        extracted_data: context.extracted_data.clone(),
                    })
                    .await;
                info!(execution_id = %context.execution_id, "workflow run completed");
                Ok(RunOutcome {
                    execution_id: context.execution_id,
                    status: ExecutionStatus::Completed,
                    extracted_data: context.extracted_data,
                    error: None,
                })
            }
            Err(EngineError::EngineClosed) => {
                let _ = events
                    .send(RunEvent::Failed {
                        error: EngineError::EngineClosed.to_string(),
                    })
                    .await;
                Err(EngineError::EngineClosed)
            }
            Err(err) => {
                let message = err.to_string();
                let _ = events
                    .send(RunEvent::Failed {
                        error: message.clone(),
                    })
                    .await;
                info!(execution_id = %context.execution_id, error = %message, "workflow run failed");
                Ok(RunOutcome {
                    execution_id: context.execution_id,
                    status: ExecutionStatus::Failed,
                    extracted_data: context.extracted_data,
                    error: Some(message),
                })
            }
        }
    }

    /// Stop accepting runs, force in-flight runs to unwind, and wait
    /// until every session is closed.
    pub async fn shutdown(&self) {
        info!("shutting down execution engine");
        self.cancel.cancel();
        self.permits.close();
        while self.active.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!("execution engine shut down");
    }
}

//! Worker: claims queue jobs and drives the execution engine.
//!
//! Each worker handles one job at a time. A job's run events are
//! consumed by a forwarder task that persists logs and fans progress out
//! to subscribers, preserving the channel's emission order; terminal
//! status, duration and extracted data are persisted once the run ends.
//! Run-level faults never escape a worker, and the pool always shuts
//! the engine down when it stops.

use crate::engine::ExecutionEngine;
use crate::persistence::{
    ExecutionStore, ExecutionUpdate, ObjectStore, RealtimeBroadcaster, events,
};
use crate::queue::JobQueue;
use crate::scheduler::ScheduleMonitor;
use crate::types::{ExecutionContext, ExecutionStatus, JobRecord, LogLevel, RunEvent};
use base64::Engine as _;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the per-run event channel; producers briefly backpressure
/// if the forwarder falls behind.
const EVENT_BUFFER: usize = 256;

pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    engine: Arc<ExecutionEngine>,
    executions: Arc<dyn ExecutionStore>,
    realtime: Arc<dyn RealtimeBroadcaster>,
    objects: Arc<dyn ObjectStore>,
    monitor: Option<ScheduleMonitor>,
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        engine: Arc<ExecutionEngine>,
        executions: Arc<dyn ExecutionStore>,
        realtime: Arc<dyn RealtimeBroadcaster>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let suffix = Uuid::new_v4().to_string();
        Self {
            id: format!("{host}-{}", &suffix[..8]),
            queue,
            engine,
            executions,
            realtime,
            objects,
            monitor: None,
        }
    }

    /// Ping the scheduler's failure monitor after schedule-triggered runs.
    pub fn with_schedule_monitor(mut self, monitor: ScheduleMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consume jobs until shutdown is signalled or the queue closes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "worker started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                job = self.queue.fetch_job(&self.id) => {
                    match job {
                        Some(job) => self.process_job(job).await,
                        None => break,
                    }
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    async fn process_job(&self, job: JobRecord) {
        let execution_id = job.data.execution_id.clone();
        let user_id = job.data.user_id.clone();
        let started_at = Utc::now();
        info!(worker_id = %self.id, job_id = %job.id, execution_id = %execution_id, "processing job");

        if let Err(err) = self
            .executions
            .update_execution_status(&execution_id, ExecutionStatus::Running)
            .await
        {
            error!(execution_id = %execution_id, error = %err, "failed to mark execution running");
            if let Err(err) = self.queue.fail_job(&job.id, &err.to_string()) {
                error!(job_id = %job.id, error = %err, "failed to report job failure");
            }
            return;
        }
        self.realtime
            .broadcast_to_execution(
                &execution_id,
                events::EXECUTION_STATUS,
                json!({ "executionId": execution_id, "status": "running" }),
            )
            .await;

        let context = ExecutionContext::new(
            &job.data.execution_id,
            &job.data.workflow_id,
            &job.data.user_id,
            job.data.definition.clone(),
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let forwarder = tokio::spawn(forward_events(
            events_rx,
            Arc::clone(&self.executions),
            Arc::clone(&self.realtime),
            Arc::clone(&self.objects),
            execution_id.clone(),
        ));

        let outcome = self.engine.execute(context, events_tx).await;
        // the engine dropped its sender; drain the stream before
        // persisting terminal state so ordering holds
        if let Err(err) = forwarder.await {
            error!(execution_id = %execution_id, error = %err, "event forwarder failed");
        }

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();

        match outcome {
            Ok(outcome) => {
                let failed = outcome.status == ExecutionStatus::Failed;
                let update = ExecutionUpdate {
                    status: Some(outcome.status),
                    completed_at: Some(completed_at),
                    duration_ms: Some(duration_ms),
                    extracted_data: (!failed).then(|| outcome.extracted_data.clone()),
                    error_message: outcome.error.clone(),
                };
                if let Err(err) = self.executions.update_execution(&execution_id, update).await {
                    error!(execution_id = %execution_id, error = %err, "failed to persist terminal status");
                }
                let (event, payload) = if failed {
                    (
                        events::EXECUTION_FAILED,
                        json!({
                            "executionId": execution_id,
                            "status": "failed",
                            "durationMs": duration_ms,
                            "error": outcome.error,
                        }),
                    )
                } else {
                    (
                        events::EXECUTION_COMPLETED,
                        json!({
                            "executionId": execution_id,
                            "status": "completed",
                            "durationMs": duration_ms,
                            "extractedData": outcome.extracted_data,
                        }),
                    )
                };
                self.realtime
                    .broadcast_to_execution(&execution_id, event, payload.clone())
                    .await;
                self.realtime
                    .broadcast_to_user(&user_id, event, payload)
                    .await;
                if let Err(err) = self.queue.complete_job(&job.id) {
                    error!(job_id = %job.id, error = %err, "failed to acknowledge job");
                }
            }
            Err(err) => {
                let message = err.to_string();
                let update = ExecutionUpdate {
                    status: Some(ExecutionStatus::Failed),
                    completed_at: Some(completed_at),
                    duration_ms: Some(duration_ms),
                    extracted_data: None,
                    error_message: Some(message.clone()),
                };
                if let Err(err) = self.executions.update_execution(&execution_id, update).await {
                    error!(execution_id = %execution_id, error = %err, "failed to persist terminal status");
                }
                let payload = json!({
                    "executionId": execution_id,
                    "status": "failed",
                    "durationMs": duration_ms,
                    "error": message,
                });
                self.realtime
                    .broadcast_to_execution(&execution_id, events::EXECUTION_FAILED, payload.clone())
                    .await;
                self.realtime
                    .broadcast_to_user(&user_id, events::EXECUTION_FAILED, payload)
                    .await;
                // validation errors are deterministic; only infrastructure
                // faults go back to the queue for redelivery
                let report = if err.is_retryable() {
                    self.queue.fail_job(&job.id, &message)
                } else {
                    self.queue.complete_job(&job.id)
                };
                if let Err(err) = report {
                    error!(job_id = %job.id, error = %err, "failed to report job outcome");
                }
            }
        }

        if let (Some(monitor), Some(schedule_id)) = (&self.monitor, &job.data.scheduled_job_id) {
            monitor.notify(schedule_id);
        }
    }
}

/// Drain a run's event channel into persistence and realtime fan-out.
async fn forward_events(
    mut rx: mpsc::Receiver<RunEvent>,
    executions: Arc<dyn ExecutionStore>,
    realtime: Arc<dyn RealtimeBroadcaster>,
    objects: Arc<dyn ObjectStore>,
    execution_id: String,
) {
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Progress {
                current_step,
                total_steps,
                percentage,
            } => {
                realtime
                    .broadcast_to_execution(
                        &execution_id,
                        events::EXECUTION_STATUS,
                        json!({
                            "executionId": execution_id,
                            "currentStep": current_step,
                            "totalSteps": total_steps,
                            "percentage": percentage,
                        }),
                    )
                    .await;
            }
            RunEvent::Log {
                level,
                message,
                step_id,
            } => {
                if let Err(err) = executions
                    .add_log(&execution_id, level, &message, step_id.as_deref())
                    .await
                {
                    debug!(execution_id = %execution_id, error = %err, "log write failed");
                }
                realtime
                    .broadcast_to_execution(
                        &execution_id,
                        events::EXECUTION_LOG,
                        json!({
                            "executionId": execution_id,
                            "level": level,
                            "message": message,
                            "stepId": step_id,
                        }),
                    )
                    .await;
            }
            RunEvent::StepCompleted { step_id, result } => {
                let (level, message) = if result.success {
                    (LogLevel::Info, format!("Step '{step_id}' completed"))
                } else {
                    (LogLevel::Error, format!("Step '{step_id}' failed"))
                };
                if let Err(err) = executions
                    .add_log(&execution_id, level, &message, Some(&step_id))
                    .await
                {
                    debug!(execution_id = %execution_id, error = %err, "log write failed");
                }
                if let Some(bytes) = result.screenshot {
                    let path = format!("screenshots/{execution_id}/{step_id}.png");
                    if let Err(err) = objects
                        .upload_file("artifacts", &path, bytes, "image/png")
                        .await
                    {
                        warn!(execution_id = %execution_id, error = %err, "screenshot upload failed");
                    }
                }
                if let Some((filename, bytes)) = result.data.as_ref().and_then(download_artifact) {
                    let path = format!("downloads/{execution_id}/{filename}");
                    if let Err(err) = objects
                        .upload_file("artifacts", &path, bytes, "application/octet-stream")
                        .await
                    {
                        warn!(execution_id = %execution_id, error = %err, "artifact upload failed");
                    }
                }
            }
            RunEvent::Completed { .. } => {
                if let Err(err) = executions
                    .add_log(&execution_id, LogLevel::Info, "Workflow execution completed", None)
                    .await
                {
                    debug!(execution_id = %execution_id, error = %err, "log write failed");
                }
            }
            RunEvent::Failed { error } => {
                if let Err(err) = executions
                    .add_log(
                        &execution_id,
                        LogLevel::Error,
                        &format!("Workflow execution failed: {error}"),
                        None,
                    )
                    .await
                {
                    debug!(execution_id = %execution_id, error = %err, "log write failed");
                }
            }
        }
    }
}

/// Downloaded-file payloads carry their bytes inline for the worker to
/// archive.
fn download_artifact(data: &Value) -> Option<(String, Vec<u8>)> {
    let filename = data.get("filename")?.as_str()?;
    let encoded = data.get("content_base64")?.as_str()?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    Some((filename.to_string(), bytes))
}

/// Fixed-size pool of workers sharing one engine and queue.
pub struct WorkerPool {
    size: usize,
    queue: Arc<JobQueue>,
    engine: Arc<ExecutionEngine>,
    executions: Arc<dyn ExecutionStore>,
    realtime: Arc<dyn RealtimeBroadcaster>,
    objects: Arc<dyn ObjectStore>,
    monitor: Option<ScheduleMonitor>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        queue: Arc<JobQueue>,
        engine: Arc<ExecutionEngine>,
        executions: Arc<dyn ExecutionStore>,
        realtime: Arc<dyn RealtimeBroadcaster>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            size,
            queue,
            engine,
            executions,
            realtime,
            objects,
            monitor: None,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn with_schedule_monitor(mut self, monitor: ScheduleMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.size
    }

    /// Spawn the workers. Idempotent once started.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }
        for _ in 0..self.size {
            let mut worker = Worker::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.engine),
                Arc::clone(&self.executions),
                Arc::clone(&self.realtime),
                Arc::clone(&self.objects),
            );
            if let Some(monitor) = &self.monitor {
                worker = worker.with_schedule_monitor(monitor.clone());
            }
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.handles
                .push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
        }
        info!(workers = self.size, "worker pool started");
    }

    /// Stop the workers and shut the engine down. The engine shutdown is
    /// unconditional: it runs even when a worker task failed, and it
    /// force-terminates runs still in flight.
    pub async fn shutdown(&mut self) {
        info!("shutting down worker pool");
        let _ = self.shutdown_tx.send(true);
        self.queue.close();
        self.engine.shutdown().await;
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task failed");
            }
        }
        info!("worker pool shutdown complete");
    }
}

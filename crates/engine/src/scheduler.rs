//! Cron scheduler and failure-rate monitoring for recurring workflows.
//!
//! The scheduler ticks on a fixed interval, enqueues due schedules and
//! advances their run times before enqueueing, so a persistently broken
//! schedule never re-triggers on every tick. After each scheduled
//! run, a short-delay health check computes the schedule's recent
//! failure rate and pauses it once the rate breaches the threshold;
//! re-activation is a human decision.

use crate::cron;
use crate::error::{EngineError, Result};
use crate::persistence::{ExecutionStore, ScheduleStore, WorkflowStore};
use crate::queue::JobQueue;
use crate::types::{
    ExecutionRecord, ExecutionStatus, FailureStats, JobPayload, LogLevel, ScheduledJob,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    /// Number of trailing executions the failure rate is computed over.
    pub failure_window: usize,
    /// Failure percentage at which a schedule is auto-paused.
    pub pause_threshold: f64,
    /// Delay between a run finishing and its health check, so sibling
    /// in-flight runs settle first.
    pub health_check_delay: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            failure_window: 6,
            pause_threshold: 100.0,
            health_check_delay: Duration::from_secs(2),
        }
    }
}

/// Handle workers use to request a post-run health check.
#[derive(Clone)]
pub struct ScheduleMonitor {
    tx: mpsc::UnboundedSender<String>,
}

impl ScheduleMonitor {
    pub fn notify(&self, schedule_id: &str) {
        let _ = self.tx.send(schedule_id.to_string());
    }
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<JobQueue>,
    options: SchedulerOptions,
    monitor_tx: mpsc::UnboundedSender<String>,
    monitor_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<JobQueue>,
        options: SchedulerOptions,
    ) -> Self {
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        Self {
            schedules,
            workflows,
            executions,
            queue,
            options,
            monitor_tx,
            monitor_rx: Mutex::new(Some(monitor_rx)),
        }
    }

    pub fn monitor_handle(&self) -> ScheduleMonitor {
        ScheduleMonitor {
            tx: self.monitor_tx.clone(),
        }
    }

    /// Tick loop plus health-check dispatch, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut monitor_rx) = self.monitor_rx.lock().take() else {
            error!("scheduler is already running");
            return;
        };
        let mut ticker = tokio::time::interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, "scheduler tick failed");
                    }
                }
                Some(schedule_id) = monitor_rx.recv() => {
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        tokio::time::sleep(scheduler.options.health_check_delay).await;
                        if let Err(err) = scheduler.check_schedule_health(&schedule_id).await {
                            warn!(schedule_id = %schedule_id, error = %err, "schedule health check failed");
                        }
                    });
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Enqueue every active schedule due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let due = self.schedules.list_due(now).await?;
        if !due.is_empty() {
            debug!(count = due.len(), "due schedules");
        }
        for schedule in due {
            // advance the clock first: enqueue failures must not
            // re-trigger on the next tick
            match cron::next_run_time(&schedule.cron_schedule, Some(now)) {
                Ok(next_run_at) => {
                    self.schedules
                        .update_run_times(&schedule.id, now, next_run_at)
                        .await?;
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "invalid cron expression, pausing schedule");
                    self.schedules.set_active(&schedule.id, false).await?;
                    continue;
                }
            }
            if let Err(err) = self.enqueue_run(&schedule, now).await {
                warn!(schedule_id = %schedule.id, error = %err, "failed to enqueue scheduled run");
            }
        }
        Ok(())
    }

    async fn enqueue_run(&self, schedule: &ScheduledJob, now: DateTime<Utc>) -> Result<()> {
        let definition = self
            .workflows
            .get_workflow(&schedule.workflow_id, &schedule.user_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(schedule.workflow_id.clone()))?;
        let execution_id = Uuid::new_v4().to_string();
        self.executions
            .create_execution(ExecutionRecord {
                id: execution_id.clone(),
                workflow_id: schedule.workflow_id.clone(),
                user_id: schedule.user_id.clone(),
                status: ExecutionStatus::Pending,
                scheduled_job_id: Some(schedule.id.clone()),
                started_at: None,
                completed_at: None,
                duration_ms: None,
                extracted_data: None,
                error_message: None,
                created_at: now,
            })
            .await?;
        self.queue.add_job(JobPayload {
            workflow_id: schedule.workflow_id.clone(),
            execution_id: execution_id.clone(),
            user_id: schedule.user_id.clone(),
            definition,
            scheduled_job_id: Some(schedule.id.clone()),
        })?;
        info!(schedule_id = %schedule.id, execution_id = %execution_id, "scheduled run enqueued");
        Ok(())
    }

    /// Create a schedule; an invalid cron expression is rejected and no
    /// record is written.
    pub async fn create_schedule(
        &self,
        workflow_id: &str,
        user_id: &str,
        cron_schedule: &str,
    ) -> Result<ScheduledJob> {
        let validation = cron::validate_cron_expression(cron_schedule);
        if !validation.valid {
            return Err(EngineError::InvalidCron {
                expr: cron_schedule.to_string(),
                reason: validation
                    .error
                    .unwrap_or_else(|| "invalid expression".into()),
            });
        }
        let now = Utc::now();
        let job = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            cron_schedule: cron_schedule.to_string(),
            next_run_at: cron::next_run_time(cron_schedule, Some(now))?,
            last_run_at: None,
            is_active: true,
            created_at: now,
        };
        self.schedules.create_schedule(job.clone()).await?;
        info!(schedule_id = %job.id, cron = cron_schedule, "schedule created");
        Ok(job)
    }

    pub async fn pause_schedule(&self, id: &str) -> Result<()> {
        self.schedules.set_active(id, false).await
    }

    /// Re-activate a paused schedule, recomputing its next occurrence so
    /// a long pause does not fire immediately.
    pub async fn resume_schedule(&self, id: &str) -> Result<()> {
        let schedule = self
            .schedules
            .get_schedule(id)
            .await?
            .ok_or_else(|| EngineError::ScheduleNotFound(id.to_string()))?;
        let next_run_at = cron::next_run_time(&schedule.cron_schedule, None)?;
        self.schedules
            .update_run_times(id, schedule.last_run_at.unwrap_or(schedule.created_at), next_run_at)
            .await?;
        self.schedules.set_active(id, true).await
    }

    /// Pause the schedule when its recent failure rate breaches the
    /// threshold over a full monitoring window.
    pub async fn check_schedule_health(&self, schedule_id: &str) -> Result<()> {
        let (stats, latest_failed) = self.collect_stats(schedule_id).await?;
        if stats.is_paused {
            return Ok(());
        }
        if stats.total_recent_executions >= self.options.failure_window
            && stats.recent_failure_rate >= self.options.pause_threshold
        {
            self.schedules.set_active(schedule_id, false).await?;
            warn!(
                schedule_id,
                failure_rate = stats.recent_failure_rate,
                window = stats.total_recent_executions,
                "pausing chronically failing schedule"
            );
            if let Some(execution_id) = latest_failed {
                let message = format!(
                    "Schedule paused automatically: {:.0}% of the last {} runs failed",
                    stats.recent_failure_rate, stats.total_recent_executions
                );
                if let Err(err) = self
                    .executions
                    .add_log(&execution_id, LogLevel::Error, &message, None)
                    .await
                {
                    debug!(error = %err, "pause log write failed");
                }
            }
        }
        Ok(())
    }

    /// Failure statistics for operational dashboards.
    pub async fn failure_stats(&self, schedule_id: &str) -> Result<FailureStats> {
        self.collect_stats(schedule_id)
            .await
            .map(|(stats, _)| stats)
    }

    async fn collect_stats(&self, schedule_id: &str) -> Result<(FailureStats, Option<String>)> {
        let schedule = self
            .schedules
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::ScheduleNotFound(schedule_id.to_string()))?;
        let recent = self
            .executions
            .list_recent_executions(
                &schedule.workflow_id,
                &schedule.user_id,
                self.options.failure_window,
            )
            .await?;
        // only terminal outcomes count, so in-flight runs never skew
        // the rate
        let terminal: Vec<&ExecutionRecord> = recent
            .iter()
            .filter(|record| {
                matches!(
                    record.status,
                    ExecutionStatus::Completed | ExecutionStatus::Failed
                )
            })
            .collect();
        let total = terminal.len();
        let failed = terminal
            .iter()
            .filter(|record| record.status == ExecutionStatus::Failed)
            .count();
        let consecutive = terminal
            .iter()
            .take_while(|record| record.status == ExecutionStatus::Failed)
            .count();
        let latest_failed = terminal
            .iter()
            .find(|record| record.status == ExecutionStatus::Failed);
        let stats = FailureStats {
            consecutive_failures: consecutive,
            recent_failure_rate: if total == 0 {
                0.0
            } else {
                failed as f64 * 100.0 / total as f64
            },
            total_recent_executions: total,
            is_paused: !schedule.is_active,
            last_failure_at: latest_failed.and_then(|record| record.completed_at),
        };
        Ok((stats, latest_failed.map(|record| record.id.clone())))
    }
}

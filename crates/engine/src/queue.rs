//! At-least-once job queue feeding the worker pool.
//!
//! Producers enqueue run payloads; consumers claim jobs under a lease
//! and acknowledge them terminally. A consumer that dies before
//! acknowledging loses its lease and the job becomes re-deliverable.
//! Retries are bounded; exhausting them marks the job failed and is
//! reported, never silently dropped. The single state mutex is the
//! claim-serialization point; a job is never double-claimed while its
//! lease is live. FIFO is not guaranteed under retries.

use crate::error::{EngineError, Result};
use crate::types::{JobPayload, JobRecord, JobStatus, QueueMetrics};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fallback poll interval for consumers, covering delayed-retry
/// promotion and lease expiry.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub lease_duration: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            lease_duration: Duration::from_secs(300),
        }
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
    options: QueueOptions,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, JobRecord>,
    waiting: VecDeque<String>,
}

impl JobQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            options,
        }
    }

    /// Enqueue a run for processing.
    pub fn add_job(&self, data: JobPayload) -> Result<JobRecord> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Queue("queue is closed".into()));
        }
        let now = Utc::now();
        let record = JobRecord {
            id: Uuid::new_v4().to_string(),
            data,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: self.options.max_attempts,
            last_error: None,
            created_at: now,
            available_at: now,
            leased_until: None,
        };
        {
            let mut state = self.state.lock();
            state.waiting.push_back(record.id.clone());
            state.jobs.insert(record.id.clone(), record.clone());
        }
        self.notify.notify_one();
        debug!(job_id = %record.id, execution_id = %record.data.execution_id, "job enqueued");
        Ok(record)
    }

    /// Claim the next available job, waiting until one arrives or the
    /// queue is closed.
    pub async fn fetch_job(&self, worker_id: &str) -> Option<JobRecord> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(job) = self.try_claim(worker_id) {
                return Some(job);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn try_claim(&self, worker_id: &str) -> Option<JobRecord> {
        let now = Utc::now();
        let lease = self.lease();
        let mut state = self.state.lock();
        reclaim_expired(&mut state, now);
        promote_delayed(&mut state, now);
        while let Some(id) = state.waiting.pop_front() {
            // stale ids (removed jobs) fall through
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == JobStatus::Waiting {
                    job.status = JobStatus::Active;
                    job.attempts += 1;
                    job.leased_until = Some(now + lease);
                    debug!(job_id = %job.id, worker_id, attempt = job.attempts, "job claimed");
                    return Some(job.clone());
                }
            }
        }
        None
    }

    /// Acknowledge successful processing.
    pub fn complete_job(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        job.status = JobStatus::Completed;
        job.leased_until = None;
        debug!(job_id = %id, "job completed");
        Ok(())
    }

    /// Report a processing failure; the job retries until its attempt
    /// budget is exhausted, then fails terminally.
    pub fn fail_job(&self, id: &str, error: &str) -> Result<()> {
        let retry = {
            let mut state = self.state.lock();
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
            job.last_error = Some(error.to_string());
            job.leased_until = None;
            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                warn!(job_id = %id, attempts = job.attempts, error, "job failed terminally");
                false
            } else {
                job.status = JobStatus::Delayed;
                job.available_at =
                    Utc::now() + ChronoDuration::milliseconds(self.options.retry_delay.as_millis() as i64);
                debug!(job_id = %id, attempt = job.attempts, "job scheduled for retry");
                true
            }
        };
        if retry {
            self.notify.notify_one();
        }
        Ok(())
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.state.lock().jobs.get(id).map(|job| job.status)
    }

    pub fn get_job(&self, id: &str) -> Option<JobRecord> {
        self.state.lock().jobs.get(id).cloned()
    }

    /// Remove a job entirely. Returns whether it existed.
    pub fn remove_job(&self, id: &str) -> bool {
        self.state.lock().jobs.remove(id).is_some()
    }

    pub fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock();
        let mut metrics = QueueMetrics::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting => metrics.waiting += 1,
                JobStatus::Active => metrics.active += 1,
                JobStatus::Delayed => metrics.delayed += 1,
                JobStatus::Completed => metrics.completed += 1,
                JobStatus::Failed => metrics.failed += 1,
            }
        }
        metrics
    }

    /// Stop delivery; blocked consumers return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn lease(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.options.lease_duration.as_millis() as i64)
    }
}

/// Return expired claims to the waiting queue (at-least-once delivery).
fn reclaim_expired(state: &mut QueueState, now: DateTime<Utc>) {
    let expired: Vec<String> = state
        .jobs
        .values()
        .filter(|job| {
            job.status == JobStatus::Active
                && job.leased_until.map(|until| until < now).unwrap_or(true)
        })
        .map(|job| job.id.clone())
        .collect();
    for id in expired {
        if let Some(job) = state.jobs.get_mut(&id) {
            warn!(job_id = %id, "claim lease expired, job redelivered");
            job.status = JobStatus::Waiting;
            job.leased_until = None;
        }
        state.waiting.push_back(id);
    }
}

/// Promote delayed retries whose backoff has elapsed.
fn promote_delayed(state: &mut QueueState, now: DateTime<Utc>) {
    let due: Vec<String> = state
        .jobs
        .values()
        .filter(|job| job.status == JobStatus::Delayed && job.available_at <= now)
        .map(|job| job.id.clone())
        .collect();
    for id in due {
        if let Some(job) = state.jobs.get_mut(&id) {
            job.status = JobStatus::Waiting;
        }
        state.waiting.push_back(id);
    }
}

//! External collaborator boundaries: persistence, real-time fan-out and
//! object storage.
//!
//! The relational store, the push transport and the blob store are
//! separate services; this module defines the traits the engine calls
//! them through, plus in-memory implementations used by the tests and
//! by embedders running the engine standalone.

use crate::error::{EngineError, Result};
use crate::types::{
    ExecutionRecord, ExecutionStatus, LogLevel, ScheduledJob, VariableMap, WorkflowDefinition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Realtime event names fanned out to subscribers.
pub mod events {
    pub const EXECUTION_STATUS: &str = "execution:status";
    pub const EXECUTION_LOG: &str = "execution:log";
    pub const EXECUTION_COMPLETED: &str = "execution:completed";
    pub const EXECUTION_FAILED: &str = "execution:failed";
}

/// Partial update applied to an execution record at run end.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub extracted_data: Option<VariableMap>,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<()>;
    async fn update_execution_status(&self, id: &str, status: ExecutionStatus) -> Result<()>;
    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> Result<()>;
    async fn add_log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: &str,
        step_id: Option<&str>,
    ) -> Result<()>;
    async fn get_execution(&self, id: &str, user_id: &str) -> Result<Option<ExecutionRecord>>;
    /// Most recent executions of a workflow, newest first.
    async fn list_recent_executions(
        &self,
        workflow_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(
        &self,
        workflow_id: &str,
        user_id: &str,
    ) -> Result<Option<WorkflowDefinition>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, job: ScheduledJob) -> Result<()>;
    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledJob>>;
    /// Active schedules whose `next_run_at` is at or before `now`.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>>;
    async fn update_run_times(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_active(&self, id: &str, active: bool) -> Result<()>;
}

#[async_trait]
pub trait RealtimeBroadcaster: Send + Sync {
    async fn broadcast_to_execution(&self, execution_id: &str, event: &str, payload: Value);
    async fn broadcast_to_user(&self, user_id: &str, event: &str, payload: Value);
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the stored object's path. Callers treat failures as
    /// best-effort: logged, never fatal to a run.
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;
}

// ---------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub execution_id: String,
    pub level: LogLevel,
    pub message: String,
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<String, ExecutionRecord>>,
    logs: RwLock<Vec<LogEntry>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs_for(&self, execution_id: &str) -> Vec<LogEntry> {
        self.logs
            .read()
            .iter()
            .filter(|entry| entry.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<()> {
        self.executions.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_execution_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(id)
            .ok_or_else(|| EngineError::Storage(format!("execution not found: {id}")))?;
        record.status = status;
        if status == ExecutionStatus::Running && record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> Result<()> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(id)
            .ok_or_else(|| EngineError::Storage(format!("execution not found: {id}")))?;
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(completed_at) = update.completed_at {
            record.completed_at = Some(completed_at);
        }
        if let Some(duration_ms) = update.duration_ms {
            record.duration_ms = Some(duration_ms);
        }
        if let Some(extracted_data) = update.extracted_data {
            record.extracted_data = Some(extracted_data);
        }
        if let Some(error_message) = update.error_message {
            record.error_message = Some(error_message);
        }
        Ok(())
    }

    async fn add_log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: &str,
        step_id: Option<&str>,
    ) -> Result<()> {
        self.logs.write().push(LogEntry {
            execution_id: execution_id.to_string(),
            level,
            message: message.to_string(),
            step_id: step_id.map(str::to_string),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn get_execution(&self, id: &str, user_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .executions
            .read()
            .get(id)
            .filter(|record| record.user_id == user_id)
            .cloned())
    }

    async fn list_recent_executions(
        &self,
        workflow_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .read()
            .values()
            .filter(|record| record.workflow_id == workflow_id && record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<String, (String, WorkflowDefinition)>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow_id: &str, user_id: &str, definition: WorkflowDefinition) {
        self.workflows
            .write()
            .insert(workflow_id.to_string(), (user_id.to_string(), definition));
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn get_workflow(
        &self,
        workflow_id: &str,
        user_id: &str,
    ) -> Result<Option<WorkflowDefinition>> {
        Ok(self
            .workflows
            .read()
            .get(workflow_id)
            .filter(|(owner, _)| owner == user_id)
            .map(|(_, definition)| definition.clone()))
    }
}

#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<String, ScheduledJob>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.schedules.read().len()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn create_schedule(&self, job: ScheduledJob) -> Result<()> {
        self.schedules.write().insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.schedules.read().get(id).cloned())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        Ok(self
            .schedules
            .read()
            .values()
            .filter(|job| job.is_active && job.next_run_at <= now)
            .cloned()
            .collect())
    }

    async fn update_run_times(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut schedules = self.schedules.write();
        let job = schedules
            .get_mut(id)
            .ok_or_else(|| EngineError::ScheduleNotFound(id.to_string()))?;
        job.last_run_at = Some(last_run_at);
        job.next_run_at = next_run_at;
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut schedules = self.schedules.write();
        let job = schedules
            .get_mut(id)
            .ok_or_else(|| EngineError::ScheduleNotFound(id.to_string()))?;
        job.is_active = active;
        Ok(())
    }
}

/// One captured realtime broadcast, for assertions and local debugging.
#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    /// `execution:<id>` or `user:<id>`.
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Default)]
pub struct MemoryBroadcaster {
    records: RwLock<Vec<BroadcastRecord>>,
}

impl MemoryBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<BroadcastRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl RealtimeBroadcaster for MemoryBroadcaster {
    async fn broadcast_to_execution(&self, execution_id: &str, event: &str, payload: Value) {
        self.records.write().push(BroadcastRecord {
            channel: format!("execution:{execution_id}"),
            event: event.to_string(),
            payload,
        });
    }

    async fn broadcast_to_user(&self, user_id: &str, event: &str, payload: Value) {
        self.records.write().push(BroadcastRecord {
            channel: format!("user:{user_id}"),
            event: event.to_string(),
            payload,
        });
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.objects.read().get(&format!("{bucket}/{path}")).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String> {
        let key = format!("{bucket}/{path}");
        self.objects.write().insert(key.clone(), bytes);
        Ok(key)
    }
}

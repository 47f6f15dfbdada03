//! Task request and task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::RetryMetadata;
use super::errors::{ConductorError, ExecutionError};
use super::ids::TaskId;
use super::state::TaskStatus;
use crate::config::{RetryConfig, TimeoutConfig};

/// Per-task options. Anything left unset falls back to the queue defaults
/// when the task is submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,

    /// Opaque data handed to the executor along with the instruction
    /// (working directory, session id, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub instruction: String,
    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            options: TaskOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.options.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.options.context = context;
        self
    }

    /// Reject malformed requests before a task is created.
    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.instruction.trim().is_empty() {
            return Err(ConductorError::InvalidRequest(
                "instruction must not be empty".to_string(),
            ));
        }
        if let Some(retry) = &self.options.retry {
            retry.validate()?;
        }
        if let Some(timeout) = &self.options.timeout {
            timeout.validate()?;
        }
        Ok(())
    }
}

/// Successful output of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl TaskOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            logs: Vec::new(),
        }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }
}

/// Error summary kept on the record (message + code, no logs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&ExecutionError> for TaskError {
    fn from(err: &ExecutionError) -> Self {
        Self {
            message: err.message.clone(),
            code: err.code.clone(),
        }
    }
}

/// The task record.
///
/// - One record per task id; a retry mutates this record in place so the
///   attempt history accumulates instead of forking.
/// - `added_at <= started_at <= completed_at`, each written once.
/// - `result` and `error` are mutually exclusive once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub instruction: String,
    pub options: TaskOptions,
    pub priority: i32,
    pub status: TaskStatus,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskOutput>,
    pub error: Option<TaskError>,
    pub retry_metadata: Option<RetryMetadata>,
}

impl Task {
    pub fn new(id: TaskId, request: TaskRequest, priority: i32, added_at: DateTime<Utc>) -> Self {
        let retry_metadata = request
            .options
            .retry
            .as_ref()
            .map(|retry| RetryMetadata::new(retry.max_retries));
        Self {
            id,
            instruction: request.instruction,
            options: request.options,
            priority,
            status: TaskStatus::Pending,
            added_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_metadata,
        }
    }

    /// Mark as running. `started_at` keeps the first attempt's start; a
    /// scheduled retry that is now running is no longer scheduled.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at.get_or_insert(now.max(self.added_at));
        if let Some(meta) = self.retry_metadata.as_mut() {
            meta.next_retry_at = None;
        }
        true
    }

    pub fn complete(&mut self, output: TaskOutput, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(TaskStatus::Completed) {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(output);
        self.error = None;
        self.finish(now);
        true
    }

    pub fn fail(&mut self, error: TaskError, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(TaskStatus::Failed) {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.result = None;
        self.finish(now);
        true
    }

    /// Cancel; also clears a scheduled retry.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(TaskStatus::Cancelled) {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.result = None;
        self.finish(now);
        true
    }

    /// Back to pending with updated metadata (retry back-edge).
    pub fn schedule_retry(&mut self, metadata: RetryMetadata, error: TaskError) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Pending;
        self.retry_metadata = Some(metadata);
        self.error = Some(error);
        true
    }

    /// Running at restart means "outcome unknown": redo it.
    pub fn reset_after_restart(&mut self) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Pending;
        true
    }

    /// Pending and waiting for a scheduled retry.
    pub fn is_retry_pending(&self) -> bool {
        self.status == TaskStatus::Pending
            && self
                .retry_metadata
                .as_ref()
                .is_some_and(|meta| meta.next_retry_at.is_some())
    }

    /// Number of retried failures so far.
    pub fn attempts(&self) -> u32 {
        self.retry_metadata
            .as_ref()
            .map(|meta| meta.current_attempt)
            .unwrap_or(0)
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        let floor = self.started_at.unwrap_or(self.added_at);
        self.completed_at.get_or_insert(now.max(floor));
        if let Some(meta) = self.retry_metadata.as_mut() {
            meta.next_retry_at = None;
        }
    }
}

//! Retry metadata and attempt history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskError;

/// One failed attempt that was retried.
///
/// Records what happened (error), when (started/completed) and how long the
/// queue waited before the next attempt (delay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: TaskError,
    /// Backoff applied before the following attempt.
    pub delay_ms: u64,
}

/// Durable retry state of a task.
///
/// Invariants:
/// - `retry_history.len() == current_attempt as usize`
/// - `current_attempt <= max_retries`; reaching `max_retries` makes the next
///   failure terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetadata {
    pub current_attempt: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_history: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryMetadata {
    pub fn new(max_retries: u32) -> Self {
        Self {
            current_attempt: 0,
            max_retries,
            retry_history: Vec::new(),
            next_retry_at: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_attempt >= self.max_retries
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.retry_history.last()
    }
}

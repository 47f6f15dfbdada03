//! Error types.
//!
//! Classification:
//! - submission errors: malformed request, rejected before a task exists
//! - execution errors: returned by the executor, subject to the retry policy
//! - timeout errors: a budget was exceeded (see `queue::timeout`), turned
//!   into an execution error with code `TIMEOUT`
//! - repository errors: best-effort, logged, never change a task outcome
//!
//! Cancellation is not an error; it is a terminal status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;

/// Errors surfaced by the queue API.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Errors from the persistence boundary.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by (or on behalf of) the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl ExecutionError {
    pub const TIMEOUT: &'static str = "TIMEOUT";
    pub const PANIC: &'static str = "PANIC";
    pub const CANCELLED: &'static str = "CANCELLED";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            logs: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.code.as_deref() == Some(Self::TIMEOUT)
    }
}

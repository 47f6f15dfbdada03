//! Lifecycle events pushed to the observability sink.
//!
//! Every event carries the task id and a timestamp. Events of one task are
//! emitted from that task's execution path only, so their order is
//! `created -> started -> [progress | timeout.warning]* -> completed | failed
//! | retry.scheduled | cancelled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::task::TaskError;
use crate::config::Phase;
use crate::queue::timeout::TimeoutScope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    #[serde(rename = "task.created")]
    Created {
        task_id: TaskId,
        priority: i32,
        at: DateTime<Utc>,
    },

    #[serde(rename = "task.started")]
    Started {
        task_id: TaskId,
        /// 1-based, numbered like `AttemptRecord::attempt`.
        attempt: u32,
        at: DateTime<Utc>,
    },

    #[serde(rename = "task.progress")]
    Progress {
        task_id: TaskId,
        message: String,
        at: DateTime<Utc>,
    },

    #[serde(rename = "task.timeout.warning")]
    TimeoutWarning {
        task_id: TaskId,
        scope: TimeoutScope,
        phase: Phase,
        elapsed_ms: u64,
        limit_ms: u64,
        at: DateTime<Utc>,
    },

    #[serde(rename = "task.completed")]
    Completed {
        task_id: TaskId,
        started_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },

    #[serde(rename = "task.failed")]
    Failed {
        task_id: TaskId,
        error: TaskError,
        attempts: u32,
        at: DateTime<Utc>,
    },

    #[serde(rename = "task.retry.scheduled")]
    RetryScheduled {
        task_id: TaskId,
        /// The attempt that failed (1-based), equal to the attempt count so far.
        attempt: u32,
        delay_ms: u64,
        next_retry_at: DateTime<Utc>,
        error: TaskError,
        at: DateTime<Utc>,
    },

    #[serde(rename = "task.cancelled")]
    Cancelled {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Created { task_id, .. }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::TimeoutWarning { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::RetryScheduled { task_id, .. }
            | TaskEvent::Cancelled { task_id, .. } => *task_id,
        }
    }

    /// Dotted event name, same as the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "task.created",
            TaskEvent::Started { .. } => "task.started",
            TaskEvent::Progress { .. } => "task.progress",
            TaskEvent::TimeoutWarning { .. } => "task.timeout.warning",
            TaskEvent::Completed { .. } => "task.completed",
            TaskEvent::Failed { .. } => "task.failed",
            TaskEvent::RetryScheduled { .. } => "task.retry.scheduled",
            TaskEvent::Cancelled { .. } => "task.cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed { .. } | TaskEvent::Failed { .. } | TaskEvent::Cancelled { .. }
        )
    }
}

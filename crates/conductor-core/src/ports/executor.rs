//! Executor port - the execution boundary.
//!
//! The queue calls [`Executor::execute`] once per attempt. Retries call it
//! again with the same instruction, so executors must tolerate repeated
//! calls for the same logical work.
//!
//! Cancellation is cooperative: the queue cancels `ctx.cancel` and waits
//! for `execute` to return. It never aborts the future.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{ExecutionError, TaskId, TaskOutput};
use crate::queue::timeout::TimeoutHandle;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        instruction: &str,
        ctx: ExecutionContext,
    ) -> Result<TaskOutput, ExecutionError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "executor"
    }
}

/// Everything an attempt gets besides the instruction.
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    /// 0 for the first run, n for the n-th retry.
    pub attempt: u32,
    /// `TaskOptions::context` of the task.
    pub context: serde_json::Value,
    /// Set on `cancel_task` or when a timeout ends the attempt.
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
    pub timeout: TimeoutHandle,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

type ProgressFn = dyn Fn(TaskId, String) + Send + Sync;

/// Emits `task.progress` events for one task.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    report: Option<Arc<ProgressFn>>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, report: Arc<ProgressFn>) -> Self {
        Self {
            task_id,
            report: Some(report),
        }
    }

    /// Reporter that drops every message.
    pub fn noop(task_id: TaskId) -> Self {
        Self {
            task_id,
            report: None,
        }
    }

    pub fn report(&self, message: impl Into<String>) {
        if let Some(report) = &self.report {
            report(self.task_id, message.into());
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use ulid::Ulid;

    #[test]
    fn reporter_forwards_task_id_and_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = TaskId::from_ulid(Ulid::new());
        let reporter = ProgressReporter::new(
            id,
            Arc::new(move |task_id, message| sink.lock().unwrap().push((task_id, message))),
        );

        reporter.report("cloning repo");
        reporter.clone().report("running tests");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (id, "cloning repo".to_string()));
    }

    #[test]
    fn noop_reporter_is_silent() {
        ProgressReporter::noop(TaskId::from_ulid(Ulid::new())).report("ignored");
    }
}

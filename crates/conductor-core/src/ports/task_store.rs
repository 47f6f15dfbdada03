//! TaskRepository port - the persistence boundary.
//!
//! The in-memory task map is authoritative while the process runs; the
//! repository is write-behind. It exists for two readers:
//! - restart recovery (`get_pending_or_running`)
//! - external status queries (`find_by_id`)
//!
//! The queue logs repository failures and carries on, so implementations
//! should not retry internally for long.
//!
//! Writes for one task may arrive out of order (a cancel racing the
//! runner). A terminal status is final: implementations ignore status
//! writes and `reset_for_retry` that would move a terminal record back.
//! The queue also writes `cancelled` again when it sees it raced.

use async_trait::async_trait;

use crate::domain::{RepositoryError, RetryMetadata, Task, TaskError, TaskId, TaskOutput, TaskStatus};

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Store a freshly submitted task.
    async fn create_task(&self, task: &Task) -> Result<(), RepositoryError>;

    /// Write a status change. `error` is set for `failed`, cleared otherwise.
    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<&TaskError>,
    ) -> Result<(), RepositoryError>;

    /// Write the successful output.
    async fn update_result(&self, id: TaskId, output: &TaskOutput) -> Result<(), RepositoryError>;

    /// Replace retry metadata (history and `next_retry_at` included).
    async fn update_retry_metadata(
        &self,
        id: TaskId,
        metadata: &RetryMetadata,
    ) -> Result<(), RepositoryError>;

    /// Put a task back to `pending` for its next attempt.
    async fn reset_for_retry(&self, id: TaskId) -> Result<(), RepositoryError>;

    /// Tasks that were not finished when the process stopped.
    async fn get_pending_or_running(&self) -> Result<Vec<Task>, RepositoryError>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, RepositoryError>;
}

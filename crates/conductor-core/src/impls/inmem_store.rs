//! In-memory task repository, for tests and embedding.
//!
//! Survives nothing but a queue rebuilt in the same process, which is
//! enough to exercise restart recovery in tests.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::records::StoredTasks;
use crate::domain::{RepositoryError, RetryMetadata, Task, TaskError, TaskId, TaskOutput, TaskStatus};
use crate::ports::TaskRepository;

#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<StoredTasks>,
}

impl InMemoryTaskRepository {
    /// Repository pre-filled with `tasks` (as if left by a previous run).
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(StoredTasks::from_tasks(tasks)),
        }
    }

    /// Every stored record, oldest first.
    pub async fn all(&self) -> Vec<Task> {
        self.tasks.read().await.to_vec()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create_task(&self, task: &Task) -> Result<(), RepositoryError> {
        self.tasks.write().await.create(task);
        Ok(())
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<&TaskError>,
    ) -> Result<(), RepositoryError> {
        self.tasks
            .write()
            .await
            .update_status(id, status, error, Utc::now())
    }

    async fn update_result(&self, id: TaskId, output: &TaskOutput) -> Result<(), RepositoryError> {
        self.tasks.write().await.update_result(id, output)
    }

    async fn update_retry_metadata(
        &self,
        id: TaskId,
        metadata: &RetryMetadata,
    ) -> Result<(), RepositoryError> {
        self.tasks.write().await.update_retry_metadata(id, metadata)
    }

    async fn reset_for_retry(&self, id: TaskId) -> Result<(), RepositoryError> {
        self.tasks.write().await.reset_for_retry(id)
    }

    async fn get_pending_or_running(&self) -> Result<Vec<Task>, RepositoryError> {
        Ok(self.tasks.read().await.pending_or_running())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.read().await.find(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRequest;
    use ulid::Ulid;

    fn task() -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskRequest::new("x"),
            0,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn status_updates_fill_timestamps() {
        let repo = InMemoryTaskRepository::default();
        let t = task();
        repo.create_task(&t).await.unwrap();

        repo.update_status(t.id, TaskStatus::Running, None).await.unwrap();
        let err = TaskError {
            message: "boom".into(),
            code: Some("E".into()),
        };
        repo.update_status(t.id, TaskStatus::Failed, Some(&err)).await.unwrap();

        let stored = repo.find_by_id(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error, Some(err));
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        assert!(repo.get_pending_or_running().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let repo = InMemoryTaskRepository::default();
        let id = TaskId::from_ulid(Ulid::new());
        let err = repo.reset_for_retry(id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn pending_and_running_are_returned_for_recovery() {
        let (a, b, c) = (task(), task(), task());
        let repo = InMemoryTaskRepository::with_tasks(vec![a.clone(), b.clone(), c.clone()]);
        repo.update_status(b.id, TaskStatus::Running, None).await.unwrap();
        repo.update_status(c.id, TaskStatus::Cancelled, None).await.unwrap();

        let ids: Vec<TaskId> = repo
            .get_pending_or_running()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
    }

    #[tokio::test]
    async fn late_writes_do_not_revive_a_cancelled_task() {
        let t = task();
        let repo = InMemoryTaskRepository::with_tasks(vec![t.clone()]);
        repo.update_status(t.id, TaskStatus::Cancelled, None).await.unwrap();

        repo.update_status(t.id, TaskStatus::Running, None).await.unwrap();
        repo.reset_for_retry(t.id).await.unwrap();
        let mut meta = RetryMetadata::new(3);
        meta.next_retry_at = Some(Utc::now());
        repo.update_retry_metadata(t.id, &meta).await.unwrap();

        let stored = repo.find_by_id(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.retry_metadata.unwrap().next_retry_at.is_none());
        assert!(repo.get_pending_or_running().await.unwrap().is_empty());
    }
}

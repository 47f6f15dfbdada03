//! JSON file task repository.
//!
//! One pretty-printed JSON array holds every record. Each write rewrites
//! the whole file through a temporary sibling and a rename, so a crash
//! leaves either the old or the new document, never half of one. Suits the
//! single-process scale the queue targets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::records::StoredTasks;
use crate::domain::{RepositoryError, RetryMetadata, Task, TaskError, TaskId, TaskOutput, TaskStatus};
use crate::ports::TaskRepository;

#[derive(Debug)]
pub struct JsonFileTaskRepository {
    path: PathBuf,
    /// Loaded on first use.
    cache: Mutex<Option<StoredTasks>>,
}

impl JsonFileTaskRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored record, oldest first.
    pub async fn all(&self) -> Result<Vec<Task>, RepositoryError> {
        let mut cache = self.cache.lock().await;
        Ok(self.loaded(&mut cache).await?.to_vec())
    }

    async fn loaded<'a>(
        &self,
        cache: &'a mut Option<StoredTasks>,
    ) -> Result<&'a mut StoredTasks, RepositoryError> {
        if cache.is_none() {
            *cache = Some(self.read().await?);
        }
        cache
            .as_mut()
            .ok_or_else(|| RepositoryError::Storage("task cache not loaded".to_string()))
    }

    async fn read(&self) -> Result<StoredTasks, RepositoryError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoredTasks::default());
            }
            Err(err) => return Err(err.into()),
        };
        if content.trim().is_empty() {
            return Ok(StoredTasks::default());
        }
        let tasks: Vec<Task> = serde_json::from_str(&content)?;
        Ok(StoredTasks::from_tasks(tasks))
    }

    async fn write(&self, tasks: &StoredTasks) -> Result<(), RepositoryError> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        let content = serde_json::to_string_pretty(&tasks.to_vec())?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Load, apply `update`, write back. On a failed write the cache is
    /// dropped so the next call re-reads the file.
    async fn mutate<F>(&self, update: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut StoredTasks) -> Result<(), RepositoryError> + Send,
    {
        let mut cache = self.cache.lock().await;
        let tasks = self.loaded(&mut cache).await?;
        update(tasks)?;
        let snapshot = tasks.clone();
        if let Err(err) = self.write(&snapshot).await {
            *cache = None;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for JsonFileTaskRepository {
    async fn create_task(&self, task: &Task) -> Result<(), RepositoryError> {
        self.mutate(|tasks| {
            tasks.create(task);
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<&TaskError>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        self.mutate(|tasks| tasks.update_status(id, status, error, now))
            .await
    }

    async fn update_result(&self, id: TaskId, output: &TaskOutput) -> Result<(), RepositoryError> {
        self.mutate(|tasks| tasks.update_result(id, output)).await
    }

    async fn update_retry_metadata(
        &self,
        id: TaskId,
        metadata: &RetryMetadata,
    ) -> Result<(), RepositoryError> {
        self.mutate(|tasks| tasks.update_retry_metadata(id, metadata))
            .await
    }

    async fn reset_for_retry(&self, id: TaskId) -> Result<(), RepositoryError> {
        self.mutate(|tasks| tasks.reset_for_retry(id)).await
    }

    async fn get_pending_or_running(&self) -> Result<Vec<Task>, RepositoryError> {
        let mut cache = self.cache.lock().await;
        Ok(self.loaded(&mut cache).await?.pending_or_running())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, RepositoryError> {
        let mut cache = self.cache.lock().await;
        Ok(self.loaded(&mut cache).await?.find(id))
    }
}

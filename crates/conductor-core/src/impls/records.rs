//! Record bookkeeping shared by the repository adapters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::{RepositoryError, RetryMetadata, Task, TaskError, TaskId, TaskOutput, TaskStatus};

/// Task records keyed by id, with the repository update semantics.
#[derive(Debug, Clone, Default)]
pub(crate) struct StoredTasks {
    tasks: HashMap<TaskId, Task>,
}

impl StoredTasks {
    pub(crate) fn from_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|task| (task.id, task)).collect(),
        }
    }

    /// Oldest submission first.
    pub(crate) fn to_vec(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub(crate) fn create(&mut self, task: &Task) {
        self.tasks.insert(task.id, task.clone());
    }

    /// Timestamps are filled in here when the queue did not send them:
    /// `started_at` on the first `running`, `completed_at` on a terminal
    /// status.
    ///
    /// A terminal record keeps its status; a late write for an earlier
    /// transition is ignored.
    pub(crate) fn update_status(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        error: Option<&TaskError>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let task = self.get_mut(id)?;
        if task.status.is_terminal() && task.status != status {
            return Ok(());
        }
        task.status = status;
        match status {
            TaskStatus::Running => {
                task.started_at.get_or_insert(now);
            }
            TaskStatus::Completed => {
                task.error = None;
                task.completed_at.get_or_insert(now);
            }
            TaskStatus::Failed => {
                task.error = error.cloned();
                task.result = None;
                task.completed_at.get_or_insert(now);
            }
            TaskStatus::Cancelled => {
                task.completed_at.get_or_insert(now);
                if let Some(meta) = task.retry_metadata.as_mut() {
                    meta.next_retry_at = None;
                }
            }
            TaskStatus::Pending => {}
        }
        Ok(())
    }

    pub(crate) fn update_result(&mut self, id: TaskId, output: &TaskOutput) -> Result<(), RepositoryError> {
        self.get_mut(id)?.result = Some(output.clone());
        Ok(())
    }

    pub(crate) fn update_retry_metadata(
        &mut self,
        id: TaskId,
        metadata: &RetryMetadata,
    ) -> Result<(), RepositoryError> {
        let task = self.get_mut(id)?;
        if let Some(last) = metadata.last_attempt() {
            task.error = Some(last.error.clone());
        }
        let mut metadata = metadata.clone();
        if task.status.is_terminal() {
            metadata.next_retry_at = None;
        }
        task.retry_metadata = Some(metadata);
        Ok(())
    }

    /// Ignored for a terminal record.
    pub(crate) fn reset_for_retry(&mut self, id: TaskId) -> Result<(), RepositoryError> {
        let task = self.get_mut(id)?;
        if !task.status.is_terminal() {
            task.status = TaskStatus::Pending;
        }
        Ok(())
    }

    pub(crate) fn pending_or_running(&self) -> Vec<Task> {
        self.to_vec()
            .into_iter()
            .filter(|task| task.status.is_active())
            .collect()
    }

    pub(crate) fn find(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).cloned()
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut Task, RepositoryError> {
        self.tasks.get_mut(&id).ok_or(RepositoryError::NotFound(id))
    }
}

//! In-memory queue state.
//!
//! The task map here is the single source of truth for runtime status. All
//! mutation goes through the methods below, which are synchronous: the
//! owner holds the lock for a short, await-free critical section and does
//! persistence, events and observers after releasing it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ready::{ReadyQueue, RetrySchedule};
use super::retry::RetryPolicy;
use super::timeout::TimeoutError;
use crate::domain::{ExecutionError, Task, TaskError, TaskId, TaskOutput, TaskStatus};
use crate::observability::QueueStats;

/// How an attempt ended, as far as the task record is concerned.
#[derive(Debug)]
pub(crate) enum Settlement {
    Completed(Task),
    /// Back to pending. The retry is not armed yet: the runner records it
    /// first and then calls [`QueueState::arm_retry`] with `due`.
    RetryScheduled {
        task: Task,
        delay: Duration,
        due: Instant,
        error: TaskError,
    },
    Failed(Task),
    /// The task left `running` while the attempt was in flight (cancelled).
    /// Its late result is dropped.
    Superseded,
}

/// A task handed to a runner.
#[derive(Debug)]
pub(crate) struct Lease {
    pub(crate) task: Task,
    pub(crate) cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    records: HashMap<TaskId, Task>,
    ready: ReadyQueue,
    scheduled: RetrySchedule,
    /// Cancellation tokens of running attempts.
    tokens: HashMap<TaskId, CancellationToken>,
    /// Attempts whose runner has not finished yet, cancelled ones included.
    in_flight: usize,
}

impl QueueState {
    pub(crate) fn contains(&self, id: &TaskId) -> bool {
        self.records.contains_key(id)
    }

    pub(crate) fn get(&self, id: &TaskId) -> Option<&Task> {
        self.records.get(id)
    }

    /// Insert a new pending task at the back of its priority.
    pub(crate) fn insert(&mut self, task: Task) {
        self.ready.push(task.id, task.priority);
        self.records.insert(task.id, task);
    }

    /// Insert a task loaded from the repository. `delay` postpones it
    /// (a retry that was not due yet when the process stopped).
    pub(crate) fn insert_restored(&mut self, task: Task, delay: Option<Duration>, now: Instant) {
        match delay {
            Some(delay) => self.scheduled.push(task.id, now + delay),
            None => self.ready.push(task.id, task.priority),
        }
        self.records.insert(task.id, task);
    }

    /// Move tasks from scheduled to ready if their time has come.
    pub(crate) fn promote_due(&mut self, now: Instant) {
        while let Some(id) = self.scheduled.pop_due(now) {
            if let Some(task) = self.records.get(&id)
                && task.status == TaskStatus::Pending
            {
                self.ready.push(id, task.priority);
            }
        }
    }

    pub(crate) fn next_retry_due(&self) -> Option<Instant> {
        self.scheduled.next_due()
    }

    /// Pop the best runnable task and mark it running.
    pub(crate) fn take_next(&mut self, now: DateTime<Utc>) -> Option<Lease> {
        while let Some(id) = self.ready.pop() {
            let Some(task) = self.records.get_mut(&id) else {
                continue;
            };
            if !task.start(now) {
                // stale entry
                continue;
            }
            let cancel = CancellationToken::new();
            self.tokens.insert(id, cancel.clone());
            self.in_flight += 1;
            return Some(Lease {
                task: task.clone(),
                cancel,
            });
        }
        None
    }

    /// Apply an attempt's result to its record.
    ///
    /// A timeout replaces a failure's error with the timeout error (logs
    /// kept). A success stays a success even if a timeout fired.
    pub(crate) fn settle(
        &mut self,
        id: TaskId,
        result: Result<TaskOutput, ExecutionError>,
        timeout: Option<TimeoutError>,
        attempt_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Settlement {
        self.tokens.remove(&id);
        let Some(task) = self.records.get_mut(&id) else {
            return Settlement::Superseded;
        };
        if task.status != TaskStatus::Running {
            return Settlement::Superseded;
        }

        let error = match result {
            Ok(output) => {
                task.complete(output, now);
                return Settlement::Completed(task.clone());
            }
            Err(err) => match timeout {
                Some(timeout) => ExecutionError::from(&timeout).with_logs(err.logs),
                None => err,
            },
        };

        let policy = task.options.retry.clone().map(RetryPolicy::new);
        match policy {
            Some(policy) if policy.should_retry(task.attempts(), &error) => {
                let (metadata, delay) = policy.update_retry_metadata(
                    task.retry_metadata.take(),
                    &error,
                    attempt_started_at,
                    now,
                );
                let summary = TaskError::from(&error);
                task.schedule_retry(metadata, summary.clone());
                Settlement::RetryScheduled {
                    task: task.clone(),
                    delay,
                    due: Instant::now() + delay,
                    error: summary,
                }
            }
            _ => {
                task.fail(TaskError::from(&error), now);
                Settlement::Failed(task.clone())
            }
        }
    }

    /// Make a recorded retry eligible once `due` passes. Does nothing if the
    /// task was cancelled in the meantime.
    pub(crate) fn arm_retry(&mut self, id: TaskId, due: Instant) -> bool {
        if !self.records.get(&id).is_some_and(Task::is_retry_pending) {
            return false;
        }
        self.scheduled.push(id, due);
        true
    }

    /// Cancel a pending or running task.
    ///
    /// Returns the cancelled record and, when it was running, the token of
    /// its attempt. A scheduled retry is dropped: its heap entry goes stale.
    pub(crate) fn cancel(
        &mut self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Option<(Task, Option<CancellationToken>)> {
        let task = self.records.get_mut(&id)?;
        if !task.cancel(now) {
            return None;
        }
        let snapshot = task.clone();
        Some((snapshot, self.tokens.get(&id).cloned()))
    }

    /// A runner finished (whatever the outcome).
    pub(crate) fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// No task pending or running and no runner still finishing.
    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.records.values().all(|task| task.status.is_terminal())
    }

    pub(crate) fn stats(&self, is_paused: bool) -> QueueStats {
        let mut stats = QueueStats {
            is_paused,
            ..QueueStats::default()
        };
        for task in self.records.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// All records, oldest submission first.
    pub(crate) fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.records.values().cloned().collect();
        tasks.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Retries still waiting, earliest first. Stale entries are left out.
    pub(crate) fn scheduled_retries(&self) -> Vec<(TaskId, Instant)> {
        let mut due: Vec<(TaskId, Instant)> = self
            .scheduled
            .iter()
            .filter(|(id, _)| self.records.get(id).is_some_and(Task::is_retry_pending))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due
    }
}

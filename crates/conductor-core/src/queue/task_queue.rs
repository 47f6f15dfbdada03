//! The task queue: submission, admission control, cancellation, recovery.
//!
//! A [`TaskQueue`] is a cheap handle (`Clone`) over one engine instance.
//! The engine owns the task map, the run/retry queues, a semaphore bounding
//! concurrency and a dispatcher task that leases runnable tasks as slots
//! free up. Each leased task runs on its own tokio task (see `runner`).

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::builder::QueueBuilder;
use super::runner;
use super::state::QueueState;
use crate::config::QueueConfig;
use crate::domain::{
    ConductorError, RepositoryError, Task, TaskEvent, TaskId, TaskRequest, TaskStatus,
};
use crate::observability::QueueStats;
use crate::ports::{Clock, EventSink, Executor, IdGenerator, TaskObserver, TaskRepository};

/// A retry waiting for its delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub task_id: TaskId,
    pub due: Instant,
}

/// Handle to a running queue engine.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

pub(super) struct QueueInner {
    pub(super) config: QueueConfig,
    pub(super) state: Mutex<QueueState>,
    paused: AtomicBool,
    /// Wakes the dispatcher (new task, retry, start, free slot).
    pub(super) wake: Notify,
    /// Wakes `wait_for_idle`/`shutdown` waiters.
    pub(super) changed: Notify,
    pub(super) slots: Arc<Semaphore>,
    pub(super) repository: Arc<dyn TaskRepository>,
    pub(super) executor: Arc<dyn Executor>,
    pub(super) events: Arc<dyn EventSink>,
    pub(super) clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    observers: RwLock<Vec<Arc<dyn TaskObserver>>>,
    shutdown: watch::Sender<bool>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Everything a queue is made of; assembled by [`QueueBuilder`].
pub(super) struct QueueParts {
    pub(super) config: QueueConfig,
    pub(super) repository: Arc<dyn TaskRepository>,
    pub(super) executor: Arc<dyn Executor>,
    pub(super) events: Arc<dyn EventSink>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) observers: Vec<Arc<dyn TaskObserver>>,
}

impl TaskQueue {
    pub fn builder(executor: Arc<dyn Executor>) -> QueueBuilder {
        QueueBuilder::new(executor)
    }

    /// Created paused; the builder restores and starts it.
    pub(super) fn from_parts(parts: QueueParts) -> Self {
        let (shutdown, _) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(parts.config.concurrency));
        Self {
            inner: Arc::new(QueueInner {
                config: parts.config,
                state: Mutex::new(QueueState::default()),
                paused: AtomicBool::new(true),
                wake: Notify::new(),
                changed: Notify::new(),
                slots,
                repository: parts.repository,
                executor: parts.executor,
                events: parts.events,
                clock: parts.clock,
                ids: parts.ids,
                observers: RwLock::new(parts.observers),
                shutdown,
                dispatcher: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Submit a task.
    ///
    /// Options missing from the request are filled from the queue defaults
    /// and stored on the task, so a restored task keeps the policy it was
    /// submitted with. The task is persisted first; if that fails it is
    /// logged and the task runs anyway.
    pub async fn add(&self, request: TaskRequest, priority: i32) -> Result<TaskId, ConductorError> {
        request.validate()?;
        let mut request = request;
        if request.options.retry.is_none() {
            request.options.retry = self.inner.config.retry.clone();
        }
        if request.options.timeout.is_none() {
            request.options.timeout = Some(self.inner.config.timeout.clone());
        }

        let inner = &self.inner;
        let id = inner.ids.generate_task_id();
        let task = Task::new(id, request, priority, inner.clock.now());
        inner.persisted(id, "create_task", inner.repository.create_task(&task).await);

        let added_at = task.added_at;
        inner.state.lock().await.insert(task);
        inner.events.emit(TaskEvent::Created {
            task_id: id,
            priority,
            at: added_at,
        });
        debug!(task_id = %id, priority, "task added");
        inner.wake.notify_one();
        Ok(id)
    }

    /// Look a task up in memory, then in the repository.
    pub async fn get(&self, id: TaskId) -> Option<Task> {
        if let Some(task) = self.inner.state.lock().await.get(&id) {
            return Some(task.clone());
        }
        match self.inner.repository.find_by_id(id).await {
            Ok(task) => task,
            Err(err) => {
                warn!(task_id = %id, error = %err, "repository lookup failed");
                None
            }
        }
    }

    /// Every task known to this process, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        self.inner.state.lock().await.list()
    }

    pub async fn stats(&self) -> QueueStats {
        let is_paused = self.is_paused();
        self.inner.state.lock().await.stats(is_paused)
    }

    /// Retries waiting for their delay, earliest first.
    pub async fn scheduled_retries(&self) -> Vec<ScheduledRetry> {
        self.inner
            .state
            .lock()
            .await
            .scheduled_retries()
            .into_iter()
            .map(|(task_id, due)| ScheduledRetry { task_id, due })
            .collect()
    }

    /// Cancel a pending or running task.
    ///
    /// Returns `false` for unknown or already terminal tasks. A running
    /// attempt is asked to stop through its cancellation token and keeps
    /// its concurrency slot until the executor returns; whatever it
    /// returns is dropped. A scheduled retry is dropped as well.
    pub async fn cancel_task(&self, id: TaskId) -> bool {
        let inner = &self.inner;
        let Some((task, token)) = inner.state.lock().await.cancel(id, inner.clock.now()) else {
            return false;
        };
        let was_running = token.is_some();
        if let Some(token) = token {
            token.cancel();
        }

        inner.persisted(
            id,
            "update_status",
            inner
                .repository
                .update_status(id, TaskStatus::Cancelled, None)
                .await,
        );
        if let Some(metadata) = &task.retry_metadata {
            inner.persisted(
                id,
                "update_retry_metadata",
                inner.repository.update_retry_metadata(id, metadata).await,
            );
        }
        inner.events.emit(TaskEvent::Cancelled {
            task_id: id,
            at: task.completed_at.unwrap_or_else(|| inner.clock.now()),
        });
        info!(task_id = %id, was_running, "task cancelled");
        inner.notify_observers(&task);

        inner.changed.notify_waiters();
        inner.wake.notify_one();
        true
    }

    /// Resume admission, spawning the dispatcher on first use.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        let mut dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dispatcher.is_none() {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown.subscribe();
            *dispatcher = Some(tokio::spawn(runner::dispatch_loop(inner, shutdown)));
        }
        drop(dispatcher);
        info!(concurrency = self.inner.config.concurrency, "queue started");
        self.inner.wake.notify_one();
    }

    /// Stop leasing new tasks. Running attempts are not interrupted.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("queue paused");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /// Wait until no task is pending or running.
    ///
    /// Pending includes scheduled retries, so this also waits for them.
    /// On a paused queue with pending tasks it waits for `start()`.
    pub async fn wait_for_idle(&self) {
        self.inner.wait_until(QueueState::is_idle).await;
    }

    /// Register a terminal-state observer.
    pub fn subscribe(&self, observer: Arc<dyn TaskObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Reload unfinished tasks from the repository.
    ///
    /// - `running` records go back to `pending`: an attempt that was in
    ///   flight when the process stopped has an unknown outcome
    /// - priority, retry metadata and submission order are kept
    /// - a retry whose `next_retry_at` is still ahead waits for the rest of
    ///   its delay
    /// - tasks already in memory are skipped, so restoring twice does not
    ///   duplicate anything
    ///
    /// Returns how many tasks were restored.
    pub async fn restore(&self) -> Result<usize, ConductorError> {
        let inner = &self.inner;
        let mut tasks = inner.repository.get_pending_or_running().await?;
        tasks.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));

        let now = inner.clock.now();
        let mut reset = Vec::new();
        let mut restored = 0;
        {
            let mut state = inner.state.lock().await;
            for mut task in tasks {
                if !task.status.is_active() || state.contains(&task.id) {
                    continue;
                }
                if task.reset_after_restart() {
                    reset.push(task.id);
                }
                let delay = task
                    .retry_metadata
                    .as_ref()
                    .and_then(|meta| meta.next_retry_at)
                    .and_then(|at| (at - now).to_std().ok())
                    .filter(|delay| !delay.is_zero());
                debug!(
                    task_id = %task.id,
                    priority = task.priority,
                    delay_ms = delay.map(|d| d.as_millis() as u64),
                    "task restored"
                );
                state.insert_restored(task, delay, Instant::now());
                restored += 1;
            }
        }

        for id in reset {
            inner.persisted(
                id,
                "update_status",
                inner
                    .repository
                    .update_status(id, TaskStatus::Pending, None)
                    .await,
            );
        }
        if restored > 0 {
            info!(restored, "restored unfinished tasks");
            inner.wake.notify_one();
        }
        Ok(restored)
    }

    /// Pause, wait for running attempts to finish, stop the dispatcher.
    ///
    /// Pending tasks stay pending (and persisted); a later process picks
    /// them up through `restore`. A queue that was shut down does not
    /// dispatch again.
    pub async fn shutdown(&self) {
        self.pause();
        self.inner.wait_until(|state| state.in_flight() == 0).await;
        self.inner.shutdown.send_replace(true);
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
        info!("queue shut down");
    }
}

impl QueueInner {
    pub(super) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Log a failed repository write. The in-memory transition stands.
    pub(super) fn persisted(&self, id: TaskId, op: &'static str, result: Result<(), RepositoryError>) {
        if let Err(err) = result {
            warn!(task_id = %id, op, error = %err, "failed to persist task state");
        }
    }

    pub(super) fn notify_observers(&self, task: &Task) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match task.status {
                TaskStatus::Completed => observer.on_completed(task),
                TaskStatus::Failed => observer.on_failed(task),
                TaskStatus::Cancelled => observer.on_cancelled(task),
                TaskStatus::Pending | TaskStatus::Running => {}
            }));
            if outcome.is_err() {
                error!(task_id = %task.id, status = %task.status, "task observer panicked");
            }
        }
    }

    /// Block until `done` holds for the queue state.
    pub(super) async fn wait_until(&self, done: impl Fn(&QueueState) -> bool) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if done(&*self.state.lock().await) {
                return;
            }
            changed.await;
        }
    }

    /// Wait for the next runnable task. Promotes due retries on the way.
    pub(super) async fn next_lease(&self) -> super::state::Lease {
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if !self.is_paused()
                    && let Some(lease) = state.take_next(self.clock.now())
                {
                    debug!(
                        task_id = %lease.task.id,
                        ready = state.ready_len(),
                        in_flight = state.in_flight(),
                        "task leased"
                    );
                    return lease;
                }
                state.next_retry_due()
            };

            if let Some(wake_time) = next_wake {
                tokio::select! {
                    _ = self.wake.notified() => {},
                    _ = tokio::time::sleep_until(wake_time) => {},
                }
            } else {
                self.wake.notified().await;
            }
        }
    }
}


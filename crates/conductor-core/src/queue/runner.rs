//! Dispatcher loop and per-attempt runner.
//!
//! The dispatcher takes a concurrency slot first and only then leases a
//! task, so a lease always has somewhere to run. The runner owns the slot
//! (`OwnedSemaphorePermit`) and the attempt's timeout controller for the
//! whole attempt and gives both back on every exit path.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{Lease, Settlement};
use super::task_queue::QueueInner;
use super::timeout::{TimeoutCallback, TimeoutController, TimeoutError, TimeoutSignal};
use crate::config::{Phase, TimeoutBehavior};
use crate::domain::{ExecutionError, TaskEvent, TaskId, TaskStatus};
use crate::ports::{ExecutionContext, ProgressReporter};

pub(super) async fn dispatch_loop(inner: Arc<QueueInner>, mut shutdown: watch::Receiver<bool>) {
    debug!("dispatcher started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => continue,
            permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // leasing may wait for a long time; stay responsive to shutdown
        let lease = tokio::select! {
            _ = shutdown.changed() => continue,
            lease = inner.next_lease() => lease,
        };

        let runner = Arc::clone(&inner);
        tokio::spawn(async move {
            runner.run(lease, permit).await;
        });
    }
    debug!("dispatcher stopped");
}

type ExpiredSlot = Arc<Mutex<Option<TimeoutError>>>;

impl QueueInner {
    /// Run one attempt and apply its outcome.
    async fn run(self: Arc<Self>, lease: Lease, permit: OwnedSemaphorePermit) {
        let Lease { task, cancel } = lease;
        let id = task.id;
        let attempt = task.attempts();
        let attempt_started_at = self.clock.now();

        self.persisted(
            id,
            "update_status",
            self.repository
                .update_status(id, TaskStatus::Running, None)
                .await,
        );
        // a cancel may have been persisted before the write above landed
        self.repersist_if_cancelled(id).await;
        self.events.emit(TaskEvent::Started {
            task_id: id,
            attempt: attempt + 1,
            at: attempt_started_at,
        });
        info!(task_id = %id, attempt = attempt + 1, executor = self.executor.name(), "task started");

        let timeout_config = task
            .options
            .timeout
            .clone()
            .unwrap_or_else(|| self.config.timeout.clone());
        let expired: ExpiredSlot = Arc::new(Mutex::new(None));
        let controller = TimeoutController::start(
            &timeout_config,
            self.timeout_callback(id, cancel.clone(), Arc::clone(&expired)),
        );

        let ctx = ExecutionContext {
            task_id: id,
            attempt,
            context: task.options.context.clone(),
            cancel,
            progress: self.progress_reporter(id),
            timeout: controller.handle(),
        };
        controller.transition_to_phase(Phase::Execution);
        let result = AssertUnwindSafe(self.executor.execute(&task.instruction, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(task_id = %id, panic = %message, "executor panicked");
                Err(ExecutionError::new(format!("executor panicked: {message}"))
                    .with_code(ExecutionError::PANIC))
            });
        controller.transition_to_phase(Phase::Cleanup);

        let timeout = expired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let settlement = self.state.lock().await.settle(
            id,
            result,
            timeout,
            attempt_started_at,
            self.clock.now(),
        );
        self.record(id, settlement).await;

        controller.dispose();
        self.state.lock().await.release();
        drop(permit);
        self.changed.notify_waiters();
        self.wake.notify_one();
    }

    /// Persist, publish and observe a settled attempt.
    async fn record(&self, id: TaskId, settlement: Settlement) {
        match settlement {
            Settlement::Completed(task) => {
                if let Some(output) = &task.result {
                    self.persisted(
                        id,
                        "update_result",
                        self.repository.update_result(id, output).await,
                    );
                }
                self.persisted(
                    id,
                    "update_status",
                    self.repository
                        .update_status(id, TaskStatus::Completed, None)
                        .await,
                );
                if let Some(metadata) = &task.retry_metadata {
                    self.persisted(
                        id,
                        "update_retry_metadata",
                        self.repository.update_retry_metadata(id, metadata).await,
                    );
                }
                self.events.emit(TaskEvent::Completed {
                    task_id: id,
                    started_at: task.started_at,
                    at: task.completed_at.unwrap_or_else(|| self.clock.now()),
                });
                info!(task_id = %id, attempts = task.attempts() + 1, "task completed");
                self.notify_observers(&task);
            }
            Settlement::RetryScheduled {
                task,
                delay,
                due,
                error,
            } => {
                let now = self.clock.now();
                let (attempt, next_retry_at) = match &task.retry_metadata {
                    Some(metadata) => {
                        self.persisted(
                            id,
                            "update_retry_metadata",
                            self.repository.update_retry_metadata(id, metadata).await,
                        );
                        (
                            metadata.current_attempt,
                            metadata.next_retry_at.unwrap_or(now),
                        )
                    }
                    None => (task.attempts(), now),
                };
                self.persisted(id, "reset_for_retry", self.repository.reset_for_retry(id).await);

                let delay_ms = delay.as_millis() as u64;
                warn!(
                    task_id = %id,
                    attempt,
                    delay_ms,
                    error = %error.message,
                    "attempt failed, retry scheduled"
                );
                // armed and announced together: a cancel that won the race
                // gets no retry event, and the next attempt cannot start
                // before it
                let armed = {
                    let mut state = self.state.lock().await;
                    let armed = state.arm_retry(id, due);
                    if armed {
                        self.events.emit(TaskEvent::RetryScheduled {
                            task_id: id,
                            attempt,
                            delay_ms,
                            next_retry_at,
                            error,
                            at: now,
                        });
                    }
                    armed
                };
                if armed {
                    // the dispatcher may be sleeping past the new due time
                    self.wake.notify_one();
                } else {
                    self.repersist_if_cancelled(id).await;
                }
            }
            Settlement::Failed(task) => {
                self.persisted(
                    id,
                    "update_status",
                    self.repository
                        .update_status(id, TaskStatus::Failed, task.error.as_ref())
                        .await,
                );
                if let Some(metadata) = &task.retry_metadata {
                    self.persisted(
                        id,
                        "update_retry_metadata",
                        self.repository.update_retry_metadata(id, metadata).await,
                    );
                }
                let attempts = task.attempts() + 1;
                if let Some(error) = task.error.clone() {
                    error!(
                        task_id = %id,
                        attempts,
                        error = %error.message,
                        code = error.code.as_deref().unwrap_or(""),
                        "task failed"
                    );
                    self.events.emit(TaskEvent::Failed {
                        task_id: id,
                        error,
                        attempts,
                        at: task.completed_at.unwrap_or_else(|| self.clock.now()),
                    });
                }
                self.notify_observers(&task);
            }
            Settlement::Superseded => {
                debug!(task_id = %id, "attempt ended after the task was cancelled, result dropped");
            }
        }
    }

    /// Write `cancelled` again when the task was cancelled while one of
    /// this attempt's writes was in flight, so a late write cannot leave
    /// an active status in the repository.
    async fn repersist_if_cancelled(&self, id: TaskId) {
        let cancelled = self
            .state
            .lock()
            .await
            .get(&id)
            .is_some_and(|task| task.status == TaskStatus::Cancelled);
        if cancelled {
            debug!(task_id = %id, "task cancelled during a write, persisting cancellation again");
            self.persisted(
                id,
                "update_status",
                self.repository
                    .update_status(id, TaskStatus::Cancelled, None)
                    .await,
            );
        }
    }

    fn progress_reporter(&self, id: TaskId) -> ProgressReporter {
        let events = Arc::clone(&self.events);
        let clock = Arc::clone(&self.clock);
        ProgressReporter::new(
            id,
            Arc::new(move |task_id, message| {
                debug!(task_id = %task_id, %message, "task progress");
                events.emit(TaskEvent::Progress {
                    task_id,
                    message,
                    at: clock.now(),
                });
            }),
        )
    }

    /// Warnings become events. A hard timeout or an expired grace period
    /// cancels the attempt; the first timeout error is kept for the outcome.
    fn timeout_callback(
        &self,
        id: TaskId,
        cancel: CancellationToken,
        expired: ExpiredSlot,
    ) -> TimeoutCallback {
        let events = Arc::clone(&self.events);
        let clock = Arc::clone(&self.clock);
        let keep = move |err: TimeoutError| {
            expired
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get_or_insert(err);
        };
        Arc::new(move |signal| match signal {
            TimeoutSignal::Warning {
                scope,
                phase,
                elapsed,
                limit,
            } => {
                let elapsed_ms = elapsed.as_millis() as u64;
                let limit_ms = limit.as_millis() as u64;
                warn!(task_id = %id, %scope, %phase, elapsed_ms, limit_ms, "timeout warning");
                events.emit(TaskEvent::TimeoutWarning {
                    task_id: id,
                    scope,
                    phase,
                    elapsed_ms,
                    limit_ms,
                    at: clock.now(),
                });
            }
            TimeoutSignal::TimedOut(err) => {
                let hard = err.behavior == TimeoutBehavior::Hard;
                warn!(task_id = %id, error = %err, hard, "task timed out");
                keep(err);
                if hard {
                    cancel.cancel();
                }
            }
            TimeoutSignal::GraceExpired(err) => {
                warn!(task_id = %id, error = %err, "grace period expired, cancelling task");
                keep(err);
                cancel.cancel();
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

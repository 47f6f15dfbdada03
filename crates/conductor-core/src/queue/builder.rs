//! QueueBuilder - wiring and startup of a queue engine.
//!
//! `build()` is fail-fast: the configuration is validated and unfinished
//! tasks are restored from the repository before the queue is handed out,
//! so a recovery problem surfaces at startup instead of as missing work.

use std::sync::Arc;

use super::task_queue::{QueueParts, TaskQueue};
use crate::config::QueueConfig;
use crate::domain::ConductorError;
use crate::impls::{InMemoryTaskRepository, TracingEventSink};
use crate::ports::{
    Clock, EventSink, Executor, IdGenerator, SystemClock, TaskObserver, TaskRepository,
    UlidGenerator,
};

/// Builds a [`TaskQueue`].
///
/// # Example
/// ```ignore
/// let queue = TaskQueue::builder(Arc::new(MyAgent))
///     .config(QueueConfig::default().with_concurrency(4))
///     .repository(Arc::new(JsonFileTaskRepository::new("tasks.json")))
///     .build()
///     .await?;
/// ```
///
/// Defaults: in-memory repository, tracing event sink, system clock, ULID
/// ids.
pub struct QueueBuilder {
    executor: Arc<dyn Executor>,
    config: QueueConfig,
    repository: Option<Arc<dyn TaskRepository>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    observers: Vec<Arc<dyn TaskObserver>>,
}

impl QueueBuilder {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            config: QueueConfig::default(),
            repository: None,
            events: None,
            clock: None,
            ids: None,
            observers: Vec::new(),
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn repository(mut self, repository: Arc<dyn TaskRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate, restore unfinished tasks, and start dispatching when
    /// `auto_start` is set.
    ///
    /// # Errors
    /// - `InvalidConfig` for a configuration `QueueConfig::validate` rejects
    /// - `Repository` when the unfinished tasks cannot be loaded
    pub async fn build(self) -> Result<TaskQueue, ConductorError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let auto_start = self.config.auto_start;

        let queue = TaskQueue::from_parts(QueueParts {
            config: self.config,
            repository: self
                .repository
                .unwrap_or_else(|| Arc::new(InMemoryTaskRepository::default())),
            executor: self.executor,
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            clock,
            ids,
            observers: self.observers,
        });

        queue.restore().await?;
        if auto_start {
            queue.start();
        }
        Ok(queue)
    }
}

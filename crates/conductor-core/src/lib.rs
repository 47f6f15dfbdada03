//! conductor-core
//!
//! Task orchestration for an agent runtime.
//!
//! # Modules
//! - **domain**: task record, status machine, retry history, errors, events
//! - **config**: queue, retry and timeout configuration
//! - **ports**: abstractions the engine depends on (TaskRepository, Executor, EventSink, Clock, ...)
//! - **queue**: the engine (TaskQueue, TimeoutController, RetryPolicy)
//! - **impls**: adapters (in-memory and JSON file repositories, event bus, tracing sink)
//! - **observability**: queue statistics

pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use config::{Phase, QueueConfig, RetryConfig, RetryPolicyKind, TimeoutBehavior, TimeoutConfig};
pub use domain::{
    ConductorError, ExecutionError, RepositoryError, Task, TaskError, TaskEvent, TaskId,
    TaskOutput, TaskRequest, TaskStatus,
};
pub use observability::QueueStats;
pub use ports::{ExecutionContext, Executor};
pub use queue::{QueueBuilder, RetryPolicy, TaskQueue, TimeoutController};

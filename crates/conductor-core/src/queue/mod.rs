//! Orchestration engine: task queue, timeout controller, retry policy.

mod builder;
mod ready;
mod runner;
mod state;
mod task_queue;

pub mod retry;
pub mod timeout;

pub use builder::QueueBuilder;
pub use retry::RetryPolicy;
pub use task_queue::{ScheduledRetry, TaskQueue};
pub use timeout::{
    TimeoutCallback, TimeoutController, TimeoutError, TimeoutHandle, TimeoutScope, TimeoutSignal,
};

//! Ports - boundaries between the orchestration core and the outside world.
//!
//! - [`Executor`]: runs one attempt of a task (the AI agent)
//! - [`TaskRepository`]: durable task records, restart recovery
//! - [`EventSink`]: lifecycle events, best effort
//! - [`TaskObserver`]: terminal-state hooks
//! - [`Clock`] / [`IdGenerator`]: injectable time and identity

pub mod clock;
pub mod event_sink;
pub mod executor;
pub mod id_generator;
pub mod observer;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::executor::{ExecutionContext, Executor, ProgressReporter};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::observer::TaskObserver;
pub use self::task_store::TaskRepository;

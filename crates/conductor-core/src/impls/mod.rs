//! Impls - adapters for the ports.
//!
//! - **InMemoryTaskRepository**: tests and embedding
//! - **JsonFileTaskRepository**: single-file durable store
//! - **EventBus**: bounded fan-out of lifecycle events to subscribers
//! - **TracingEventSink**: lifecycle events as log lines

pub mod event_bus;
pub mod inmem_store;
pub mod json_store;
mod records;
pub mod tracing_sink;

pub use self::event_bus::{EventBus, EventSubscriber};
pub use self::inmem_store::InMemoryTaskRepository;
pub use self::json_store::JsonFileTaskRepository;
pub use self::tracing_sink::TracingEventSink;

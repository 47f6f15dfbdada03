//! EventSink port - the observability boundary.
//!
//! Emission is fire-and-forget: `emit` does not return a `Result`, and an
//! implementation that cannot deliver an event logs and drops it. A task's
//! outcome never depends on its events.

use crate::domain::TaskEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: TaskEvent) {}
}

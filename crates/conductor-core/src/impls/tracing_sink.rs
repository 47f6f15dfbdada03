//! Event sink that writes one structured log line per event.

use tracing::{info, warn};

use super::event_bus::EventSubscriber;
use crate::domain::TaskEvent;
use crate::ports::EventSink;

/// Logs every event under the `conductor.events` target; the full event is
/// attached as JSON in the `payload` field.
///
/// Usable directly as the queue's sink or as an [`EventBus`] subscriber.
///
/// [`EventBus`]: super::EventBus
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: TaskEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        let task_id = event.task_id();
        match &event {
            TaskEvent::Failed { .. } | TaskEvent::TimeoutWarning { .. } => {
                warn!(target: "conductor.events", event = event.name(), %task_id, %payload);
            }
            _ => {
                info!(target: "conductor.events", event = event.name(), %task_id, %payload);
            }
        }
    }
}

impl EventSubscriber for TracingEventSink {
    fn on_event(&self, event: &TaskEvent) {
        self.emit(event.clone());
    }
}

//! In-process event bus.
//!
//! `emit` only does a `try_send` on a bounded channel; a single fan-out task
//! drains it and hands each event to every subscriber in order. A slow
//! subscriber delays other subscribers, never the queue. When the channel
//! is full the event is dropped with a warning.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::domain::TaskEvent;
use crate::ports::EventSink;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Receives events from the bus's fan-out task.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &TaskEvent);
}

impl<F> EventSubscriber for F
where
    F: Fn(&TaskEvent) + Send + Sync,
{
    fn on_event(&self, event: &TaskEvent) {
        self(event)
    }
}

type Subscribers = Arc<RwLock<Vec<Arc<dyn EventSubscriber>>>>;

/// Sending side of the bus. Clones share the channel and subscriber list.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<TaskEvent>,
    subscribers: Subscribers,
}

impl EventBus {
    /// Create a bus and spawn its fan-out task.
    ///
    /// The task ends once every `EventBus` clone has been dropped and the
    /// channel is drained; await the handle to flush.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let handle = tokio::spawn(fan_out(rx, Arc::clone(&subscribers)));
        (Self { tx, subscribers }, handle)
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscriber);
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: TaskEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = event.name(), task_id = %event.task_id(), "event bus full, event dropped");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(event = event.name(), task_id = %event.task_id(), "event bus closed, event dropped");
            }
        }
    }
}

async fn fan_out(mut rx: mpsc::Receiver<TaskEvent>, subscribers: Subscribers) {
    while let Some(event) = rx.recv().await {
        let current = subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for subscriber in current {
            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&event)));
            if delivered.is_err() {
                error!(event = event.name(), task_id = %event.task_id(), "event subscriber panicked");
            }
        }
    }
}

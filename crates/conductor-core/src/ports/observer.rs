//! TaskObserver port - completion hooks registered on the queue.
//!
//! Observers run on the task's runner right after the terminal transition
//! has been applied and persisted. A panicking observer is caught and
//! logged; it affects neither the task nor the other observers.

use crate::domain::Task;

pub trait TaskObserver: Send + Sync {
    fn on_completed(&self, _task: &Task) {}

    fn on_failed(&self, _task: &Task) {}

    fn on_cancelled(&self, _task: &Task) {}
}

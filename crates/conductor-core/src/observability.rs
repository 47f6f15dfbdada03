use serde::{Deserialize, Serialize};

/// Snapshot of the queue, derived from the in-memory task map on demand.
///
/// `pending` includes tasks waiting for a scheduled retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub is_paused: bool,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    /// Nothing left to run.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

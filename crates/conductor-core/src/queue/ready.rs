//! Run queue ordering.
//!
//! - [`ReadyQueue`]: runnable tasks, highest priority first, FIFO within a
//!   priority
//! - [`RetrySchedule`]: tasks waiting for their retry delay, earliest first
//!
//! Both hold task ids only. Entries are never removed eagerly; the caller
//! checks the task record when an entry comes out and skips stale ones
//! (a cancelled task, for example).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::domain::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
    next_seq: u64,
}

impl ReadyQueue {
    pub(crate) fn push(&mut self, task_id: TaskId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ReadyEntry {
            priority,
            seq,
            task_id,
        });
    }

    pub(crate) fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|entry| entry.task_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Scheduled task entry.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    due: Instant,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RetrySchedule {
    heap: BinaryHeap<ScheduledTask>,
}

impl RetrySchedule {
    pub(crate) fn push(&mut self, task_id: TaskId, due: Instant) {
        self.heap.push(ScheduledTask { due, task_id });
    }

    /// Next entry whose time has come.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TaskId> {
        if self.heap.peek()?.due > now {
            return None;
        }
        self.heap.pop().map(|entry| entry.task_id)
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.due)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (TaskId, Instant)> + '_ {
        self.heap.iter().map(|entry| (entry.task_id, entry.due))
    }
}

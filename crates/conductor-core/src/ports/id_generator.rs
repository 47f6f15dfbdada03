//! IdGenerator port.
//!
//! # Implementations
//! - **UlidGenerator**: ULID based, timestamp taken from a [`Clock`]

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// Generates task ids.
///
/// `Send + Sync` so one generator can be shared by every submitter.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID based generator.
///
/// The timestamp part comes from the clock, so a `FixedClock` yields ids
/// with a deterministic prefix.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}

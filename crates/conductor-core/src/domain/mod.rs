//! Domain model: ids, task record, status, retry history, errors, events.

pub mod attempt;
pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;

pub use attempt::{AttemptRecord, RetryMetadata};
pub use errors::{ConductorError, ExecutionError, RepositoryError};
pub use events::TaskEvent;
pub use ids::{ParseTaskIdError, TaskId};
pub use state::TaskStatus;
pub use task::{Task, TaskError, TaskOptions, TaskOutput, TaskRequest};

//! Task model: identity, state machine, submission descriptors, metrics.
//!
//! - `state`: `TaskState` (PENDING → STARTED → SUCCESS/FAILURE, plus TIMEOUT
//!   and REVOKED) and the `TaskRecord` held by result stores
//! - `model`: `SubtaskConfig`, `TaskStatus`, request/response wire types
//! - `metrics`: derived `TaskMetrics` and the Prometheus collector

pub mod metrics;
pub mod model;
pub mod state;

pub use metrics::{MetricsCollector, TaskMetrics};
pub use model::{
    Priority, SubmissionMode, SubtaskConfig, TaskRequest, TaskResponse, TaskStatus, WorkerType,
};
pub use state::{StateTransition, TaskRecord, TaskState};

/// Generate a new globally unique task id.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

//! Queue / result-store boundary.
//!
//! The coordination core only talks to the queue through [`TaskBackend`].
//! [`MemoryBackend`] is the in-process implementation used by the bundled
//! worker pool and by tests.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BackendError;
use crate::task::{Priority, TaskStatus};

pub use memory::MemoryBackend;

/// A single unit of work handed to the queue.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Task id, assigned by the coordinator before enqueue.
    pub id: String,
    /// Capability name.
    pub name: String,
    /// Queue the task is delivered on.
    pub queue: String,
    /// Positional arguments. Chain stages get their predecessor's result
    /// appended here.
    pub args: Vec<serde_json::Value>,
    /// Keyword arguments.
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Delivery order within the queue, higher first.
    pub priority: Priority,
    /// Hard execution limit; the worker default applies when unset.
    pub time_limit: Option<Duration>,
}

impl Envelope {
    pub fn new(id: impl Into<String>, name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            queue: queue.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            priority: Priority::default(),
            time_limit: None,
        }
    }
}

/// Status as the result store reports it, before any timeout reclassification.
#[derive(Debug, Clone)]
pub struct StoredStatus {
    /// Capability name, when the store knows the task.
    pub name: Option<String>,
    pub status: TaskStatus,
}

impl StoredStatus {
    /// What the store reports for an id it has never seen.
    pub fn unknown(task_id: &str) -> Self {
        Self {
            name: None,
            status: TaskStatus::new(task_id, crate::task::TaskState::Pending),
        }
    }
}

/// Outcome of a revoke request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    /// Already terminal, or never seen. Nothing changed.
    NotRevocable,
}

/// External queue and result store.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Enqueue one task, stamping its submission time.
    async fn enqueue(&self, envelope: Envelope) -> Result<DateTime<Utc>, BackendError>;

    /// Enqueue a sequential chain. Only the first stage is queued now; each
    /// later stage is queued when its predecessor succeeds, with the
    /// predecessor's result appended to its positional args. A failed stage
    /// fails every stage after it.
    async fn enqueue_chain(&self, stages: Vec<Envelope>) -> Result<DateTime<Utc>, BackendError>;

    /// Current status. Unknown ids are reported as PENDING with no
    /// submission time.
    async fn fetch(&self, task_id: &str) -> Result<StoredStatus, BackendError>;

    /// Revoke a task. `terminate` also stops a task that already started.
    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<RevokeOutcome, BackendError>;

    /// Record `subtask_ids` as children of `parent_id`.
    async fn attach_subtasks(&self, parent_id: &str, subtask_ids: &[String]) -> Result<(), BackendError>;

    /// Number of tasks waiting on `queue`.
    async fn queue_depth(&self, queue: &str) -> Result<usize, BackendError>;
}

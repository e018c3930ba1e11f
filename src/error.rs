//! Error types for tasklane.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors surfaced by the coordination core to its callers.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The submission named a task that is not registered.
    #[error("Task {name} not found")]
    UnknownCapability { name: String },

    /// The queue was unreachable or refused the enqueue.
    #[error("Submission of {name} failed: {reason}")]
    SubmissionFailed { name: String, reason: String },

    /// A worker reported failure while executing the task.
    #[error("Task {id} failed: {reason}")]
    ExecutionFailure { id: String, reason: String },

    /// The task stayed PENDING past the queue-wait threshold.
    #[error("Task {id} timed out in queue: {reason}")]
    QueueTimeout { id: String, reason: String },

    /// The task was revoked before it completed.
    #[error("Task {id} was revoked: {reason}")]
    Revoked { id: String, reason: String },

    /// The synchronous waiter's own deadline elapsed.
    #[error("Client timeout after {timeout:?} waiting for task {id}")]
    ClientTimeout { id: String, timeout: Duration },

    /// Removing the task's scratch directory failed.
    #[error("Cleanup of task {id} failed: {reason}")]
    CleanupFailure { id: String, reason: String },

    /// The result store could not be read.
    #[error("Status of task {id} unavailable: {reason}")]
    StatusUnavailable { id: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors from the queue / result store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Queue {queue} rejected task {id}: {reason}")]
    Rejected {
        queue: String,
        id: String,
        reason: String,
    },
}

/// Scratch directory errors.
#[derive(Debug, thiserror::Error)]
pub enum ScratchError {
    #[error("Scratch path escapes the task directory: {0}")]
    InvalidPath(String),

    #[error("Scratch file not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notification delivery errors. Never propagated past the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Webhook delivery failed: {0}")]
    Webhook(String),

    #[error("Email delivery failed: {0}")]
    Email(String),
}

/// Errors raised by a capability while executing.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("{name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("{name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Model {0} is not loaded")]
    ModelMissing(String),

    #[error("Scratch error: {0}")]
    Scratch(#[from] ScratchError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

//! Task data model: submission descriptors and wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TaskState;

/// Class of worker a capability runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// Network-bound stages (download, upload).
    Io,
    /// CPU-bound stages (classification, encoding).
    Cpu,
    /// Model inference.
    Gpu,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Io => "io",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        };
        write!(f, "{s}")
    }
}

/// Task priority, 0 (lowest) to 10 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(10);

    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Result<Self, String> {
        if value > Self::MAX {
            return Err(format!("priority must be between 0 and {}, got {value}", Self::MAX));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

/// How a batch of subtasks is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Every subtask is queued independently; one id per subtask.
    Parallel,
    /// Subtasks run as a pipeline; only the terminal id is returned.
    Chain,
}

/// Submission-time descriptor for one subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskConfig {
    pub name: String,
    pub worker_type: WorkerType,
    /// Target queue. Empty means "route by worker type".
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Priority,
    /// Execution time limit in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl SubtaskConfig {
    pub fn new(name: impl Into<String>, worker_type: WorkerType) -> Self {
        Self {
            name: name.into(),
            worker_type,
            queue: String::new(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            priority: Priority::default(),
            timeout: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }
}

/// Externally visible status of a task, as returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subtasks: Vec<String>,
}

impl TaskStatus {
    /// A bare status with no payload.
    pub fn new(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            progress: None,
            result: None,
            error: None,
            submitted_at: None,
            started_at: None,
            completed_at: None,
            subtasks: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Reclassify as TIMEOUT, dropping any result.
    pub(crate) fn into_timeout(mut self, message: impl Into<String>) -> Self {
        self.state = TaskState::Timeout;
        self.result = None;
        self.error = Some(message.into());
        self
    }
}

/// Task submission request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Priority,
    /// Block until the task is terminal before responding.
    #[serde(default)]
    pub sync: bool,
}

/// Task submission response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
}

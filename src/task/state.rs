//! Task state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{Priority, TaskStatus};

/// State of a task as seen across the queue boundary.
///
/// The wire encoding (`"PENDING"`, `"SUCCESS"`, ...) is shared with the
/// external queue's vocabulary and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Queued, not yet picked up.
    Pending,
    /// Delivered to a worker but not yet running.
    Received,
    /// Running on a worker.
    Started,
    /// Finished with a result.
    Success,
    /// Raised an error.
    Failure,
    /// Waited in the queue past the allowed threshold.
    Timeout,
    /// Revoked before completing.
    Revoked,
}

impl TaskState {
    /// Every state, in lifecycle order.
    pub const ALL: [TaskState; 7] = [
        Self::Pending,
        Self::Received,
        Self::Started,
        Self::Success,
        Self::Failure,
        Self::Timeout,
        Self::Revoked,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // From Pending (Failure: an upstream chain stage failed)
            (Pending, Received) | (Pending, Started) |
            (Pending, Timeout) | (Pending, Revoked) | (Pending, Failure) |
            // From Received (Failure: the worker could not run it)
            (Received, Started) | (Received, Revoked) | (Received, Failure) |
            // From Started
            (Started, Success) | (Started, Failure) | (Started, Revoked)
        )
    }

    /// Terminal states are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Timeout | Self::Revoked
        )
    }

    /// Whether an explicit revoke still has an effect.
    pub fn is_revocable(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `error` is populated in this state.
    pub fn carries_error(&self) -> bool {
        matches!(self, Self::Failure | Self::Timeout | Self::Revoked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Received => "RECEIVED",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Revoked => "REVOKED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid task state: {s}"))
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Full record of a task as held by a result store.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Unique, immutable task id.
    pub id: String,
    /// Capability to execute.
    pub name: String,
    /// Queue the task was routed to.
    pub queue: String,
    /// Positional arguments passed to the capability.
    pub args: Vec<serde_json::Value>,
    /// Keyword arguments passed to the capability.
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub priority: Priority,
    /// Current lifecycle state. Terminal states never change again.
    pub state: TaskState,
    /// Present only in SUCCESS.
    pub result: Option<serde_json::Value>,
    /// Present only in FAILURE, TIMEOUT and REVOKED.
    pub error: Option<String>,
    /// Unset for chain stages that are not queued yet.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Set when a worker picks the task up.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on entering a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Subtasks submitted with this task as their parent, in submission order.
    pub subtask_ids: Vec<String>,
    /// Every state change, oldest first.
    pub transitions: Vec<StateTransition>,
}

impl TaskRecord {
    /// Create a PENDING record.
    pub fn new(id: impl Into<String>, name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            queue: queue.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            priority: Priority::default(),
            state: TaskState::Pending,
            result: None,
            error: None,
            submitted_at: None,
            started_at: None,
            completed_at: None,
            subtask_ids: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: TaskState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;

        let now = Utc::now();
        match new_state {
            TaskState::Started if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            s if s.is_terminal() && self.completed_at.is_none() => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        Ok(())
    }

    /// Mark submitted. Only the first call has an effect.
    pub fn mark_submitted(&mut self, at: DateTime<Utc>) {
        if self.submitted_at.is_none() {
            self.submitted_at = Some(at);
        }
    }

    /// STARTED → SUCCESS with a result.
    pub fn succeed(&mut self, result: serde_json::Value) -> Result<(), String> {
        self.transition_to(TaskState::Success, None)?;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Move to FAILURE, TIMEOUT or REVOKED with an error message.
    pub fn fail(&mut self, state: TaskState, error: impl Into<String>) -> Result<(), String> {
        if !state.carries_error() {
            return Err(format!("{state} does not carry an error"));
        }
        let error = error.into();
        self.transition_to(state, Some(error.clone()))?;
        self.result = None;
        self.error = Some(error);
        Ok(())
    }

    /// Queue time, once the task has started.
    pub fn queue_time(&self) -> Option<std::time::Duration> {
        let (submitted, started) = (self.submitted_at?, self.started_at?);
        (started - submitted).to_std().ok()
    }

    /// Execution time, once the task has finished.
    pub fn execution_time(&self) -> Option<std::time::Duration> {
        let (started, completed) = (self.started_at?, self.completed_at?);
        (completed - started).to_std().ok()
    }

    /// Externally visible status of this record.
    pub fn to_status(&self) -> TaskStatus {
        TaskStatus {
            task_id: self.id.clone(),
            state: self.state,
            progress: None,
            result: if self.state == TaskState::Success {
                self.result.clone()
            } else {
                None
            },
            error: if self.state.carries_error() {
                self.error.clone()
            } else {
                None
            },
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            subtasks: self.subtask_ids.clone(),
        }
    }
}

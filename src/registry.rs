//! Capability registry: static map of task names to typed handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CapabilityError, TaskError};
use crate::task::WorkerType;

/// Arguments handed to a capability when a worker executes it.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Id of the task being executed.
    pub task_id: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl Invocation {
    pub fn new(task_id: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            task_id: task_id.into(),
            args,
            kwargs: serde_json::Map::new(),
        }
    }

    /// String argument at `index`, falling back to the `key` kwarg.
    pub fn str_arg(&self, capability: &str, index: usize, key: &str) -> Result<&str, CapabilityError> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.get(key))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CapabilityError::InvalidArguments {
                name: capability.to_string(),
                reason: format!("missing string argument `{key}` (position {index})"),
            })
    }
}

/// Bounded retry policy a worker applies to transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// A named unit of executable work.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Name submissions refer to.
    fn name(&self) -> &str;

    /// Worker class this capability runs on.
    fn worker_type(&self) -> WorkerType;

    /// Explicit queue, overriding the worker-type route.
    fn queue(&self) -> Option<&str> {
        None
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError>;
}

/// Registry of available capabilities. Populated at process start, then
/// shared read-only.
#[derive(Default)]
pub struct TaskRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. A later registration under the same name
    /// replaces the earlier one.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        if self.capabilities.insert(name.clone(), capability).is_some() {
            tracing::warn!(capability = %name, "Replaced existing capability registration");
        } else {
            tracing::debug!(capability = %name, "Registered capability");
        }
    }

    /// Resolve a capability, or fail with `UnknownCapability`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Capability>, TaskError> {
        self.get(name).ok_or_else(|| TaskError::UnknownCapability {
            name: name.to_string(),
        })
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Check if a capability exists.
    pub fn has(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// List all capability names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.capabilities.len()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("capabilities", &self.list())
            .finish()
    }
}

//! Public façade over submission, status, waiting and cleanup.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::TaskBackend;
use crate::config::Settings;
use crate::coordinator::{Submitted, TaskCoordinator};
use crate::error::TaskError;
use crate::notify::NotificationDispatcher;
use crate::registry::TaskRegistry;
use crate::routing::QueueRouter;
use crate::scratch::ScratchStore;
use crate::task::{
    MetricsCollector, Priority, SubmissionMode, SubtaskConfig, TaskState, TaskStatus,
};
use crate::tracker::{CLIENT_TIMEOUT, TaskStatusTracker};

/// Entry point used by the HTTP surface and pipeline drivers.
pub struct TaskLifecycleManager {
    coordinator: TaskCoordinator,
    tracker: TaskStatusTracker,
    backend: Arc<dyn TaskBackend>,
    scratch: ScratchStore,
    metrics: Arc<MetricsCollector>,
    default_timeout: Duration,
    poll_interval: Duration,
}

impl TaskLifecycleManager {
    pub fn new(
        settings: &Settings,
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn TaskBackend>,
        notifier: NotificationDispatcher,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let router = Arc::new(QueueRouter::new(&settings.queues));
        Self {
            coordinator: TaskCoordinator::new(registry, router, backend.clone(), metrics.clone()),
            tracker: TaskStatusTracker::new(
                backend.clone(),
                notifier,
                metrics.clone(),
                settings.task_queue_timeout,
            ),
            backend,
            scratch: ScratchStore::new(settings.scratch_root.clone()),
            metrics,
            default_timeout: settings.task_default_timeout,
            poll_interval: settings.poll_interval,
        }
    }

    pub fn scratch(&self) -> &ScratchStore {
        &self.scratch
    }

    pub fn router(&self) -> &QueueRouter {
        self.coordinator.router()
    }

    /// Prometheus text for every metric, with `queue_depth` sampled from the
    /// backend for each routed queue first.
    pub async fn render_metrics(&self) -> String {
        for queue in self.router().queues() {
            match self.backend.queue_depth(&queue).await {
                Ok(depth) => self.metrics.queue_depth(&queue, depth),
                Err(e) => warn!(queue = %queue, error = %e, "Failed to sample queue depth"),
            }
        }
        self.metrics.render()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn submit(
        &self,
        task_name: &str,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
        priority: Priority,
    ) -> Result<Submitted, TaskError> {
        self.coordinator.submit(task_name, args, kwargs, priority).await
    }

    pub async fn submit_subtasks(
        &self,
        parent_id: &str,
        configs: &[SubtaskConfig],
        mode: SubmissionMode,
    ) -> Result<Vec<String>, TaskError> {
        self.coordinator.submit_subtasks(parent_id, configs, mode).await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus, TaskError> {
        self.tracker.get_status(task_id).await
    }

    /// Wait for a terminal state. `None` waits indefinitely.
    pub async fn wait(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
        poll_interval: Option<Duration>,
    ) -> Result<TaskStatus, TaskError> {
        self.tracker
            .wait(task_id, timeout, poll_interval.unwrap_or(self.poll_interval))
            .await
    }

    /// Wait for a task and unwrap its result, mapping every other terminal
    /// state to the matching error.
    pub async fn wait_for_result(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, TaskError> {
        let status = self.wait(task_id, Some(timeout), None).await?;
        let id = task_id.to_string();
        let reason = status.error.clone().unwrap_or_default();
        match status.state {
            TaskState::Success => Ok(status.result.unwrap_or(serde_json::Value::Null)),
            TaskState::Failure => Err(TaskError::ExecutionFailure { id, reason }),
            TaskState::Timeout if reason == CLIENT_TIMEOUT => {
                Err(TaskError::ClientTimeout { id, timeout })
            }
            TaskState::Timeout => Err(TaskError::QueueTimeout { id, reason }),
            TaskState::Revoked => Err(TaskError::Revoked { id, reason }),
            state => Err(TaskError::ExecutionFailure {
                id,
                reason: format!("wait returned non-terminal state {state}"),
            }),
        }
    }

    /// Remove the task's scratch directory. Failures are logged, never
    /// returned.
    pub async fn cleanup(&self, task_id: &str) {
        if let Err(e) = self.try_cleanup(task_id).await {
            warn!(task_id = %task_id, error = %e, "Scratch cleanup failed");
        }
    }

    /// Remove the task's scratch directory, reporting failure.
    pub async fn try_cleanup(&self, task_id: &str) -> Result<(), TaskError> {
        self.scratch
            .purge(task_id)
            .await
            .map_err(|e| TaskError::CleanupFailure {
                id: task_id.to_string(),
                reason: e.to_string(),
            })?;
        info!(task_id = %task_id, "Cleaned up task scratch directory");
        Ok(())
    }
}

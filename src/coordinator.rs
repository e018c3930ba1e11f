//! Task submission: validation, routing and enqueue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::backend::{Envelope, TaskBackend};
use crate::error::{BackendError, TaskError};
use crate::registry::{Capability, TaskRegistry};
use crate::routing::QueueRouter;
use crate::task::{
    MetricsCollector, Priority, SubmissionMode, SubtaskConfig, WorkerType, new_task_id,
};

/// A task the queue accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub task_id: String,
    /// Submission stamp recorded by the backend.
    pub submitted_at: DateTime<Utc>,
}

/// Validates and routes submissions onto the queue backend.
pub struct TaskCoordinator {
    registry: Arc<TaskRegistry>,
    router: Arc<QueueRouter>,
    backend: Arc<dyn TaskBackend>,
    metrics: Arc<MetricsCollector>,
}

impl TaskCoordinator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        router: Arc<QueueRouter>,
        backend: Arc<dyn TaskBackend>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            router,
            backend,
            metrics,
        }
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    /// Submit a single task and return its id with the stored submission
    /// stamp.
    ///
    /// Unknown names fail with `UnknownCapability` before anything is
    /// enqueued.
    pub async fn submit(
        &self,
        task_name: &str,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
        priority: Priority,
    ) -> Result<Submitted, TaskError> {
        let capability = self.registry.resolve(task_name)?;
        let queue = self.route(capability.as_ref(), None, capability.worker_type());

        let mut envelope = Envelope::new(new_task_id(), task_name, queue);
        envelope.args = args;
        envelope.kwargs = kwargs;
        envelope.priority = priority;
        let task_id = envelope.id.clone();
        let queue = envelope.queue.clone();

        let submitted_at = self
            .backend
            .enqueue(envelope)
            .await
            .map_err(|e| submission_failed(task_name, e))?;
        self.metrics.task_submitted(task_name);

        info!(task_id = %task_id, task_name = %task_name, queue = %queue, "Task submitted");
        Ok(Submitted {
            task_id,
            submitted_at,
        })
    }

    /// Submit several subtasks under a parent.
    ///
    /// `Parallel` enqueues every config independently and returns one id per
    /// config, in order. `Chain` enqueues them as a sequential pipeline and
    /// returns only the id of the final stage.
    pub async fn submit_subtasks(
        &self,
        parent_id: &str,
        configs: &[SubtaskConfig],
        mode: SubmissionMode,
    ) -> Result<Vec<String>, TaskError> {
        if configs.is_empty() {
            return Err(TaskError::InvalidRequest(
                "at least one subtask is required".into(),
            ));
        }

        let envelopes = configs
            .iter()
            .map(|config| self.envelope_for(config))
            .collect::<Result<Vec<_>, _>>()?;

        let ids = match mode {
            SubmissionMode::Parallel => self.enqueue_parallel(envelopes).await?,
            SubmissionMode::Chain => self.enqueue_chain(envelopes).await?,
        };

        if let Err(e) = self.backend.attach_subtasks(parent_id, &ids).await {
            self.rollback(&ids).await;
            return Err(submission_failed(&configs[0].name, e));
        }
        for config in configs {
            self.metrics.task_submitted(&config.name);
        }

        info!(
            parent_id = %parent_id,
            mode = ?mode,
            count = configs.len(),
            "Subtasks submitted"
        );
        Ok(ids)
    }

    async fn enqueue_parallel(&self, envelopes: Vec<Envelope>) -> Result<Vec<String>, TaskError> {
        let mut ids = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let id = envelope.id.clone();
            let name = envelope.name.clone();
            if let Err(e) = self.backend.enqueue(envelope).await {
                self.rollback(&ids).await;
                return Err(submission_failed(&name, e));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    async fn enqueue_chain(&self, envelopes: Vec<Envelope>) -> Result<Vec<String>, TaskError> {
        let first_name = envelopes[0].name.clone();
        let terminal_id = envelopes[envelopes.len() - 1].id.clone();
        self.backend
            .enqueue_chain(envelopes)
            .await
            .map_err(|e| submission_failed(&first_name, e))?;
        Ok(vec![terminal_id])
    }

    /// Best-effort revoke of tasks enqueued by a submission that failed.
    async fn rollback(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.backend.revoke(id, true).await {
                warn!(task_id = %id, error = %e, "Failed to revoke sibling after submission failure");
            }
        }
    }

    fn envelope_for(&self, config: &SubtaskConfig) -> Result<Envelope, TaskError> {
        let capability = self.registry.resolve(&config.name)?;
        let explicit = (!config.queue.is_empty()).then_some(config.queue.as_str());
        let queue = self.route(capability.as_ref(), explicit, config.worker_type);

        let mut envelope = Envelope::new(new_task_id(), &config.name, queue);
        envelope.args = config.args.clone();
        envelope.kwargs = config.kwargs.clone();
        envelope.priority = config.priority;
        envelope.time_limit = config.timeout.map(Duration::from_secs);
        Ok(envelope)
    }

    /// Explicit queue, else the capability's own queue, else the route for
    /// the worker type.
    fn route(
        &self,
        capability: &dyn Capability,
        explicit: Option<&str>,
        worker_type: WorkerType,
    ) -> String {
        explicit
            .or_else(|| capability.queue())
            .unwrap_or_else(|| self.router.queue_for(worker_type))
            .to_string()
    }
}

fn submission_failed(name: &str, error: BackendError) -> TaskError {
    TaskError::SubmissionFailed {
        name: name.to_string(),
        reason: error.to_string(),
    }
}

//! In-process worker pool draining the memory backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Envelope, MemoryBackend};
use crate::config::Settings;
use crate::error::CapabilityError;
use crate::notify::NotificationDispatcher;
use crate::registry::{Invocation, TaskRegistry};
use crate::task::{MetricsCollector, TaskMetrics};

/// Number of consumers to run on one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAssignment {
    pub queue: String,
    pub consumers: usize,
}

impl QueueAssignment {
    pub fn new(queue: impl Into<String>, consumers: usize) -> Self {
        Self {
            queue: queue.into(),
            consumers,
        }
    }

    /// One assignment per configured queue, sized by worker class.
    pub fn from_settings(settings: &Settings) -> Vec<Self> {
        let queues = &settings.queues;
        let concurrency = &settings.concurrency;
        vec![
            Self::new(&queues.main, concurrency.cpu),
            Self::new(&queues.io, concurrency.io),
            Self::new(&queues.cpu, concurrency.cpu),
            Self::new(&queues.gpu_general, concurrency.gpu),
            Self::new(&queues.gpu_portrait, concurrency.gpu),
            Self::new(&queues.gpu_landscape, concurrency.gpu),
        ]
    }
}

/// Shared dependencies for task execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub backend: Arc<MemoryBackend>,
    pub registry: Arc<TaskRegistry>,
    pub notifier: NotificationDispatcher,
    pub metrics: Arc<MetricsCollector>,
    /// Execution limit for tasks that carry none.
    pub default_time_limit: Duration,
}

/// Consumers running against the memory backend. Dropping the pool stops
/// them.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(deps: WorkerDeps, assignments: &[QueueAssignment]) -> Self {
        let mut handles = Vec::new();
        for assignment in assignments {
            for index in 0..assignment.consumers {
                let deps = deps.clone();
                let queue = assignment.queue.clone();
                handles.push(tokio::spawn(async move {
                    consume(deps, queue, index).await;
                }));
            }
            info!(
                queue = %assignment.queue,
                consumers = assignment.consumers,
                "Queue consumers started"
            );
        }
        Self { handles }
    }

    pub fn consumer_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop every consumer. Tasks mid-execution are abandoned.
    pub fn shutdown(self) {
        info!(consumers = self.handles.len(), "Stopping worker pool");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn consume(deps: WorkerDeps, queue: String, index: usize) {
    loop {
        let envelope = deps.backend.next(&queue).await;
        debug!(queue = %queue, consumer = index, task_id = %envelope.id, "Task claimed");
        execute(&deps, envelope).await;
    }
}

/// Run one claimed task to a terminal state.
pub async fn execute(deps: &WorkerDeps, envelope: Envelope) {
    let task_id = envelope.id.clone();

    let Some(capability) = deps.registry.get(&envelope.name) else {
        let reason = format!("Task {} not found", envelope.name);
        error!(task_id = %task_id, "{reason}");
        if deps.backend.complete_failure(&task_id, &reason).await.is_some() {
            deps.notifier.notify_failure(&task_id, &reason).await;
        }
        return;
    };

    if !deps.backend.mark_started(&task_id).await {
        debug!(task_id = %task_id, "Skipping task revoked before start");
        return;
    }

    let limit = envelope.time_limit.unwrap_or(deps.default_time_limit);
    let policy = capability.retry_policy();
    let worker_type = capability.worker_type();
    deps.metrics.worker_busy(worker_type);
    let invocation = Invocation {
        task_id: task_id.clone(),
        args: envelope.args,
        kwargs: envelope.kwargs,
    };

    let mut attempt = 0;
    let outcome = loop {
        let result = match tokio::time::timeout(limit, capability.execute(invocation.clone())).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                name: envelope.name.clone(),
                timeout: limit,
            }),
        };
        match result {
            Ok(value) => break Ok(value),
            Err(e) if attempt < policy.max_retries && !is_abandoned(deps, &task_id).await => {
                attempt += 1;
                warn!(
                    task_id = %task_id,
                    task_name = %envelope.name,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "Task failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => break Err(e),
        }
    };

    let record = match outcome {
        Ok(value) => deps.backend.complete_success(&task_id, value).await,
        Err(e) => {
            let reason = e.to_string();
            let record = deps.backend.complete_failure(&task_id, &reason).await;
            if record.is_some() {
                deps.notifier.notify_failure(&task_id, &reason).await;
            }
            record
        }
    };

    deps.metrics.worker_idle(worker_type);
    if let Some(metrics) = record
        .as_ref()
        .and_then(|r| TaskMetrics::from_record(r, Some(worker_type)))
    {
        deps.metrics.task_completed(&metrics);
    }
}

/// Whether the task was revoked while running.
async fn is_abandoned(deps: &WorkerDeps, task_id: &str) -> bool {
    deps.backend
        .record(task_id)
        .await
        .is_none_or(|record| record.state.is_terminal())
}

//! Task metrics: observability only, never read back by coordination.
//!
//! Every collector owns a Prometheus recorder and records through the
//! `metrics` macros against it, so `/metrics` renders exposition text:
//! - `tasks_submitted_total{task_name}`
//! - `tasks_completed_total{task_name, status}`
//! - `tasks_timeout_total{task_name}`
//! - `task_duration_seconds{task_name, worker_type}`
//! - `task_queue_time_seconds{queue_name}`
//! - `queue_depth{queue_name}`
//! - `active_workers{worker_type}`

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use serde::Serialize;

use super::model::WorkerType;
use super::state::TaskRecord;

/// Metric names.
pub mod names {
    pub const TASKS_SUBMITTED: &str = "tasks_submitted_total";
    pub const TASKS_COMPLETED: &str = "tasks_completed_total";
    pub const TASKS_TIMEOUT: &str = "tasks_timeout_total";
    pub const TASK_DURATION: &str = "task_duration_seconds";
    pub const TASK_QUEUE_TIME: &str = "task_queue_time_seconds";
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const ACTIVE_WORKERS: &str = "active_workers";
}

/// Derived timing for one finished task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub task_id: String,
    pub task_name: String,
    /// Queue the task was consumed from.
    pub queue: String,
    pub worker_type: Option<WorkerType>,
    /// Seconds spent in the queue.
    pub queue_time: f64,
    /// Seconds spent executing.
    pub execution_time: f64,
    /// End-to-end seconds.
    pub total_time: f64,
    pub success: bool,
    pub timeout: bool,
}

impl TaskMetrics {
    /// Derive metrics from a terminal record. Returns `None` while the task
    /// is still in flight.
    pub fn from_record(record: &TaskRecord, worker_type: Option<WorkerType>) -> Option<Self> {
        if !record.state.is_terminal() {
            return None;
        }
        let secs = |d: Option<std::time::Duration>| d.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let queue_time = secs(record.queue_time());
        let execution_time = secs(record.execution_time());
        let total_time = match (record.submitted_at, record.completed_at) {
            (Some(s), Some(c)) => secs((c - s).to_std().ok()),
            _ => queue_time + execution_time,
        };

        Some(Self {
            task_id: record.id.clone(),
            task_name: record.name.clone(),
            queue: record.queue.clone(),
            worker_type,
            queue_time,
            execution_time,
            total_time,
            success: record.state == super::TaskState::Success,
            timeout: record.state == super::TaskState::Timeout,
        })
    }
}

/// Prometheus-backed metrics collector. A disabled collector records
/// nothing and renders an empty page.
pub struct MetricsCollector {
    recorder: Option<PrometheusRecorder>,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> Self {
        let recorder = enabled.then(|| PrometheusBuilder::new().build_recorder());
        let collector = Self { recorder };
        collector.record(|| {
            describe_counter!(names::TASKS_SUBMITTED, "Total number of tasks submitted");
            describe_counter!(names::TASKS_COMPLETED, "Total number of tasks completed");
            describe_counter!(names::TASKS_TIMEOUT, "Total number of tasks that timed out");
            describe_histogram!(names::TASK_DURATION, "Task execution duration in seconds");
            describe_histogram!(names::TASK_QUEUE_TIME, "Time spent in queue before execution");
            describe_gauge!(names::QUEUE_DEPTH, "Number of tasks in queue");
            describe_gauge!(names::ACTIVE_WORKERS, "Number of active workers");
        });
        collector
    }

    pub fn task_submitted(&self, task_name: &str) {
        self.record(|| {
            counter!(names::TASKS_SUBMITTED, "task_name" => task_name.to_string()).increment(1);
        });
    }

    pub fn task_timeout(&self, task_name: &str) {
        self.record(|| {
            counter!(names::TASKS_TIMEOUT, "task_name" => task_name.to_string()).increment(1);
        });
    }

    /// Record a finished task.
    pub fn task_completed(&self, metrics: &TaskMetrics) {
        tracing::debug!(
            task_id = %metrics.task_id,
            task_name = %metrics.task_name,
            queue_time = metrics.queue_time,
            execution_time = metrics.execution_time,
            success = metrics.success,
            "Task metrics recorded"
        );
        let status = if metrics.success { "success" } else { "failure" };
        let worker_type = metrics
            .worker_type
            .map_or_else(|| "unknown".to_string(), |w| w.to_string());
        self.record(|| {
            counter!(
                names::TASKS_COMPLETED,
                "task_name" => metrics.task_name.clone(),
                "status" => status
            )
            .increment(1);
            histogram!(
                names::TASK_DURATION,
                "task_name" => metrics.task_name.clone(),
                "worker_type" => worker_type
            )
            .record(metrics.execution_time);
            histogram!(names::TASK_QUEUE_TIME, "queue_name" => metrics.queue.clone())
                .record(metrics.queue_time);
        });
    }

    pub fn queue_depth(&self, queue: &str, depth: usize) {
        self.record(|| {
            gauge!(names::QUEUE_DEPTH, "queue_name" => queue.to_string()).set(depth as f64);
        });
    }

    pub fn worker_busy(&self, worker_type: WorkerType) {
        self.record(|| {
            gauge!(names::ACTIVE_WORKERS, "worker_type" => worker_type.to_string()).increment(1.0);
        });
    }

    pub fn worker_idle(&self, worker_type: WorkerType) {
        self.record(|| {
            gauge!(names::ACTIVE_WORKERS, "worker_type" => worker_type.to_string()).decrement(1.0);
        });
    }

    /// Prometheus exposition text of everything recorded so far.
    pub fn render(&self) -> String {
        self.recorder
            .as_ref()
            .map(|recorder| recorder.handle().render())
            .unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce()) {
        if let Some(recorder) = &self.recorder {
            metrics::with_local_recorder(recorder, f);
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Value of the first series of `name` carrying every label in `labels`
/// (each written as `key="value"`).
#[cfg(test)]
pub(crate) fn sample(rendered: &str, name: &str, labels: &[&str]) -> Option<f64> {
    rendered
        .lines()
        .filter(|line| {
            line.strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('{') || rest.starts_with(' '))
        })
        .find(|line| labels.iter().all(|label| line.contains(label)))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

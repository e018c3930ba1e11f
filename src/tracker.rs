//! Status reads with queue-timeout detection, and synchronous waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{RevokeOutcome, TaskBackend};
use crate::error::TaskError;
use crate::notify::NotificationDispatcher;
use crate::task::{MetricsCollector, TaskState, TaskStatus};

/// Error text of a status forced to TIMEOUT by the waiter's own deadline.
pub const CLIENT_TIMEOUT: &str = "client timeout";

/// How long a queue-timeout verdict is remembered.
const VERDICT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Verdict {
    message: String,
    at: Instant,
}

type Ledger = Arc<Mutex<HashMap<String, Verdict>>>;

/// Reads task status and reclassifies tasks stuck in the queue as TIMEOUT.
///
/// The first caller to observe a stale PENDING task claims it. The revoke,
/// the timeout metric and the notification run on a spawned task, so they
/// complete even if that caller goes away. The caller waits for the revoke
/// only. A revoke that finds the task already past PENDING means the read
/// was stale: the claim is released and the real state is returned.
pub struct TaskStatusTracker {
    backend: Arc<dyn TaskBackend>,
    notifier: NotificationDispatcher,
    metrics: Arc<MetricsCollector>,
    queue_timeout: Duration,
    timed_out: Ledger,
}

impl TaskStatusTracker {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        notifier: NotificationDispatcher,
        metrics: Arc<MetricsCollector>,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            notifier,
            metrics,
            queue_timeout,
            timed_out: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current status of a task.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus, TaskError> {
        let stored = self.fetch(task_id).await?;
        let status = stored.status;

        if let Some(message) = verdict(&self.timed_out, task_id) {
            return Ok(status.into_timeout(message));
        }

        if status.state != TaskState::Pending {
            return Ok(status);
        }
        let Some(submitted_at) = status.submitted_at else {
            return Ok(status);
        };
        let waited = (Utc::now() - submitted_at).to_std().unwrap_or_default();
        if waited <= self.queue_timeout {
            return Ok(status);
        }

        let message = format!("Task timeout after {:.1}s in queue", waited.as_secs_f64());
        if !claim(&self.timed_out, task_id, &message) {
            // Another caller is handling it.
            let message = verdict(&self.timed_out, task_id).unwrap_or(message);
            return Ok(status.into_timeout(message));
        }

        let (revoked_tx, revoked_rx) = oneshot::channel();
        tokio::spawn(settle_timeout(
            TimeoutSettlement {
                backend: self.backend.clone(),
                notifier: self.notifier.clone(),
                metrics: self.metrics.clone(),
                ledger: self.timed_out.clone(),
                task_id: task_id.to_string(),
                task_name: stored.name.unwrap_or_else(|| "unknown".to_string()),
                waited,
            },
            revoked_tx,
        ));

        // A dropped sender means the settlement panicked; keep the verdict.
        if let Ok(false) = revoked_rx.await {
            return Ok(self.fetch(task_id).await?.status);
        }
        Ok(status.into_timeout(message))
    }

    /// Poll until the task is terminal or `timeout` elapses.
    ///
    /// On deadline the last observed status is returned with state TIMEOUT
    /// and error [`CLIENT_TIMEOUT`]. The task itself is left alone.
    pub async fn wait(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<TaskStatus, TaskError> {
        let started = Instant::now();
        loop {
            let status = self.get_status(task_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }

            let mut pause = poll_interval;
            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    debug!(task_id = %task_id, ?timeout, "Client wait deadline reached");
                    return Ok(status.into_timeout(CLIENT_TIMEOUT.to_string()));
                }
                pause = pause.min(timeout - elapsed);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Drop the remembered verdict for a task.
    pub fn forget(&self, task_id: &str) {
        ledger(&self.timed_out).remove(task_id);
    }

    async fn fetch(&self, task_id: &str) -> Result<crate::backend::StoredStatus, TaskError> {
        self.backend
            .fetch(task_id)
            .await
            .map_err(|e| TaskError::StatusUnavailable {
                id: task_id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Everything the spawned half of a timeout needs.
struct TimeoutSettlement {
    backend: Arc<dyn TaskBackend>,
    notifier: NotificationDispatcher,
    metrics: Arc<MetricsCollector>,
    ledger: Ledger,
    task_id: String,
    task_name: String,
    waited: Duration,
}

/// Revoke a claimed task, report whether the TIMEOUT verdict stands, then
/// record and announce it.
async fn settle_timeout(settlement: TimeoutSettlement, revoked: oneshot::Sender<bool>) {
    let TimeoutSettlement {
        backend,
        notifier,
        metrics,
        ledger: timed_out,
        task_id,
        task_name,
        waited,
    } = settlement;

    let stands = match backend.revoke(&task_id, true).await {
        Ok(RevokeOutcome::Revoked) => true,
        Ok(RevokeOutcome::NotRevocable) => false,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to revoke timed-out task");
            true
        }
    };
    if !stands {
        debug!(task_id = %task_id, "Stale PENDING read, task already left the queue");
        ledger(&timed_out).remove(&task_id);
    }
    // The caller may have gone away; the settlement finishes regardless.
    let _ = revoked.send(stands);
    if !stands {
        return;
    }

    metrics.task_timeout(&task_name);
    notifier.notify_timeout(&task_id, waited).await;
}

fn ledger(timed_out: &Ledger) -> MutexGuard<'_, HashMap<String, Verdict>> {
    timed_out.lock().unwrap_or_else(PoisonError::into_inner)
}

fn verdict(timed_out: &Ledger, task_id: &str) -> Option<String> {
    ledger(timed_out).get(task_id).map(|v| v.message.clone())
}

/// One-shot claim on the timeout transition of `task_id`.
fn claim(timed_out: &Ledger, task_id: &str, message: &str) -> bool {
    let mut ledger = ledger(timed_out);
    ledger.retain(|_, verdict| verdict.at.elapsed() < VERDICT_TTL);
    if ledger.contains_key(task_id) {
        return false;
    }
    ledger.insert(
        task_id.to_string(),
        Verdict {
            message: message.to_string(),
            at: Instant::now(),
        },
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Envelope, MemoryBackend, StoredStatus};
    use crate::error::{BackendError, NotifyError};
    use crate::notify::{Alert, NotificationSink};
    use crate::task::metrics::{names, sample};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        alerts: Mutex<Vec<Alert>>,
        delay: Duration,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
            tokio::time::sleep(self.delay).await;
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    impl CountingSink {
        /// Alerts delivered once `expected` have arrived (or 2s passed),
        /// plus a grace period for duplicates.
        async fn delivered(&self, expected: usize) -> usize {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while self.alerts.lock().unwrap().len() < expected
                && std::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.alerts.lock().unwrap().len()
        }
    }

    /// Replays a fixed sequence of states, then repeats the last one.
    struct ScriptedBackend {
        states: Vec<TaskState>,
        calls: AtomicUsize,
        submitted_at: DateTime<Utc>,
        revoke: RevokeOutcome,
    }

    impl ScriptedBackend {
        fn new(states: Vec<TaskState>, submitted_at: DateTime<Utc>) -> Self {
            Self {
                states,
                calls: AtomicUsize::new(0),
                submitted_at,
                revoke: RevokeOutcome::Revoked,
            }
        }
    }

    #[async_trait]
    impl TaskBackend for ScriptedBackend {
        async fn enqueue(&self, _envelope: Envelope) -> Result<DateTime<Utc>, BackendError> {
            Ok(self.submitted_at)
        }
        async fn enqueue_chain(&self, _stages: Vec<Envelope>) -> Result<DateTime<Utc>, BackendError> {
            Ok(self.submitted_at)
        }
        async fn fetch(&self, task_id: &str) -> Result<StoredStatus, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let state = self.states[call.min(self.states.len() - 1)];
            let mut status = TaskStatus::new(task_id, state);
            status.submitted_at = Some(self.submitted_at);
            if state == TaskState::Success {
                status.result = Some(serde_json::json!({"ok": true}));
            }
            Ok(StoredStatus {
                name: Some("classify_image".into()),
                status,
            })
        }
        async fn revoke(&self, _task_id: &str, _terminate: bool) -> Result<RevokeOutcome, BackendError> {
            Ok(self.revoke)
        }
        async fn attach_subtasks(&self, _parent_id: &str, _ids: &[String]) -> Result<(), BackendError> {
            Ok(())
        }
        async fn queue_depth(&self, _queue: &str) -> Result<usize, BackendError> {
            Ok(0)
        }
    }

    struct Fixture {
        sink: Arc<CountingSink>,
        metrics: Arc<MetricsCollector>,
        tracker: TaskStatusTracker,
    }

    fn fixture(backend: Arc<dyn TaskBackend>, sink: CountingSink) -> Fixture {
        let sink = Arc::new(sink);
        let metrics = Arc::new(MetricsCollector::new(true));
        let tracker = TaskStatusTracker::new(
            backend,
            NotificationDispatcher::new(vec![sink.clone() as Arc<dyn NotificationSink>]),
            metrics.clone(),
            Duration::from_secs(30),
        );
        Fixture {
            sink,
            metrics,
            tracker,
        }
    }

    fn tracker_with(backend: Arc<dyn TaskBackend>) -> (Arc<CountingSink>, TaskStatusTracker) {
        let Fixture { sink, tracker, .. } = fixture(backend, CountingSink::default());
        (sink, tracker)
    }

    async fn stale_task(backend: &MemoryBackend, age_secs: i64) -> String {
        backend
            .enqueue(Envelope::new("stale", "classify_image", "cpu"))
            .await
            .unwrap();
        backend
            .backdate("stale", Utc::now() - chrono::Duration::seconds(age_secs))
            .await;
        "stale".to_string()
    }

    #[tokio::test]
    async fn fresh_pending_is_reported_as_is() {
        let backend = MemoryBackend::new();
        let id = stale_task(&backend, 5).await;
        let (sink, tracker) = tracker_with(backend);

        let status = tracker.get_status(&id).await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(sink.delivered(0).await, 0);
    }

    #[tokio::test]
    async fn stale_pending_times_out_and_is_revoked() {
        let backend = MemoryBackend::new();
        let id = stale_task(&backend, 31).await;
        let Fixture {
            sink,
            metrics,
            tracker,
        } = fixture(backend.clone(), CountingSink::default());

        let status = tracker.get_status(&id).await.unwrap();
        assert_eq!(status.state, TaskState::Timeout);
        let error = status.error.unwrap();
        assert!(error.starts_with("Task timeout after 31."), "{error}");
        assert!(error.ends_with("s in queue"));

        assert_eq!(backend.record(&id).await.unwrap().state, TaskState::Revoked);
        assert_eq!(sink.delivered(1).await, 1);
        assert_eq!(
            sample(&metrics.render(), names::TASKS_TIMEOUT, &[r#"task_name="classify_image""#]),
            Some(1.0)
        );

        // Later reads keep reporting TIMEOUT without a second alert.
        let again = tracker.get_status(&id).await.unwrap();
        assert_eq!(again.state, TaskState::Timeout);
        assert_eq!(sink.delivered(1).await, 1);
    }

    #[tokio::test]
    async fn concurrent_reads_notify_once() {
        let backend = MemoryBackend::new();
        let id = stale_task(&backend, 45).await;
        let (sink, tracker) = tracker_with(backend);
        let tracker = Arc::new(tracker);

        let reads = (0..5).map(|_| {
            let tracker = tracker.clone();
            let id = id.clone();
            async move { tracker.get_status(&id).await.unwrap() }
        });
        let statuses = futures::future::join_all(reads).await;

        assert!(statuses.iter().all(|s| s.state == TaskState::Timeout));
        assert_eq!(sink.delivered(1).await, 1);
    }

    #[tokio::test]
    async fn slow_notification_does_not_delay_status() {
        let backend = MemoryBackend::new();
        let id = stale_task(&backend, 40).await;
        let Fixture { sink, tracker, .. } = fixture(
            backend,
            CountingSink {
                delay: Duration::from_millis(500),
                ..CountingSink::default()
            },
        );

        let started = std::time::Instant::now();
        let status = tracker.get_status(&id).await.unwrap();
        assert_eq!(status.state, TaskState::Timeout);
        assert!(started.elapsed() < Duration::from_millis(300), "{:?}", started.elapsed());
        assert_eq!(sink.delivered(1).await, 1);
    }

    #[tokio::test]
    async fn abandoned_first_read_still_notifies_once() {
        let backend = MemoryBackend::new();
        let id = stale_task(&backend, 40).await;
        let Fixture { sink, tracker, .. } = fixture(
            backend.clone(),
            CountingSink {
                delay: Duration::from_millis(200),
                ..CountingSink::default()
            },
        );
        let tracker = Arc::new(tracker);

        // The first reader gives up right after claiming the timeout.
        let _ = tokio::time::timeout(Duration::ZERO, tracker.get_status(&id)).await;

        let reads = (0..5).map(|_| {
            let tracker = tracker.clone();
            let id = id.clone();
            async move { tracker.get_status(&id).await.unwrap() }
        });
        let statuses = futures::future::join_all(reads).await;
        assert!(statuses.iter().all(|s| s.state == TaskState::Timeout));

        assert_eq!(sink.delivered(1).await, 1);
        assert_eq!(backend.record(&id).await.unwrap().state, TaskState::Revoked);
    }

    #[tokio::test]
    async fn stale_read_of_finished_task_reports_real_state() {
        // The first read sees PENDING 40s old, but the task has already run.
        let mut scripted = ScriptedBackend::new(
            vec![TaskState::Pending, TaskState::Success],
            Utc::now() - chrono::Duration::seconds(40),
        );
        scripted.revoke = RevokeOutcome::NotRevocable;
        let Fixture {
            sink,
            metrics,
            tracker,
        } = fixture(Arc::new(scripted), CountingSink::default());

        let first = tracker.get_status("t1").await.unwrap();
        assert_eq!(first.state, TaskState::Success);
        assert_eq!(first.result, Some(serde_json::json!({"ok": true})));

        let later = tracker.get_status("t1").await.unwrap();
        assert_eq!(later.state, TaskState::Success);
        assert!(later.error.is_none());

        assert_eq!(sink.delivered(0).await, 0);
        assert_eq!(sample(&metrics.render(), names::TASKS_TIMEOUT, &[]), None);
    }

    #[tokio::test]
    async fn forget_exposes_stored_state() {
        let backend = MemoryBackend::new();
        let id = stale_task(&backend, 31).await;
        let (_sink, tracker) = tracker_with(backend);

        assert_eq!(tracker.get_status(&id).await.unwrap().state, TaskState::Timeout);
        tracker.forget(&id);
        assert_eq!(tracker.get_status(&id).await.unwrap().state, TaskState::Revoked);
    }

    #[tokio::test]
    async fn unknown_id_never_times_out() {
        let (sink, tracker) = tracker_with(MemoryBackend::new());
        let status = tracker.get_status("never-submitted").await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(sink.delivered(0).await, 0);
    }

    #[tokio::test]
    async fn wait_follows_state_sequence() {
        let backend = Arc::new(ScriptedBackend::new(
            vec![TaskState::Pending, TaskState::Started, TaskState::Success],
            Utc::now(),
        ));
        let (_sink, tracker) = tracker_with(backend.clone());

        let status = tracker
            .wait("t1", Some(Duration::from_secs(5)), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(status.result, Some(serde_json::json!({"ok": true})));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    async fn assert_client_deadline(state: TaskState) {
        let backend = Arc::new(ScriptedBackend::new(vec![state], Utc::now()));
        let (sink, tracker) = tracker_with(backend);

        let started = std::time::Instant::now();
        let status = tracker
            .wait("t1", Some(Duration::from_millis(500)), Duration::from_millis(100))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(status.state, TaskState::Timeout);
        assert_eq!(status.error.as_deref(), Some(CLIENT_TIMEOUT));
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
        assert_eq!(sink.delivered(0).await, 0);
    }

    #[tokio::test]
    async fn wait_honors_client_deadline_while_running() {
        assert_client_deadline(TaskState::Started).await;
    }

    #[tokio::test]
    async fn wait_honors_client_deadline_while_queued() {
        assert_client_deadline(TaskState::Pending).await;
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let backend = MemoryBackend::new();
        backend.set_available(false).await;
        let (_sink, tracker) = tracker_with(backend);
        assert!(matches!(
            tracker.get_status("t1").await,
            Err(TaskError::StatusUnavailable { .. })
        ));
    }
}

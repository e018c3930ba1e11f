//! In-process queue and result store.
//!
//! Named queues are ordered by priority (higher first, FIFO within one
//! priority). Consumers block in [`MemoryBackend::next`] and are woken per
//! queue. Terminal records are dropped once they are older than the
//! retention window, after which their ids read as unknown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{Envelope, RevokeOutcome, StoredStatus, TaskBackend};
use crate::error::BackendError;
use crate::task::{TaskRecord, TaskState};

/// How long a terminal record is kept after completion.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct Inner {
    records: HashMap<String, TaskRecord>,
    queues: HashMap<String, VecDeque<Envelope>>,
    /// Stages still waiting behind a chain stage, keyed by that stage's id.
    chains: HashMap<String, Vec<Envelope>>,
    /// Children of parents the store has no record for.
    orphan_children: HashMap<String, Vec<String>>,
    wakers: HashMap<String, Arc<Notify>>,
    unavailable: bool,
    rejected_queues: HashSet<String>,
}

impl Inner {
    fn waker(&mut self, queue: &str) -> Arc<Notify> {
        self.wakers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn check_accepts(&self, envelope: &Envelope) -> Result<(), BackendError> {
        if self.unavailable {
            return Err(BackendError::Unavailable("memory backend is offline".into()));
        }
        if self.rejected_queues.contains(&envelope.queue) {
            return Err(BackendError::Rejected {
                queue: envelope.queue.clone(),
                id: envelope.id.clone(),
                reason: "queue is not accepting tasks".into(),
            });
        }
        Ok(())
    }

    fn create_record(&mut self, envelope: &Envelope) {
        let mut record = TaskRecord::new(&envelope.id, &envelope.name, &envelope.queue);
        record.args = envelope.args.clone();
        record.kwargs = envelope.kwargs.clone();
        record.priority = envelope.priority;
        self.records.insert(envelope.id.clone(), record);
    }

    /// Put an envelope whose record already exists on its queue.
    fn push(&mut self, envelope: Envelope, at: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(&envelope.id) {
            record.mark_submitted(at);
            record.args = envelope.args.clone();
        }
        let waker = self.waker(&envelope.queue);
        let queue = self.queues.entry(envelope.queue.clone()).or_default();
        let position = queue
            .iter()
            .position(|queued| queued.priority < envelope.priority)
            .unwrap_or(queue.len());
        debug!(task_id = %envelope.id, queue = %envelope.queue, position, "Task queued");
        queue.insert(position, envelope);
        waker.notify_one();
    }

    fn remove_queued(&mut self, record_queue: &str, task_id: &str) {
        if let Some(queue) = self.queues.get_mut(record_queue) {
            queue.retain(|queued| queued.id != task_id);
        }
    }

    /// Drop terminal records completed at or before `now - retention`,
    /// with the chain and parent bookkeeping that only they referenced.
    fn prune(&mut self, now: DateTime<Utc>, retention: Duration) {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };
        let cutoff = now - retention;
        let before = self.records.len();
        self.records.retain(|_, record| {
            !(record.state.is_terminal() && record.completed_at.is_some_and(|at| at <= cutoff))
        });
        let pruned = before - self.records.len();
        if pruned == 0 {
            return;
        }

        let records = &self.records;
        self.chains.retain(|id, _| records.contains_key(id));
        self.orphan_children
            .retain(|_, children| children.iter().any(|child| records.contains_key(child)));
        debug!(pruned, "Expired terminal task records");
    }

    /// Move every stage still waiting behind `task_id` to `state`.
    fn abandon_chain(&mut self, task_id: &str, state: TaskState, error: &str) {
        let Some(remaining) = self.chains.remove(task_id) else {
            return;
        };
        for stage in remaining {
            if let Some(record) = self.records.get_mut(&stage.id)
                && let Err(e) = record.fail(state, error)
            {
                warn!(task_id = %stage.id, error = %e, "Could not abandon chain stage");
            }
        }
    }
}

/// Queue and result store living in process memory.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    /// Age after which terminal records are dropped.
    retention: Duration,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            retention,
        })
    }

    /// Refuse (or accept again) every enqueue with `Unavailable`.
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.unavailable = !available;
    }

    /// Refuse every enqueue targeting `queue`.
    pub async fn reject_queue(&self, queue: impl Into<String>) {
        self.inner.lock().await.rejected_queues.insert(queue.into());
    }

    /// Rewrite a task's submission time, simulating queue backlog.
    pub async fn backdate(&self, task_id: &str, submitted_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.records.get_mut(task_id) {
            Some(record) => {
                record.submitted_at = Some(submitted_at);
                true
            }
            None => false,
        }
    }

    /// Snapshot of a task's full record.
    pub async fn record(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.lock().await.records.get(task_id).cloned()
    }

    /// Number of tasks waiting on `queue`.
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Number of task records currently held.
    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    /// Take the next task from `queue` if one is waiting. The task moves to
    /// RECEIVED.
    pub async fn try_claim(&self, queue: &str) -> Option<Envelope> {
        let mut inner = self.inner.lock().await;
        let envelope = inner.queues.get_mut(queue)?.pop_front()?;
        if let Some(record) = inner.records.get_mut(&envelope.id)
            && let Err(e) = record.transition_to(TaskState::Received, None)
        {
            warn!(task_id = %envelope.id, error = %e, "Claimed task in unexpected state");
        }
        // Hand the wakeup on if more work is waiting.
        if inner.queues.get(queue).is_some_and(|q| !q.is_empty()) {
            inner.waker(queue).notify_one();
        }
        Some(envelope)
    }

    /// Wait for the next task on `queue`.
    pub async fn next(&self, queue: &str) -> Envelope {
        loop {
            if let Some(envelope) = self.try_claim(queue).await {
                return envelope;
            }
            let waker = self.inner.lock().await.waker(queue);
            waker.notified().await;
        }
    }

    /// RECEIVED → STARTED. Returns false if the task was revoked meanwhile.
    pub async fn mark_started(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.records.get_mut(task_id) {
            Some(record) => record.transition_to(TaskState::Started, None).is_ok(),
            None => false,
        }
    }

    /// Record a result and queue the next chain stage, if any. Returns the
    /// final record, or `None` if the task was no longer running.
    pub async fn complete_success(
        &self,
        task_id: &str,
        result: serde_json::Value,
    ) -> Option<TaskRecord> {
        let mut inner = self.inner.lock().await;
        let record = inner.records.get_mut(task_id)?;
        if let Err(e) = record.succeed(result.clone()) {
            debug!(task_id = %task_id, error = %e, "Dropping result of task that is no longer running");
            return None;
        }
        let finished = record.clone();

        if let Some(mut remaining) = inner.chains.remove(task_id)
            && !remaining.is_empty()
        {
            let mut next = remaining.remove(0);
            if !remaining.is_empty() {
                inner.chains.insert(next.id.clone(), remaining);
            }
            let revoked = inner
                .records
                .get(&next.id)
                .is_some_and(|r| r.state.is_terminal());
            if revoked {
                info!(task_id = %task_id, next_id = %next.id, "Chain stopped at revoked stage");
                inner.abandon_chain(&next.id, TaskState::Revoked, "revoked");
            } else {
                next.args.push(result);
                info!(task_id = %task_id, next_id = %next.id, next = %next.name, "Chain advanced");
                inner.push(next, Utc::now());
            }
        }
        Some(finished)
    }

    /// Record a failure and fail every chain stage waiting behind the task.
    pub async fn complete_failure(&self, task_id: &str, error: &str) -> Option<TaskRecord> {
        let mut inner = self.inner.lock().await;
        let record = inner.records.get_mut(task_id)?;
        if let Err(e) = record.fail(TaskState::Failure, error) {
            debug!(task_id = %task_id, error = %e, "Dropping failure of task that is no longer running");
            return None;
        }
        let finished = record.clone();
        inner.abandon_chain(task_id, TaskState::Failure, error);
        Some(finished)
    }
}

#[async_trait]
impl TaskBackend for MemoryBackend {
    async fn enqueue(&self, envelope: Envelope) -> Result<DateTime<Utc>, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.check_accepts(&envelope)?;
        let now = Utc::now();
        inner.prune(now, self.retention);
        inner.create_record(&envelope);
        inner.push(envelope, now);
        Ok(now)
    }

    async fn enqueue_chain(&self, stages: Vec<Envelope>) -> Result<DateTime<Utc>, BackendError> {
        let mut inner = self.inner.lock().await;
        for stage in &stages {
            inner.check_accepts(stage)?;
        }
        let mut stages = stages.into_iter();
        let Some(first) = stages.next() else {
            return Err(BackendError::Rejected {
                queue: String::new(),
                id: String::new(),
                reason: "empty chain".into(),
            });
        };
        let rest: Vec<Envelope> = stages.collect();

        let now = Utc::now();
        inner.prune(now, self.retention);
        inner.create_record(&first);
        for stage in &rest {
            inner.create_record(stage);
        }
        if !rest.is_empty() {
            inner.chains.insert(first.id.clone(), rest);
        }
        inner.push(first, now);
        Ok(now)
    }

    async fn fetch(&self, task_id: &str) -> Result<StoredStatus, BackendError> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(BackendError::Unavailable("memory backend is offline".into()));
        }
        let stored = match inner.records.get(task_id) {
            Some(record) => StoredStatus {
                name: Some(record.name.clone()),
                status: record.to_status(),
            },
            None => {
                let mut stored = StoredStatus::unknown(task_id);
                if let Some(children) = inner.orphan_children.get(task_id) {
                    stored.status.subtasks = children.clone();
                }
                stored
            }
        };
        Ok(stored)
    }

    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<RevokeOutcome, BackendError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(task_id) else {
            return Ok(RevokeOutcome::NotRevocable);
        };
        if !record.state.is_revocable() || (record.state == TaskState::Started && !terminate) {
            return Ok(RevokeOutcome::NotRevocable);
        }
        if let Err(e) = record.fail(TaskState::Revoked, "revoked") {
            warn!(task_id = %task_id, error = %e, "Revoke rejected");
            return Ok(RevokeOutcome::NotRevocable);
        }
        let queue = record.queue.clone();
        inner.remove_queued(&queue, task_id);
        inner.abandon_chain(task_id, TaskState::Revoked, "revoked");
        info!(task_id = %task_id, terminate, "Task revoked");
        Ok(RevokeOutcome::Revoked)
    }

    async fn attach_subtasks(&self, parent_id: &str, subtask_ids: &[String]) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        match inner.records.get_mut(parent_id) {
            Some(parent) => parent.subtask_ids.extend_from_slice(subtask_ids),
            None => inner
                .orphan_children
                .entry(parent_id.to_string())
                .or_default()
                .extend_from_slice(subtask_ids),
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, BackendError> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(BackendError::Unavailable("memory backend is offline".into()));
        }
        Ok(inner.queues.get(queue).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;
    use serde_json::json;

    fn envelope(id: &str, queue: &str, priority: u8) -> Envelope {
        let mut envelope = Envelope::new(id, "classify_image", queue);
        envelope.priority = Priority::new(priority).unwrap();
        envelope
    }

    #[tokio::test]
    async fn unknown_id_is_pending_without_submission_time() {
        let backend = MemoryBackend::new();
        let stored = backend.fetch("nope").await.unwrap();
        assert_eq!(stored.status.state, TaskState::Pending);
        assert!(stored.status.submitted_at.is_none());
        assert!(stored.name.is_none());
    }

    #[tokio::test]
    async fn higher_priority_is_claimed_first() {
        let backend = MemoryBackend::new();
        backend.enqueue(envelope("low", "cpu", 1)).await.unwrap();
        backend.enqueue(envelope("high-a", "cpu", 9)).await.unwrap();
        backend.enqueue(envelope("high-b", "cpu", 9)).await.unwrap();

        let order: Vec<String> = [
            backend.try_claim("cpu").await.unwrap().id,
            backend.try_claim("cpu").await.unwrap().id,
            backend.try_claim("cpu").await.unwrap().id,
        ]
        .into();
        assert_eq!(order, vec!["high-a", "high-b", "low"]);
        assert!(backend.try_claim("cpu").await.is_none());
    }

    #[tokio::test]
    async fn next_wakes_on_enqueue() {
        let backend = MemoryBackend::new();
        let consumer = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.next("io").await })
        };
        tokio::task::yield_now().await;
        backend.enqueue(envelope("t1", "io", 5)).await.unwrap();

        let claimed = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "t1");
        assert_eq!(backend.record("t1").await.unwrap().state, TaskState::Received);
    }

    #[tokio::test]
    async fn chain_appends_previous_result() {
        let backend = MemoryBackend::new();
        let mut first = Envelope::new("s1", "download_image", "io");
        first.args = vec![json!("scratch")];
        let mut second = Envelope::new("s2", "classify_image", "cpu");
        second.args = vec![json!("scratch")];
        backend.enqueue_chain(vec![first, second]).await.unwrap();

        let pending = backend.fetch("s2").await.unwrap().status;
        assert_eq!(pending.state, TaskState::Pending);
        assert!(pending.submitted_at.is_none());
        assert_eq!(backend.queue_len("cpu").await, 0);

        let claimed = backend.try_claim("io").await.unwrap();
        assert!(backend.mark_started(&claimed.id).await);
        backend.complete_success("s1", json!("/tmp/in.jpg")).await.unwrap();

        let next = backend.try_claim("cpu").await.unwrap();
        assert_eq!(next.id, "s2");
        assert_eq!(next.args, vec![json!("scratch"), json!("/tmp/in.jpg")]);
        assert!(backend.fetch("s2").await.unwrap().status.submitted_at.is_some());
    }

    #[tokio::test]
    async fn chain_failure_fails_downstream() {
        let backend = MemoryBackend::new();
        backend
            .enqueue_chain(vec![
                Envelope::new("a", "download_image", "io"),
                Envelope::new("b", "classify_image", "cpu"),
                Envelope::new("c", "encode_result", "cpu"),
            ])
            .await
            .unwrap();

        backend.try_claim("io").await.unwrap();
        backend.mark_started("a").await;
        backend.complete_failure("a", "404 Not Found").await.unwrap();

        let terminal = backend.fetch("c").await.unwrap().status;
        assert_eq!(terminal.state, TaskState::Failure);
        assert_eq!(terminal.error.as_deref(), Some("404 Not Found"));
        assert_eq!(backend.fetch("b").await.unwrap().status.state, TaskState::Failure);
    }

    #[tokio::test]
    async fn revoked_downstream_stage_is_never_queued() {
        let backend = MemoryBackend::new();
        backend
            .enqueue_chain(vec![
                Envelope::new("a", "download_image", "io"),
                Envelope::new("b", "classify_image", "cpu"),
                Envelope::new("c", "encode_result", "cpu"),
            ])
            .await
            .unwrap();
        assert_eq!(backend.revoke("b", true).await.unwrap(), RevokeOutcome::Revoked);

        backend.try_claim("io").await.unwrap();
        backend.mark_started("a").await;
        backend.complete_success("a", json!("/tmp/in.jpg")).await.unwrap();

        assert_eq!(backend.queue_len("cpu").await, 0);
        assert_eq!(backend.fetch("c").await.unwrap().status.state, TaskState::Revoked);
    }

    #[tokio::test]
    async fn revoke_is_noop_when_terminal() {
        let backend = MemoryBackend::new();
        backend.enqueue(envelope("t1", "cpu", 5)).await.unwrap();
        backend.try_claim("cpu").await.unwrap();
        backend.mark_started("t1").await;
        backend.complete_success("t1", json!(1)).await.unwrap();

        assert_eq!(backend.revoke("t1", true).await.unwrap(), RevokeOutcome::NotRevocable);
        assert_eq!(backend.fetch("t1").await.unwrap().status.state, TaskState::Success);
    }

    #[tokio::test]
    async fn revoke_pending_removes_from_queue() {
        let backend = MemoryBackend::new();
        backend.enqueue(envelope("t1", "cpu", 5)).await.unwrap();

        assert_eq!(backend.revoke("t1", true).await.unwrap(), RevokeOutcome::Revoked);
        assert_eq!(backend.queue_len("cpu").await, 0);
        let status = backend.fetch("t1").await.unwrap().status;
        assert_eq!(status.state, TaskState::Revoked);
        assert_eq!(status.error.as_deref(), Some("revoked"));
    }

    #[tokio::test]
    async fn revoked_running_task_drops_its_result() {
        let backend = MemoryBackend::new();
        backend.enqueue(envelope("t1", "gpu-general", 5)).await.unwrap();
        backend.try_claim("gpu-general").await.unwrap();
        backend.mark_started("t1").await;

        assert_eq!(backend.revoke("t1", false).await.unwrap(), RevokeOutcome::NotRevocable);
        assert_eq!(backend.revoke("t1", true).await.unwrap(), RevokeOutcome::Revoked);
        assert!(backend.complete_success("t1", json!("late")).await.is_none());
        assert_eq!(backend.fetch("t1").await.unwrap().status.state, TaskState::Revoked);
    }

    #[tokio::test]
    async fn rejected_queue_and_outage() {
        let backend = MemoryBackend::new();
        backend.reject_queue("gpu-portrait").await;
        assert!(matches!(
            backend.enqueue(envelope("t1", "gpu-portrait", 5)).await,
            Err(BackendError::Rejected { .. })
        ));

        backend.set_available(false).await;
        assert!(matches!(
            backend.enqueue(envelope("t2", "cpu", 5)).await,
            Err(BackendError::Unavailable(_))
        ));
        assert_eq!(backend.record_count().await, 0);
    }

    async fn run_to_success(backend: &MemoryBackend, id: &str, queue: &str) {
        backend.enqueue(envelope(id, queue, 5)).await.unwrap();
        backend.try_claim(queue).await.unwrap();
        backend.mark_started(id).await;
        backend.complete_success(id, json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn expired_terminal_records_are_pruned() {
        let backend = MemoryBackend::with_retention(std::time::Duration::ZERO);
        run_to_success(&backend, "done", "cpu").await;
        backend
            .attach_subtasks("parent", &["done".to_string()])
            .await
            .unwrap();

        backend.enqueue(envelope("fresh", "cpu", 5)).await.unwrap();

        assert!(backend.record("done").await.is_none());
        assert_eq!(backend.record("fresh").await.unwrap().state, TaskState::Pending);
        assert_eq!(backend.record_count().await, 1);
        let gone = backend.fetch("done").await.unwrap();
        assert!(gone.name.is_none());
        assert!(backend.fetch("parent").await.unwrap().status.subtasks.is_empty());
    }

    #[tokio::test]
    async fn terminal_records_survive_within_retention() {
        let backend = MemoryBackend::new();
        run_to_success(&backend, "done", "cpu").await;
        backend.enqueue(envelope("fresh", "cpu", 5)).await.unwrap();
        assert_eq!(backend.record("done").await.unwrap().state, TaskState::Success);
    }

    #[tokio::test]
    async fn queue_depth_counts_waiting_tasks() {
        let backend = MemoryBackend::new();
        backend.enqueue(envelope("a", "io", 5)).await.unwrap();
        backend.enqueue(envelope("b", "io", 5)).await.unwrap();
        assert_eq!(backend.queue_depth("io").await.unwrap(), 2);
        assert_eq!(backend.queue_depth("cpu").await.unwrap(), 0);

        backend.set_available(false).await;
        assert!(backend.queue_depth("io").await.is_err());
    }

    #[tokio::test]
    async fn subtasks_attach_to_unknown_parent() {
        let backend = MemoryBackend::new();
        backend
            .attach_subtasks("parent", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let status = backend.fetch("parent").await.unwrap().status;
        assert_eq!(status.subtasks, vec!["a", "b"]);
    }
}

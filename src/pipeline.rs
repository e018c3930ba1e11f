//! Image super-resolution pipeline driver.
//!
//! Runs as a task on the main queue and fans work out as two chains:
//! `download_image → classify_image`, then, once the category is known,
//! `gpu_inference_<category> → encode_result → upload_result`. The job's
//! scratch directory is removed once the pipeline ends and its last chain
//! has settled, including when the pipeline is cancelled by its time limit.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{CapabilityError, TaskError};
use crate::lifecycle::TaskLifecycleManager;
use crate::registry::{Capability, Invocation};
use crate::routing::capability_names as names;
use crate::scratch::files;
use crate::task::{SubmissionMode, SubtaskConfig, WorkerType};
use crate::tracker::CLIENT_TIMEOUT;

pub const PIPELINE_TASK: &str = "image_super_resolution_pipeline";

/// Final result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub task_id: String,
    pub input_url: String,
    pub output_url: String,
    pub classification: serde_json::Value,
}

/// Drives one pipeline run through the lifecycle manager.
pub struct SuperResolutionPipeline {
    manager: Arc<TaskLifecycleManager>,
}

impl SuperResolutionPipeline {
    pub fn new(manager: Arc<TaskLifecycleManager>) -> Self {
        Self { manager }
    }

    /// Run every stage for `job_id`, whose scratch directory the stages share.
    pub async fn run(
        &self,
        job_id: &str,
        image_url: &str,
        upload_url: &str,
    ) -> Result<PipelineOutcome, TaskError> {
        let mut cleanup = ScratchCleanup::new(self.manager.clone(), job_id);
        let outcome = self
            .run_stages(&mut cleanup, job_id, image_url, upload_url)
            .await;
        cleanup.finish().await;
        outcome
    }

    async fn run_stages(
        &self,
        cleanup: &mut ScratchCleanup,
        job_id: &str,
        image_url: &str,
        upload_url: &str,
    ) -> Result<PipelineOutcome, TaskError> {
        let manager = &self.manager;
        let timeout = manager.default_timeout();
        info!(job_id = %job_id, image_url = %image_url, "Starting super-resolution pipeline");

        let intake = [
            SubtaskConfig::new(names::DOWNLOAD_IMAGE, WorkerType::Io)
                .with_args(vec![json!(job_id), json!(image_url)]),
            SubtaskConfig::new(names::CLASSIFY_IMAGE, WorkerType::Cpu).with_args(vec![json!(job_id)]),
        ];
        let ids = manager
            .submit_subtasks(job_id, &intake, SubmissionMode::Chain)
            .await?;
        cleanup.track(&ids[0]);
        let classification = manager.wait_for_result(&ids[0], timeout).await?;

        let category = classification["category"].as_str().unwrap_or_default();
        let route = manager.router().route_for_category(category);
        info!(job_id = %job_id, category = %category, capability = %route.capability, "Image classified");

        let input_path = manager
            .scratch()
            .task_dir(job_id)
            .map_err(|e| TaskError::InvalidRequest(e.to_string()))?
            .join(files::INPUT);

        // encode_result and upload_result receive the previous stage's path
        // as their trailing argument.
        let finish = [
            SubtaskConfig::new(route.capability.as_str(), WorkerType::Gpu)
                .with_queue(route.queue.as_str())
                .with_args(vec![json!(job_id), json!(input_path.to_string_lossy())]),
            SubtaskConfig::new(names::ENCODE_RESULT, WorkerType::Cpu).with_args(vec![json!(job_id)]),
            SubtaskConfig::new(names::UPLOAD_RESULT, WorkerType::Io)
                .with_args(vec![json!(job_id), json!(files::RESULT), json!(upload_url)]),
        ];
        let ids = manager
            .submit_subtasks(job_id, &finish, SubmissionMode::Chain)
            .await?;
        cleanup.track(&ids[0]);
        let output_url = manager.wait_for_result(&ids[0], timeout).await?;

        info!(job_id = %job_id, output_url = %output_url, "Pipeline complete");
        Ok(PipelineOutcome {
            task_id: job_id.to_string(),
            input_url: image_url.to_string(),
            output_url: output_url.as_str().unwrap_or_default().to_string(),
            classification,
        })
    }
}

/// Removes a job's scratch directory after the chain it last submitted has
/// settled, so no stage writes into the directory after it is gone.
///
/// Dropped without [`finish`](Self::finish) (the pipeline future was
/// cancelled), it does the same work on a spawned task.
struct ScratchCleanup {
    manager: Arc<TaskLifecycleManager>,
    job_id: String,
    last_chain: Option<String>,
    finished: bool,
}

impl ScratchCleanup {
    fn new(manager: Arc<TaskLifecycleManager>, job_id: &str) -> Self {
        Self {
            manager,
            job_id: job_id.to_string(),
            last_chain: None,
            finished: false,
        }
    }

    /// Terminal id of the chain most recently submitted for the job.
    fn track(&mut self, terminal_id: &str) {
        self.last_chain = Some(terminal_id.to_string());
    }

    async fn finish(mut self) {
        self.finished = true;
        settle_and_purge(
            self.manager.clone(),
            std::mem::take(&mut self.job_id),
            self.last_chain.take(),
        )
        .await;
    }
}

impl Drop for ScratchCleanup {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let job_id = std::mem::take(&mut self.job_id);
        let settle = settle_and_purge(self.manager.clone(), job_id.clone(), self.last_chain.take());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                info!(job_id = %job_id, "Pipeline cancelled, cleaning up scratch in background");
                runtime.spawn(settle);
            }
            Err(_) => warn!(job_id = %job_id, "No runtime to clean up scratch of cancelled pipeline"),
        }
    }
}

async fn settle_and_purge(
    manager: Arc<TaskLifecycleManager>,
    job_id: String,
    last_chain: Option<String>,
) {
    if let Some(terminal_id) = last_chain {
        let limit = manager.default_timeout();
        match manager.wait(&terminal_id, Some(limit), None).await {
            Ok(status) if status.error.as_deref() == Some(CLIENT_TIMEOUT) => warn!(
                job_id = %job_id,
                task_id = %terminal_id,
                "Chain still running, purging scratch anyway"
            ),
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, task_id = %terminal_id, error = %e, "Could not settle chain"),
        }
    }
    manager.cleanup(&job_id).await;
}

/// The pipeline as a submittable task:
/// `image_super_resolution_pipeline(image_url, upload_url)`.
///
/// The manager holds the registry that holds this task, so the task only
/// keeps a weak handle, bound once the manager exists.
pub struct PipelineTask {
    queue: String,
    manager: OnceLock<Weak<TaskLifecycleManager>>,
}

impl PipelineTask {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            manager: OnceLock::new(),
        }
    }

    /// Attach the manager. Later calls are ignored.
    pub fn bind(&self, manager: &Arc<TaskLifecycleManager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }
}

#[async_trait]
impl Capability for PipelineTask {
    fn name(&self) -> &str {
        PIPELINE_TASK
    }

    fn worker_type(&self) -> WorkerType {
        WorkerType::Cpu
    }

    fn queue(&self) -> Option<&str> {
        Some(&self.queue)
    }

    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
        let image_url = invocation.str_arg(PIPELINE_TASK, 0, "image_url")?;
        let upload_url = invocation.str_arg(PIPELINE_TASK, 1, "upload_url")?;
        let manager = self
            .manager
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| CapabilityError::Failed {
                name: PIPELINE_TASK.to_string(),
                reason: "lifecycle manager is not available".into(),
            })?;

        let outcome = SuperResolutionPipeline::new(manager)
            .run(&invocation.task_id, image_url, upload_url)
            .await
            .map_err(|e| CapabilityError::Failed {
                name: PIPELINE_TASK.to_string(),
                reason: e.to_string(),
            })?;
        Ok(serde_json::to_value(outcome)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::Settings;
    use crate::notify::NotificationDispatcher;
    use crate::registry::TaskRegistry;
    use crate::routing::QueueRouter;
    use crate::scratch::ScratchStore;
    use crate::task::metrics::{names as metric_names, sample};
    use crate::task::{MetricsCollector, Priority, TaskState};
    use crate::worker::{
        ModelCache, PlaceholderLoader, QueueAssignment, StageDeps, WorkerDeps, WorkerPool,
        register_stages,
    };
    use std::io::Cursor;
    use std::time::Duration;

    /// Writes a wide PNG as the downloaded input.
    struct FakeDownload {
        scratch: ScratchStore,
        delay: Duration,
    }

    #[async_trait]
    impl Capability for FakeDownload {
        fn name(&self) -> &str {
            names::DOWNLOAD_IMAGE
        }
        fn worker_type(&self) -> WorkerType {
            WorkerType::Io
        }
        async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
            let job = invocation.str_arg(names::DOWNLOAD_IMAGE, 0, "task_id")?;
            tokio::time::sleep(self.delay).await;
            let mut png = Cursor::new(Vec::new());
            image::RgbImage::new(192, 108)
                .write_to(&mut png, image::ImageFormat::Png)
                .map_err(|e| CapabilityError::Failed {
                    name: names::DOWNLOAD_IMAGE.to_string(),
                    reason: e.to_string(),
                })?;
            let path = self.scratch.save(job, files::INPUT, png.get_ref()).await?;
            Ok(json!(path.to_string_lossy()))
        }
    }

    /// Echoes the upload URL without touching the network.
    struct FakeUpload {
        scratch: ScratchStore,
        delay: Duration,
    }

    #[async_trait]
    impl Capability for FakeUpload {
        fn name(&self) -> &str {
            names::UPLOAD_RESULT
        }
        fn worker_type(&self) -> WorkerType {
            WorkerType::Io
        }
        async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
            let job = invocation.str_arg(names::UPLOAD_RESULT, 0, "task_id")?;
            let file = invocation.str_arg(names::UPLOAD_RESULT, 1, "result_filename")?;
            self.scratch.load(job, file).await?;
            tokio::time::sleep(self.delay).await;
            Ok(json!(invocation.str_arg(names::UPLOAD_RESULT, 2, "upload_url")?))
        }
    }

    struct Harness {
        scratch_root: tempfile::TempDir,
        manager: Arc<TaskLifecycleManager>,
        _pool: WorkerPool,
    }

    fn harness(time_limit: Duration, download_delay: Duration, upload_delay: Duration) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings {
            scratch_root: tmp.path().to_path_buf(),
            task_default_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            ..Settings::default()
        };
        let scratch = ScratchStore::new(tmp.path());
        let router = QueueRouter::new(&settings.queues);

        let mut registry = TaskRegistry::new();
        register_stages(
            &mut registry,
            StageDeps {
                scratch: scratch.clone(),
                http: reqwest::Client::new(),
                models: Arc::new(ModelCache::new(Arc::new(PlaceholderLoader), "/models")),
            },
            &router,
        );
        registry.register(Arc::new(FakeDownload {
            scratch: scratch.clone(),
            delay: download_delay,
        }));
        registry.register(Arc::new(FakeUpload {
            scratch,
            delay: upload_delay,
        }));
        let pipeline = Arc::new(PipelineTask::new(router.main_queue()));
        registry.register(pipeline.clone());
        let registry = Arc::new(registry);

        let backend = MemoryBackend::new();
        let metrics = Arc::new(MetricsCollector::new(true));
        let manager = Arc::new(TaskLifecycleManager::new(
            &settings,
            registry.clone(),
            backend.clone(),
            NotificationDispatcher::disabled(),
            metrics.clone(),
        ));
        pipeline.bind(&manager);

        let pool = WorkerPool::spawn(
            WorkerDeps {
                backend,
                registry,
                notifier: NotificationDispatcher::disabled(),
                metrics,
                default_time_limit: time_limit,
            },
            &QueueAssignment::from_settings(&settings),
        );
        Harness {
            scratch_root: tmp,
            manager,
            _pool: pool,
        }
    }

    async fn submit_pipeline(manager: &TaskLifecycleManager) -> String {
        manager
            .submit(
                PIPELINE_TASK,
                vec![json!("https://images.test/in.jpg"), json!("https://bucket.test/out.jpg")],
                Default::default(),
                Priority::NORMAL,
            )
            .await
            .unwrap()
            .task_id
    }

    #[tokio::test]
    async fn pipeline_routes_by_category_and_cleans_up() {
        let h = harness(Duration::from_secs(5), Duration::ZERO, Duration::ZERO);
        let manager = &h.manager;

        let id = submit_pipeline(manager).await;
        let status = manager
            .wait(&id, Some(Duration::from_secs(5)), None)
            .await
            .unwrap();

        assert_eq!(status.state, TaskState::Success, "{status:?}");
        let outcome: PipelineOutcome = serde_json::from_value(status.result.unwrap()).unwrap();
        assert_eq!(outcome.output_url, "https://bucket.test/out.jpg");
        assert_eq!(outcome.classification["category"], "landscape");

        // Both chains hang off the pipeline task.
        assert_eq!(manager.get_status(&id).await.unwrap().subtasks.len(), 2);
        let text = manager.render_metrics().await;
        assert_eq!(
            sample(
                &text,
                metric_names::TASKS_COMPLETED,
                &[
                    &format!(r#"task_name="{}""#, names::GPU_INFERENCE_LANDSCAPE),
                    r#"status="success""#
                ]
            ),
            Some(1.0)
        );
        assert!(!h.scratch_root.path().join(&id).exists());
    }

    #[tokio::test]
    async fn cancelled_pipeline_purges_scratch_after_last_chain_settles() {
        // The pipeline's 400ms limit runs out while the upload is in flight.
        let h = harness(
            Duration::from_millis(400),
            Duration::from_millis(150),
            Duration::from_millis(300),
        );
        let manager = &h.manager;

        let id = submit_pipeline(manager).await;
        let status = manager
            .wait(&id, Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        assert_eq!(status.state, TaskState::Failure, "{status:?}");
        assert!(status.error.unwrap().contains("timed out"));

        let dir = h.scratch_root.path().join(&id);
        let purged = tokio::time::timeout(Duration::from_secs(3), async {
            while dir.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(purged.is_ok(), "scratch directory was never removed");

        // The purge waited for the upload, so nothing recreates the directory.
        let subtasks = manager.get_status(&id).await.unwrap().subtasks;
        assert_eq!(subtasks.len(), 2);
        let upload = manager.get_status(&subtasks[1]).await.unwrap();
        assert_eq!(upload.state, TaskState::Success);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn unbound_pipeline_fails() {
        let task = PipelineTask::new("main");
        let err = task
            .execute(Invocation::new("t1", vec![json!("a"), json!("b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Failed { .. }));
    }
}

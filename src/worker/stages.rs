//! Placeholder pipeline stages.
//!
//! These mirror the super-resolution pipeline's stage contracts (argument
//! order, scratch file names, return values) without doing real image work:
//! inference and encoding copy bytes between stage files.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::fs;
use tracing::info;

use crate::error::{CapabilityError, ScratchError};
use crate::registry::{Capability, Invocation, RetryPolicy, TaskRegistry};
use crate::routing::{CategoryRoute, ImageCategory, QueueRouter, capability_names as names};
use crate::scratch::{ScratchStore, files};
use crate::task::WorkerType;
use crate::worker::cache::ModelCache;

/// Retry policy of the network-bound stages.
pub const IO_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(5));

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_QUALITY: u64 = 95;

/// Shared handles the stages run against.
#[derive(Clone)]
pub struct StageDeps {
    pub scratch: ScratchStore,
    pub http: reqwest::Client,
    pub models: Arc<ModelCache>,
}

/// Register every stage. GPU stages take their queues from `router`.
pub fn register_stages(registry: &mut TaskRegistry, deps: StageDeps, router: &QueueRouter) {
    registry.register(Arc::new(DownloadImage { deps: deps.clone() }));
    registry.register(Arc::new(ClassifyImage { deps: deps.clone() }));
    for category in [
        ImageCategory::General,
        ImageCategory::Portrait,
        ImageCategory::Landscape,
    ] {
        registry.register(Arc::new(GpuInference::new(
            category,
            router.route_for(category),
            deps.clone(),
        )));
    }
    registry.register(Arc::new(EncodeResult { deps: deps.clone() }));
    registry.register(Arc::new(UploadResult { deps }));
}

fn stage_failed(name: &str, reason: impl std::fmt::Display) -> CapabilityError {
    CapabilityError::Failed {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

async fn read_stage_file(path: &str) -> Result<Vec<u8>, CapabilityError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ScratchError::NotFound(path.to_string()).into())
        }
        Err(e) => Err(ScratchError::Io(e).into()),
    }
}

fn path_string(path: &Path) -> serde_json::Value {
    json!(path.to_string_lossy())
}

// ── DownloadImage ───────────────────────────────────────────────────

/// `download_image(scratch_id, image_url)` → path of `input.jpg`.
struct DownloadImage {
    deps: StageDeps,
}

#[async_trait]
impl Capability for DownloadImage {
    fn name(&self) -> &str {
        names::DOWNLOAD_IMAGE
    }

    fn worker_type(&self) -> WorkerType {
        WorkerType::Io
    }

    fn retry_policy(&self) -> RetryPolicy {
        IO_RETRY
    }

    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
        let scratch_id = invocation.str_arg(self.name(), 0, "task_id")?;
        let image_url = invocation.str_arg(self.name(), 1, "image_url")?;
        info!(scratch_id = %scratch_id, url = %image_url, "Downloading image");

        let bytes = self
            .deps
            .http
            .get(image_url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let path = self.deps.scratch.save(scratch_id, files::INPUT, &bytes).await?;
        info!(scratch_id = %scratch_id, path = %path.display(), size = bytes.len(), "Image downloaded");
        Ok(path_string(&path))
    }
}

// ── ClassifyImage ───────────────────────────────────────────────────

/// `classify_image(scratch_id, image_path)` → `{category, width, height,
/// aspect_ratio}`, also written to `classification.json`.
///
/// Dimensions come from the image header, or from `width`/`height` kwargs
/// when the header is unreadable.
struct ClassifyImage {
    deps: StageDeps,
}

/// Category by aspect ratio: near-square is portrait, wide is landscape.
pub fn categorize(width: u32, height: u32) -> ImageCategory {
    if height == 0 {
        return ImageCategory::General;
    }
    let aspect_ratio = f64::from(width) / f64::from(height);
    if (0.7..=1.3).contains(&aspect_ratio) {
        ImageCategory::Portrait
    } else if aspect_ratio > 1.5 {
        ImageCategory::Landscape
    } else {
        ImageCategory::General
    }
}

#[async_trait]
impl Capability for ClassifyImage {
    fn name(&self) -> &str {
        names::CLASSIFY_IMAGE
    }

    fn worker_type(&self) -> WorkerType {
        WorkerType::Cpu
    }

    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
        let scratch_id = invocation.str_arg(self.name(), 0, "task_id")?;
        let image_path = invocation.str_arg(self.name(), 1, "image_path")?;
        let bytes = read_stage_file(image_path).await?;

        let dimensions = image_dimensions(&bytes).or_else(|| {
            let width = invocation.kwargs.get("width")?.as_u64()?;
            let height = invocation.kwargs.get("height")?.as_u64()?;
            Some((u32::try_from(width).ok()?, u32::try_from(height).ok()?))
        });

        let result = match dimensions {
            Some((width, height)) => {
                let aspect_ratio = if height == 0 {
                    0.0
                } else {
                    f64::from(width) / f64::from(height)
                };
                json!({
                    "category": categorize(width, height).as_str(),
                    "width": width,
                    "height": height,
                    "aspect_ratio": aspect_ratio,
                })
            }
            None => json!({
                "category": ImageCategory::General.as_str(),
                "width": null,
                "height": null,
                "aspect_ratio": null,
            }),
        };

        self.deps
            .scratch
            .save(scratch_id, files::CLASSIFICATION, &serde_json::to_vec(&result)?)
            .await?;
        info!(scratch_id = %scratch_id, category = %result["category"], "Image classified");
        Ok(result)
    }
}

/// Width and height read from the image header, for any format the
/// `image` crate recognizes. `None` when the bytes are not a readable image.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

// ── GpuInference ────────────────────────────────────────────────────

/// `gpu_inference_<category>(scratch_id, input_path)` → path of `output.jpg`.
struct GpuInference {
    name: String,
    queue: String,
    model: &'static str,
    deps: StageDeps,
}

impl GpuInference {
    fn new(category: ImageCategory, route: &CategoryRoute, deps: StageDeps) -> Self {
        Self {
            name: route.capability.clone(),
            queue: route.queue.clone(),
            model: category.as_str(),
            deps,
        }
    }
}

#[async_trait]
impl Capability for GpuInference {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> WorkerType {
        WorkerType::Gpu
    }

    fn queue(&self) -> Option<&str> {
        Some(&self.queue)
    }

    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
        let scratch_id = invocation.str_arg(&self.name, 0, "task_id")?;
        let input_path = invocation.str_arg(&self.name, 1, "input_path")?;

        let model = self.deps.models.get_or_load(self.model).await?;
        info!(scratch_id = %scratch_id, model = %model.name, "Running inference");

        let input = read_stage_file(input_path).await?;
        let output = self.deps.scratch.save(scratch_id, files::OUTPUT, &input).await?;
        info!(scratch_id = %scratch_id, path = %output.display(), "Inference complete");
        Ok(path_string(&output))
    }
}

// ── EncodeResult ────────────────────────────────────────────────────

/// `encode_result(scratch_id, output_path, quality = 95)` → path of
/// `result.jpg`.
struct EncodeResult {
    deps: StageDeps,
}

#[async_trait]
impl Capability for EncodeResult {
    fn name(&self) -> &str {
        names::ENCODE_RESULT
    }

    fn worker_type(&self) -> WorkerType {
        WorkerType::Cpu
    }

    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
        let scratch_id = invocation.str_arg(self.name(), 0, "task_id")?;
        let output_path = invocation.str_arg(self.name(), 1, "output_path")?;
        let quality = match invocation.kwargs.get("quality") {
            None => DEFAULT_QUALITY,
            Some(value) => value
                .as_u64()
                .filter(|q| *q <= 100)
                .ok_or_else(|| CapabilityError::InvalidArguments {
                    name: self.name().to_string(),
                    reason: format!("quality must be 0-100, got {value}"),
                })?,
        };

        let image = read_stage_file(output_path).await?;
        let encoded = self.deps.scratch.save(scratch_id, files::RESULT, &image).await?;
        info!(scratch_id = %scratch_id, quality, path = %encoded.display(), "Result encoded");
        Ok(path_string(&encoded))
    }
}

// ── UploadResult ────────────────────────────────────────────────────

/// `upload_result(scratch_id, result_filename, upload_url)` → `upload_url`.
struct UploadResult {
    deps: StageDeps,
}

#[async_trait]
impl Capability for UploadResult {
    fn name(&self) -> &str {
        names::UPLOAD_RESULT
    }

    fn worker_type(&self) -> WorkerType {
        WorkerType::Io
    }

    fn retry_policy(&self) -> RetryPolicy {
        IO_RETRY
    }

    async fn execute(&self, invocation: Invocation) -> Result<serde_json::Value, CapabilityError> {
        let scratch_id = invocation.str_arg(self.name(), 0, "task_id")?;
        let filename = invocation.str_arg(self.name(), 1, "result_filename")?;
        let upload_url = invocation.str_arg(self.name(), 2, "upload_url")?;

        let data = self.deps.scratch.load(scratch_id, filename).await?;
        self.deps
            .http
            .put(upload_url)
            .timeout(UPLOAD_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(data)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| stage_failed(names::UPLOAD_RESULT, e))?;

        info!(scratch_id = %scratch_id, url = %upload_url, "Result uploaded");
        Ok(json!(upload_url))
    }
}

//! Static queue routing: worker type and image category to queue/capability.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::QueueNames;
use crate::task::WorkerType;

/// Well-known capability names.
pub mod capability_names {
    pub const DOWNLOAD_IMAGE: &str = "download_image";
    pub const UPLOAD_RESULT: &str = "upload_result";
    pub const CLASSIFY_IMAGE: &str = "classify_image";
    pub const ENCODE_RESULT: &str = "encode_result";
    pub const GPU_INFERENCE_GENERAL: &str = "gpu_inference_general";
    pub const GPU_INFERENCE_PORTRAIT: &str = "gpu_inference_portrait";
    pub const GPU_INFERENCE_LANDSCAPE: &str = "gpu_inference_landscape";
}

/// Image category produced by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCategory {
    General,
    Portrait,
    Landscape,
}

impl ImageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Portrait => "portrait",
            Self::Landscape => "landscape",
        }
    }

    /// Lenient parse; `None` for unrecognized categories.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "portrait" => Some(Self::Portrait),
            "landscape" => Some(Self::Landscape),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue and capability for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRoute {
    pub queue: String,
    pub capability: String,
}

/// Immutable routing table. Built once at startup and shared.
#[derive(Debug, Clone)]
pub struct QueueRouter {
    main_queue: String,
    worker_queues: HashMap<WorkerType, String>,
    categories: HashMap<ImageCategory, CategoryRoute>,
    default_category: ImageCategory,
}

impl QueueRouter {
    pub fn new(queues: &QueueNames) -> Self {
        use capability_names::*;

        let worker_queues = HashMap::from([
            (WorkerType::Io, queues.io.clone()),
            (WorkerType::Cpu, queues.cpu.clone()),
            (WorkerType::Gpu, queues.gpu_general.clone()),
        ]);

        let route = |queue: &str, capability: &str| CategoryRoute {
            queue: queue.to_string(),
            capability: capability.to_string(),
        };
        let categories = HashMap::from([
            (
                ImageCategory::General,
                route(&queues.gpu_general, GPU_INFERENCE_GENERAL),
            ),
            (
                ImageCategory::Portrait,
                route(&queues.gpu_portrait, GPU_INFERENCE_PORTRAIT),
            ),
            (
                ImageCategory::Landscape,
                route(&queues.gpu_landscape, GPU_INFERENCE_LANDSCAPE),
            ),
        ]);

        Self {
            main_queue: queues.main.clone(),
            worker_queues,
            categories,
            default_category: ImageCategory::General,
        }
    }

    /// Queue for tasks that declare no worker type.
    pub fn main_queue(&self) -> &str {
        &self.main_queue
    }

    /// Queue serving a worker type. GPU work without a category goes to the
    /// general GPU queue.
    pub fn queue_for(&self, worker_type: WorkerType) -> &str {
        self.worker_queues
            .get(&worker_type)
            .map(String::as_str)
            .unwrap_or(&self.main_queue)
    }

    /// Queue and capability for a classification category. Unrecognized
    /// categories fall back to the default route.
    pub fn route_for_category(&self, category: &str) -> &CategoryRoute {
        let resolved = ImageCategory::parse(category).unwrap_or_else(|| {
            tracing::debug!(
                category = %category,
                fallback = %self.default_category,
                "Unrecognized category, using default route"
            );
            self.default_category
        });
        self.route_for(resolved)
    }

    pub fn route_for(&self, category: ImageCategory) -> &CategoryRoute {
        // Every category is inserted in `new`.
        &self.categories[&category]
    }

    /// Every queue a worker pool should consume.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = std::iter::once(self.main_queue.clone())
            .chain(self.worker_queues.values().cloned())
            .chain(self.categories.values().map(|r| r.queue.clone()))
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }
}

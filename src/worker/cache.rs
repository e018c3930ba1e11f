//! Per-process cache of inference models.
//!
//! Each model is loaded at most once per process, however many stages ask
//! for it concurrently. The cache is injected into the GPU stages rather than
//! living in a global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::CapabilityError;

/// A model resident in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub name: String,
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

/// Loads model weights from disk.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, name: &str, path: &Path) -> Result<LoadedModel, CapabilityError>;
}

/// Records the model's name and path without reading any weights.
#[derive(Debug, Default)]
pub struct PlaceholderLoader;

#[async_trait]
impl ModelLoader for PlaceholderLoader {
    async fn load(&self, name: &str, path: &Path) -> Result<LoadedModel, CapabilityError> {
        Ok(LoadedModel {
            name: name.to_string(),
            path: path.to_path_buf(),
            loaded_at: Utc::now(),
        })
    }
}

type Slot = Arc<OnceCell<Arc<LoadedModel>>>;

/// Load-once model cache.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    model_dir: PathBuf,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            model_dir: model_dir.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Weights file for a model: `<model_dir>/<name>_model.pth`.
    pub fn model_path(&self, name: &str) -> PathBuf {
        self.model_dir.join(format!("{name}_model.pth"))
    }

    /// Return the model, loading it on first use. Concurrent first callers
    /// share a single load. A failed load leaves the slot empty so a later
    /// call can retry.
    pub async fn get_or_load(&self, name: &str) -> Result<Arc<LoadedModel>, CapabilityError> {
        let slot = self.slot(name);
        let path = self.model_path(name);
        slot.get_or_try_init(|| async {
            info!(model = %name, path = %path.display(), "Loading model");
            let model = self.loader.load(name, &path).await?;
            info!(model = %name, "Model loaded");
            Ok::<_, CapabilityError>(Arc::new(model))
        })
        .await
        .cloned()
    }

    /// The model if it is already loaded.
    pub fn get(&self, name: &str) -> Option<Arc<LoadedModel>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(|slot| slot.get().cloned())
    }

    /// Load every named model, logging failures instead of returning them.
    pub async fn preload(&self, names: &[&str]) -> usize {
        let mut loaded = 0;
        for name in names {
            match self.get_or_load(name).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(model = %name, error = %e, "Could not preload model"),
            }
        }
        loaded
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

//! Worker side: in-process consumers, pipeline stages and the model cache.
//!
//! - `pool`: per-queue consumers with time limits and retries
//! - `stages`: placeholder pipeline capabilities
//! - `cache`: load-once inference model cache

pub mod cache;
pub mod pool;
pub mod stages;

pub use cache::{LoadedModel, ModelCache, ModelLoader, PlaceholderLoader};
pub use pool::{QueueAssignment, WorkerDeps, WorkerPool};
pub use stages::{StageDeps, register_stages};

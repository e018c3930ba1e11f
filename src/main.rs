use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use tasklane::api::task_routes;
use tasklane::backend::MemoryBackend;
use tasklane::config::{EmailConfig, Settings};
use tasklane::lifecycle::TaskLifecycleManager;
use tasklane::notify::NotificationDispatcher;
use tasklane::pipeline::PipelineTask;
use tasklane::registry::TaskRegistry;
use tasklane::routing::{ImageCategory, QueueRouter};
use tasklane::scratch::ScratchStore;
use tasklane::task::MetricsCollector;
use tasklane::worker::{
    ModelCache, PlaceholderLoader, QueueAssignment, StageDeps, WorkerDeps, WorkerPool,
    register_stages,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let metrics = Arc::new(MetricsCollector::new(settings.enable_metrics));
    let scratch = ScratchStore::new(settings.scratch_root.clone());

    // Warm the per-category models before accepting work
    let models = Arc::new(ModelCache::new(
        Arc::new(PlaceholderLoader),
        settings.model_dir.clone(),
    ));
    let categories = [
        ImageCategory::General,
        ImageCategory::Portrait,
        ImageCategory::Landscape,
    ]
    .map(|c| c.as_str());
    let loaded = models.preload(&categories).await;
    info!(loaded, model_dir = %settings.model_dir.display(), "Models preloaded");

    // Capabilities
    let router = QueueRouter::new(&settings.queues);
    let mut registry = TaskRegistry::new();
    register_stages(
        &mut registry,
        StageDeps {
            scratch,
            http: reqwest::Client::new(),
            models,
        },
        &router,
    );
    let pipeline = Arc::new(PipelineTask::new(router.main_queue()));
    registry.register(pipeline.clone());
    let registry = Arc::new(registry);

    let backend = MemoryBackend::new();
    let notifier = NotificationDispatcher::from_settings(
        settings.admin_webhook_url.as_deref(),
        settings.admin_email.as_deref(),
        EmailConfig::from_env(),
    );
    let alert_sinks = notifier.sink_count();

    let manager = Arc::new(TaskLifecycleManager::new(
        &settings,
        registry.clone(),
        backend.clone(),
        notifier.clone(),
        metrics.clone(),
    ));
    pipeline.bind(&manager);

    let pool = WorkerPool::spawn(
        WorkerDeps {
            backend,
            registry,
            notifier,
            metrics,
            default_time_limit: settings.task_default_timeout,
        },
        &QueueAssignment::from_settings(&settings),
    );

    let addr = format!("{}:{}", settings.api_host, settings.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %addr,
        consumers = pool.consumer_count(),
        alert_sinks,
        "Tasklane v{} listening",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(listener, task_routes(manager))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    pool.shutdown();
    Ok(())
}

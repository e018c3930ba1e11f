//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Queue names for every route the system dispatches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub main: String,
    pub io: String,
    pub cpu: String,
    pub gpu_general: String,
    pub gpu_portrait: String,
    pub gpu_landscape: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            main: "main".to_string(),
            io: "io".to_string(),
            cpu: "cpu".to_string(),
            gpu_general: "gpu-general".to_string(),
            gpu_portrait: "gpu-portrait".to_string(),
            gpu_landscape: "gpu-landscape".to_string(),
        }
    }
}

/// Number of concurrent consumers per worker class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConcurrency {
    pub io: usize,
    pub cpu: usize,
    /// Per GPU queue.
    pub gpu: usize,
}

impl Default for WorkerConcurrency {
    fn default() -> Self {
        Self {
            io: 20,
            cpu: 10,
            gpu: 2,
        }
    }
}

/// Service settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Execution time limit applied when a task declares none.
    pub task_default_timeout: Duration,
    /// Maximum time a task may sit PENDING before it is revoked.
    pub task_queue_timeout: Duration,
    /// Interval between polls in synchronous waits.
    pub poll_interval: Duration,
    pub queues: QueueNames,
    pub concurrency: WorkerConcurrency,
    /// Root of the per-task scratch directories.
    pub scratch_root: PathBuf,
    /// Directory holding the model weights preloaded by GPU workers.
    pub model_dir: PathBuf,
    pub enable_metrics: bool,
    pub admin_webhook_url: Option<String>,
    pub admin_email: Option<String>,
    pub api_host: String,
    pub api_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            task_default_timeout: Duration::from_secs(300), // 5 minutes
            task_queue_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            queues: QueueNames::default(),
            concurrency: WorkerConcurrency::default(),
            scratch_root: PathBuf::from("/tmp/shared/tasks"),
            model_dir: PathBuf::from("/models"),
            enable_metrics: true,
            admin_webhook_url: None,
            admin_email: None,
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
        }
    }
}

impl Settings {
    /// Build settings from `TASKLANE_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let task_default_timeout = env_parse::<u64>("TASKLANE_TASK_DEFAULT_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.task_default_timeout);
        let task_queue_timeout = env_parse::<u64>("TASKLANE_TASK_QUEUE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.task_queue_timeout);
        let poll_interval = env_parse::<u64>("TASKLANE_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let queues = QueueNames {
            main: env_string("TASKLANE_QUEUE_MAIN").unwrap_or(defaults.queues.main),
            io: env_string("TASKLANE_QUEUE_IO").unwrap_or(defaults.queues.io),
            cpu: env_string("TASKLANE_QUEUE_CPU").unwrap_or(defaults.queues.cpu),
            gpu_general: env_string("TASKLANE_QUEUE_GPU_GENERAL")
                .unwrap_or(defaults.queues.gpu_general),
            gpu_portrait: env_string("TASKLANE_QUEUE_GPU_PORTRAIT")
                .unwrap_or(defaults.queues.gpu_portrait),
            gpu_landscape: env_string("TASKLANE_QUEUE_GPU_LANDSCAPE")
                .unwrap_or(defaults.queues.gpu_landscape),
        };

        let concurrency = WorkerConcurrency {
            io: env_parse("TASKLANE_IO_WORKER_CONCURRENCY")?.unwrap_or(defaults.concurrency.io),
            cpu: env_parse("TASKLANE_CPU_WORKER_CONCURRENCY")?.unwrap_or(defaults.concurrency.cpu),
            gpu: env_parse("TASKLANE_GPU_WORKER_CONCURRENCY")?.unwrap_or(defaults.concurrency.gpu),
        };

        Ok(Self {
            task_default_timeout,
            task_queue_timeout,
            poll_interval,
            queues,
            concurrency,
            scratch_root: env_string("TASKLANE_SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            model_dir: env_string("TASKLANE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            enable_metrics: env_parse("TASKLANE_ENABLE_METRICS")?
                .unwrap_or(defaults.enable_metrics),
            admin_webhook_url: env_string("TASKLANE_ADMIN_WEBHOOK_URL"),
            admin_email: env_string("TASKLANE_ADMIN_EMAIL"),
            api_host: env_string("TASKLANE_API_HOST").unwrap_or(defaults.api_host),
            api_port: env_parse("TASKLANE_API_PORT")?.unwrap_or(defaults.api_port),
        })
    }
}

/// SMTP configuration for admin email alerts.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `TASKLANE_SMTP_HOST` is not set (email alerts disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = env_string("TASKLANE_SMTP_HOST")?;

        let smtp_port: u16 = std::env::var("TASKLANE_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("TASKLANE_SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("TASKLANE_SMTP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("TASKLANE_SMTP_FROM").unwrap_or_else(|_| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

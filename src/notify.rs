//! Admin notifications for queue timeouts and task failures.
//!
//! Delivery is best-effort: every sink is attempted independently and
//! failures are logged, never returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::EmailConfig;
use crate::error::NotifyError;

/// Webhook request timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Kind of alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEvent {
    TaskTimeout,
    TaskFailure,
}

/// Alert payload, also the webhook JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub event: AlertEvent,
    /// Task the alert is about.
    pub task_id: String,
    /// Seconds the task waited in the queue. Timeout alerts only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<f64>,
    /// Failure reason. Failure alerts only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable summary, also used as the email body.
    pub message: String,
}

impl Alert {
    pub fn timeout(task_id: &str, wait_time: Duration) -> Self {
        let secs = wait_time.as_secs_f64();
        Self {
            event: AlertEvent::TaskTimeout,
            task_id: task_id.to_string(),
            wait_time: Some(secs),
            error: None,
            message: format!("Task {task_id} timed out after {secs:.1}s in queue"),
        }
    }

    pub fn failure(task_id: &str, error: &str) -> Self {
        Self {
            event: AlertEvent::TaskFailure,
            task_id: task_id.to_string(),
            wait_time: None,
            error: Some(error.to_string()),
            message: format!("Task {task_id} failed: {error}"),
        }
    }
}

/// A delivery channel for alerts.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this sink handles the event kind.
    fn accepts(&self, _event: AlertEvent) -> bool {
        true
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// POSTs the alert as JSON to a webhook URL.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| NotifyError::Webhook(e.to_string()))?;
        tracing::info!(url = %self.url, task_id = %alert.task_id, "Webhook notification sent");
        Ok(())
    }
}

/// Sends timeout alerts to the admin address over SMTP.
pub struct EmailSink {
    config: EmailConfig,
    to: String,
}

impl EmailSink {
    pub fn new(config: EmailConfig, to: impl Into<String>) -> Self {
        Self {
            config,
            to: to.into(),
        }
    }

    fn send_email(config: &EmailConfig, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| NotifyError::Email(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e| NotifyError::Email(format!("Invalid from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| NotifyError::Email(format!("Invalid to address: {e}")))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| NotifyError::Email(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| NotifyError::Email(format!("SMTP send failed: {e}")))?;

        tracing::info!("Email sent to {to}");
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    fn accepts(&self, event: AlertEvent) -> bool {
        event == AlertEvent::TaskTimeout
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        let config = self.config.clone();
        let to = self.to.clone();
        let subject = format!("Task Timeout Alert: {}", alert.task_id);
        let body = alert.message.clone();

        // lettre's SmtpTransport is blocking.
        tokio::task::spawn_blocking(move || Self::send_email(&config, &to, &subject, &body))
            .await
            .map_err(|e| NotifyError::Email(format!("Email task panicked: {e}")))?
    }
}

/// Fans alerts out to every configured sink.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Dispatcher with no sinks; alerts are only logged.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build from the admin webhook URL and admin email settings.
    pub fn from_settings(
        webhook_url: Option<&str>,
        admin_email: Option<&str>,
        email_config: Option<EmailConfig>,
    ) -> Self {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
        if let Some(url) = webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url)));
        }
        match (admin_email, email_config) {
            (Some(to), Some(config)) => sinks.push(Arc::new(EmailSink::new(config, to))),
            (Some(to), None) => {
                tracing::warn!(admin_email = %to, "Admin email set but SMTP is not configured");
            }
            _ => {}
        }
        Self { sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub async fn notify_timeout(&self, task_id: &str, wait_time: Duration) {
        let alert = Alert::timeout(task_id, wait_time);
        tracing::warn!(task_id = %task_id, wait_time = wait_time.as_secs_f64(), "{}", alert.message);
        self.dispatch(&alert).await;
    }

    pub async fn notify_failure(&self, task_id: &str, error: &str) {
        let alert = Alert::failure(task_id, error);
        tracing::error!(task_id = %task_id, "{}", alert.message);
        self.dispatch(&alert).await;
    }

    async fn dispatch(&self, alert: &Alert) {
        let deliveries = self
            .sinks
            .iter()
            .filter(|sink| sink.accepts(alert.event))
            .map(|sink| async move {
                if let Err(e) = sink.deliver(alert).await {
                    tracing::error!(
                        sink = sink.name(),
                        task_id = %alert.task_id,
                        error = %e,
                        "Failed to send notification"
                    );
                }
            });
        futures::future::join_all(deliveries).await;
    }
}

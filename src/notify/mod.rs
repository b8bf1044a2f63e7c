//! Alert dispatch for high-severity results.
//!
//! Alerts are sent after the result is persisted, on a detached task. A
//! failing notifier is logged and otherwise ignored.

use crate::config::{NotifierKind, NotifyConfig};
use crate::error::NotifyError;
use crate::models::{AnalysisResult, Severity};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What a notifier is told about an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub event_id: String,
    pub app_id: String,
    pub severity: Severity,
    pub summary: String,
    pub channel: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        info!(
            event_id = %alert.event_id,
            app_id = %alert.app_id,
            channel = %alert.channel,
            "{} {} alert: {}",
            alert.severity.emoji(),
            alert.severity,
            alert.summary
        );
        Ok(())
    }
}

/// POSTs alerts as JSON.
pub struct WebhookNotifier {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http_client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Decides whether a result warrants an alert and sends it in the background.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    threshold: Severity,
    channel: String,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, threshold: Severity, channel: impl Into<String>) -> Self {
        Self {
            notifier,
            threshold,
            channel: channel.into(),
        }
    }

    /// Build the notifier named in the configuration.
    pub fn from_config(config: &NotifyConfig, http_client: &reqwest::Client) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = match config.kind {
            NotifierKind::Log => Arc::new(LogNotifier),
            NotifierKind::Webhook => {
                let url = config
                    .webhook_url
                    .as_ref()
                    .context("notify.webhook_url is required for the webhook notifier")?;
                Arc::new(WebhookNotifier::new(url.clone(), http_client.clone()))
            }
        };
        Ok(Self::new(notifier, config.threshold, config.channel.clone()))
    }

    pub fn should_notify(&self, result: &AnalysisResult) -> bool {
        !result.degraded && result.severity >= self.threshold
    }

    /// Fire-and-forget dispatch. Returns the task handle when an alert was sent.
    pub fn dispatch(&self, app_id: &str, result: &AnalysisResult) -> Option<JoinHandle<()>> {
        if !self.should_notify(result) {
            return None;
        }

        let alert = Alert {
            event_id: result.event_id.clone(),
            app_id: app_id.to_string(),
            severity: result.severity,
            summary: result.summary.clone(),
            channel: self.channel.clone(),
        };
        let notifier = Arc::clone(&self.notifier);

        Some(tokio::spawn(async move {
            if let Err(e) = notifier.notify(&alert).await {
                warn!(
                    event_id = %alert.event_id,
                    notifier = notifier.name(),
                    error = %e,
                    "Notification failed"
                );
            }
        }))
    }
}

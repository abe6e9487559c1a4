//! Alert delivery.
//!
//! Delivery is best effort: failures are logged by [`deliver`] and never
//! retried or propagated into the monitoring pipeline.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use vigil_core::alert::{Alert, Severity};

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Send `alert` through `notifier`, logging instead of failing.
pub async fn deliver(notifier: &dyn Notifier, alert: &Alert) {
    if let Err(e) = notifier.notify(alert).await {
        tracing::warn!(alert = %alert.id, notifier = notifier.name(), error = %e, "alert delivery failed");
    }
}

// ---------------------------------------------------------------------------
// LogNotifier
// ---------------------------------------------------------------------------

/// Writes alerts as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let recipients = alert.recipients.join(",");
        match alert.severity {
            Severity::Critical | Severity::High => tracing::warn!(
                alert = %alert.id,
                kind = %alert.kind,
                severity = %alert.severity,
                subject = %alert.subject,
                recipients = %recipients,
                "{}: {}",
                alert.title,
                alert.message
            ),
            _ => tracing::info!(
                alert = %alert.id,
                kind = %alert.kind,
                severity = %alert.severity,
                subject = %alert.subject,
                recipients = %recipients,
                "{}: {}",
                alert.title,
                alert.message
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebhookNotifier
// ---------------------------------------------------------------------------

/// POSTs the alert as JSON. Any non-2xx response is a delivery failure.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let failed = |reason: String| EngineError::Delivery {
            notifier: "webhook",
            reason,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(failed(format!("HTTP {}", resp.status().as_u16())));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FanOut
// ---------------------------------------------------------------------------

/// Delivers to every inner notifier; one failing does not stop the others.
#[derive(Default, Clone)]
pub struct FanOut {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanOut {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }

    /// The log notifier plus a webhook when one is configured.
    pub fn from_webhook(url: Option<&str>) -> Self {
        let mut targets: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = url {
            targets.push(Arc::new(WebhookNotifier::new(url)));
        }
        Self { targets }
    }
}

#[async_trait]
impl Notifier for FanOut {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        for target in &self.targets {
            deliver(target.as_ref(), alert).await;
        }
        Ok(())
    }
}

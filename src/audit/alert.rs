//! Severity-triggered alerting.
//!
//! Delivery happens on spawned tasks. A failing sink is logged and
//! otherwise ignored; it never affects the append that triggered it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::audit::entry::{ActionType, Actor, AuditLogEntry, Severity};
use crate::audit::verify::VerificationReport;
use crate::config::AlertSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    HighSeverityEntry,
    IntegrityViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub entry_id: Option<Uuid>,
    pub sequence: Option<i64>,
    pub action_type: Option<ActionType>,
    pub actor: Option<Actor>,
    pub summary: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn for_entry(entry: &AuditLogEntry) -> Self {
        Self {
            kind: AlertKind::HighSeverityEntry,
            severity: entry.severity(),
            entry_id: Some(entry.entry_id()),
            sequence: Some(entry.sequence),
            action_type: Some(entry.content.action_type),
            actor: Some(entry.content.actor.clone()),
            summary: entry.summary(),
            raised_at: Utc::now(),
        }
    }

    pub fn for_violation(report: &VerificationReport) -> Self {
        let first = report.broken_links.first();
        Self {
            kind: AlertKind::IntegrityViolation,
            severity: Severity::Critical,
            entry_id: first.map(|l| l.entry_id),
            sequence: first.map(|l| l.sequence),
            action_type: None,
            actor: None,
            summary: report.summary(),
            raised_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("alert rejected with status {0}")]
    Rejected(u16),
    #[error("alert delivery timed out")]
    Timeout,
}

/// Destination for alerts (webhook, pager, mail relay...).
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// POSTs the alert as JSON.
pub struct WebhookAlertSink {
    url: String,
    http_client: Client,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self.http_client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Writes alerts to the operational log.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        error!(
            kind = ?alert.kind,
            severity = %alert.severity,
            sequence = ?alert.sequence,
            "AUDIT ALERT: {}",
            alert.summary
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct AlertDispatcher {
    sinks: Vec<Arc<dyn AlertSink>>,
    min_severity: Severity,
    timeout: Duration,
}

impl AlertDispatcher {
    pub fn new(min_severity: Severity, timeout: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            min_severity,
            timeout,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn from_config(settings: &AlertSettings) -> Result<Self, AlertError> {
        let timeout = Duration::from_millis(settings.timeout_ms);
        let mut dispatcher = Self::new(settings.min_severity, timeout);

        if settings.log_alerts {
            dispatcher = dispatcher.with_sink(Arc::new(LogAlertSink));
        }
        if let Some(url) = &settings.webhook_url {
            dispatcher = dispatcher.with_sink(Arc::new(WebhookAlertSink::new(url, timeout)?));
        }
        Ok(dispatcher)
    }

    pub fn min_severity(&self) -> Severity {
        self.min_severity
    }

    pub fn should_alert(&self, entry: &AuditLogEntry) -> bool {
        entry.severity() >= self.min_severity
    }

    /// Alert on a freshly appended entry if its severity warrants it.
    pub fn notify_appended(&self, entry: &AuditLogEntry) -> Option<JoinHandle<()>> {
        if !self.should_alert(entry) || self.sinks.is_empty() {
            return None;
        }
        Some(self.dispatch(Alert::for_entry(entry)))
    }

    pub fn notify_violation(&self, report: &VerificationReport) -> JoinHandle<()> {
        self.dispatch(Alert::for_violation(report))
    }

    fn dispatch(&self, alert: Alert) -> JoinHandle<()> {
        let sinks = self.sinks.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            for sink in sinks {
                let outcome = match tokio::time::timeout(timeout, sink.send(&alert)).await {
                    Ok(result) => result,
                    Err(_) => Err(AlertError::Timeout),
                };
                match outcome {
                    Ok(()) => debug!("Alert delivered via {}", sink.name()),
                    Err(e) => warn!("Alert sink {} failed: {}", sink.name(), e),
                }
            }
        })
    }
}

//! Alert delivery collaborators.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::security::incident::{IncidentKind, Severity};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by receiver: {0}")]
    Rejected(String),

    #[error("collaborator not configured: {0}")]
    NotConfigured(&'static str),
}

/// Notification sent to operators.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub incident_id: String,
    pub identity: String,
    pub kind: IncidentKind,
    pub severity: Severity,
    pub timestamp: u64,
    pub message: String,
}

/// Something that can deliver an alert.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: Alert) -> Result<(), CollaboratorError>;
}

/// Emits alerts as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: Alert) -> Result<(), CollaboratorError> {
        tracing::error!(
            incident_id = %alert.incident_id,
            identity = %alert.identity,
            kind = alert.kind.as_str(),
            severity = ?alert.severity,
            "SECURITY ALERT: {}",
            alert.message
        );
        Ok(())
    }
}

/// Posts alerts as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: Alert) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;

        if response.status().is_success() {
            tracing::debug!(incident_id = %alert.incident_id, "Alert delivered to webhook");
            Ok(())
        } else {
            Err(CollaboratorError::Rejected(response.status().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> Alert {
        Alert {
            incident_id: "i-1".into(),
            identity: "10.0.0.9".into(),
            kind: IncidentKind::AutoBlock,
            severity: Severity::High,
            timestamp: 0,
            message: "auto-blocked".into(),
        }
    }

    #[tokio::test]
    async fn test_tracing_sink_always_succeeds() {
        assert!(TracingAlertSink.send(alert()).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_transport_failure_is_reported() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let sink = WebhookAlertSink::new("http://127.0.0.1:9/alerts", Duration::from_millis(500)).unwrap();
        let err = sink.send(alert()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Transport(_)));
    }

    #[test]
    fn test_alert_serializes_kind() {
        let json = serde_json::to_value(alert()).unwrap();
        assert_eq!(json["kind"], "auto_block");
        assert_eq!(json["severity"], "high");
    }
}

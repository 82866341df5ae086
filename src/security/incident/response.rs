//! Remediation actions run against an incident.
//!
//! Each action is attempted independently. A failing action is reported in
//! the outcome list and does not stop the ones after it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::MILLIS_PER_SEC;
use crate::error::ShieldResult;
use crate::observability::metrics;
use crate::security::abuse::AbuseDetector;
use crate::security::incident::alert::Alert;
use crate::security::incident::journal::SecurityEvent;
use crate::security::incident::{Incident, IncidentCoordinator};

/// Remediation menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseAction {
    BlockIp,
    BlockDevice,
    InvalidateSession,
    SnapshotLogs,
    Alert,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::BlockIp => "block_ip",
            ResponseAction::BlockDevice => "block_device",
            ResponseAction::InvalidateSession => "invalidate_session",
            ResponseAction::SnapshotLogs => "snapshot_logs",
            ResponseAction::Alert => "alert",
        }
    }
}

/// Result of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub action: ResponseAction,
    pub executed: bool,
    pub detail: String,
}

/// Result of a whole remediation batch.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseReport {
    pub incident_id: String,
    /// True if at least one requested action executed.
    pub success: bool,
    pub outcomes: Vec<ActionOutcome>,
    /// Events captured by SNAPSHOT_LOGS, if requested.
    pub snapshot: Option<Vec<SecurityEvent>>,
}

/// Something that can block a device identifier.
#[async_trait]
pub trait DeviceBlocker: Send + Sync {
    async fn block(&self, device_id: &str, duration: Duration, reason: &str) -> Result<(), String>;
}

#[async_trait]
impl DeviceBlocker for AbuseDetector {
    async fn block(&self, device_id: &str, duration: Duration, reason: &str) -> Result<(), String> {
        self.block_device(device_id, duration, reason);
        Ok(())
    }
}

impl IncidentCoordinator {
    /// Look up a stored incident and run `actions` against it.
    pub async fn respond(
        &self,
        incident_id: &str,
        actions: &[ResponseAction],
    ) -> ShieldResult<ResponseReport> {
        let incident = self.get_incident(incident_id)?;
        Ok(self.execute_response(&incident, actions).await)
    }

    /// Run `actions` in order against `incident`.
    pub async fn execute_response(
        &self,
        incident: &Incident,
        actions: &[ResponseAction],
    ) -> ResponseReport {
        let mut outcomes = Vec::with_capacity(actions.len());
        let mut snapshot = None;

        for action in actions {
            let result = match action {
                ResponseAction::BlockIp => self.respond_block_ip(incident),
                ResponseAction::BlockDevice => self.respond_block_device(incident).await,
                ResponseAction::InvalidateSession => self.respond_invalidate(incident),
                ResponseAction::SnapshotLogs => match self.respond_snapshot(incident).await {
                    Ok(events) => {
                        let detail = format!("captured {} events", events.len());
                        snapshot = Some(events);
                        Ok(detail)
                    }
                    Err(e) => Err(e),
                },
                ResponseAction::Alert => self.respond_alert(incident).await,
            };

            let outcome = match result {
                Ok(detail) => ActionOutcome {
                    action: *action,
                    executed: true,
                    detail,
                },
                Err(detail) => {
                    tracing::warn!(
                        incident_id = %incident.id,
                        action = action.as_str(),
                        error = %detail,
                        "Response action failed"
                    );
                    ActionOutcome {
                        action: *action,
                        executed: false,
                        detail,
                    }
                }
            };
            metrics::record_action(action.as_str(), outcome.executed);
            outcomes.push(outcome);
        }

        let success = outcomes.iter().any(|o| o.executed);
        tracing::info!(
            incident_id = %incident.id,
            actions = outcomes.len(),
            success,
            "Incident response executed"
        );

        ResponseReport {
            incident_id: incident.id.clone(),
            success,
            outcomes,
            snapshot,
        }
    }

    fn respond_block_ip(&self, incident: &Incident) -> Result<String, String> {
        let entry = self.block(
            &incident.identity,
            self.block_duration(),
            &format!("incident {}", incident.id),
        );
        Ok(format!("blocked {} until {}", entry.identity, entry.expires_at))
    }

    async fn respond_block_device(&self, incident: &Incident) -> Result<String, String> {
        let device_id = incident
            .details
            .get("device_id")
            .ok_or_else(|| "incident has no device_id".to_string())?;
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| "no device blocker configured".to_string())?;
        let duration = self.block_duration();
        devices
            .block(device_id, duration, &format!("incident {}", incident.id))
            .await?;
        Ok(format!("blocked device {}", device_id))
    }

    fn respond_invalidate(&self, incident: &Incident) -> Result<String, String> {
        let user_id = incident
            .details
            .get("user_id")
            .map(String::as_str)
            .unwrap_or(&incident.identity);
        let count = self.sessions.invalidate_all_for_user(user_id);
        Ok(format!("invalidated {} sessions", count))
    }

    async fn respond_snapshot(&self, incident: &Incident) -> Result<Vec<SecurityEvent>, String> {
        let half = self.config.snapshot_window_secs * MILLIS_PER_SEC;
        let from = incident.timestamp.saturating_sub(half);
        let to = incident.timestamp.saturating_add(half);
        self.logs.snapshot(from, to).await.map_err(|e| e.to_string())
    }

    async fn respond_alert(&self, incident: &Incident) -> Result<String, String> {
        let alert = Alert {
            incident_id: incident.id.clone(),
            identity: incident.identity.clone(),
            kind: incident.kind,
            severity: incident.severity,
            timestamp: incident.timestamp,
            message: format!("{} incident on {}", incident.kind.as_str(), incident.identity),
        };
        self.alerts.send(alert).await.map_err(|e| e.to_string())?;
        Ok("alert delivered".to_string())
    }
}

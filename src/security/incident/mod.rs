//! Violation escalation and incident management.
//!
//! # States (per identity)
//! - Clean: no recorded violations
//! - Flagged: at least one violation, below the auto-block threshold
//! - AutoBlocked: blocked until the block expires
//!
//! # State Transitions
//! ```text
//! Clean → Flagged:        first recorded violation
//! Flagged → AutoBlocked:  violations >= auto_block_threshold
//! AutoBlocked → Clean:    block expiry (counter restarts) or manual unblock
//! ```
//!
//! # Design Decisions
//! - Blocks are evaluated lazily against the clock; expired entries are
//!   evicted by the lookup that notices them
//! - Incidents are opened once per escalation and never edited, except to
//!   resolve them
//! - Remediation (response.rs) reports per-action outcomes instead of
//!   failing the batch

pub mod alert;
pub mod journal;
pub mod response;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{deadline, SharedClock, MILLIS_PER_MINUTE, MILLIS_PER_SEC};
use crate::config::IncidentConfig;
use crate::error::{ShieldError, ShieldResult};
use crate::observability::metrics;
use crate::security::eviction;
use crate::security::session::SessionRegistry;

use self::alert::{Alert, AlertSink, TracingAlertSink};
use self::journal::{EventJournal, LogSource};
use self::response::DeviceBlocker;

/// Category of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    AutoBlock,
    RateLimitAbuse,
    AnomalousTraffic,
    CredentialCompromise,
    BruteForce,
    Manual,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::AutoBlock => "auto_block",
            IncidentKind::RateLimitAbuse => "rate_limit_abuse",
            IncidentKind::AnomalousTraffic => "anomalous_traffic",
            IncidentKind::CredentialCompromise => "credential_compromise",
            IncidentKind::BruteForce => "brute_force",
            IncidentKind::Manual => "manual",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IncidentKind::CredentialCompromise => Severity::Critical,
            IncidentKind::AutoBlock | IncidentKind::BruteForce => Severity::High,
            IncidentKind::RateLimitAbuse | IncidentKind::AnomalousTraffic => Severity::Medium,
            IncidentKind::Manual => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A recorded escalation event.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: String,
    /// Source ip, device id or key hash the incident is about.
    pub identity: String,
    pub kind: IncidentKind,
    pub severity: Severity,
    pub timestamp: u64,
    /// Free-form context; `device_id` and `user_id` are read by remediation.
    pub details: BTreeMap<String, String>,
    pub resolved: bool,
    pub resolved_at: Option<u64>,
}

/// Derived per-identity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    Clean,
    Flagged,
    AutoBlocked,
}

/// An active block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    pub identity: String,
    pub reason: String,
    pub blocked_at: u64,
    pub expires_at: u64,
}

/// Result of recording a violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationOutcome {
    pub identity: String,
    pub violations: u32,
    pub state: IdentityState,
    /// This violation crossed the threshold.
    pub newly_blocked: bool,
    pub blocked_until: Option<u64>,
    pub incident_id: Option<String>,
}

#[derive(Debug, Default)]
struct IdentityRecord {
    violations: u32,
    last_violation: u64,
    block: Option<BlockEntry>,
}

impl IdentityRecord {
    /// Drop an expired block; expiry returns the identity to Clean.
    fn expire(&mut self, now: u64) {
        if matches!(&self.block, Some(block) if block.expires_at <= now) {
            self.block = None;
            self.violations = 0;
        }
    }

    fn state(&self) -> IdentityState {
        if self.block.is_some() {
            IdentityState::AutoBlocked
        } else if self.violations > 0 {
            IdentityState::Flagged
        } else {
            IdentityState::Clean
        }
    }

    fn last_seen(&self) -> u64 {
        self.block
            .as_ref()
            .map(|b| b.expires_at)
            .unwrap_or(self.last_violation)
            .max(self.last_violation)
    }
}

/// Aggregate counts for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncidentStats {
    pub tracked_identities: usize,
    pub blocked_identities: usize,
    pub open_incidents: usize,
    pub total_incidents: usize,
}

/// Collects violations, blocks repeat offenders and runs remediation.
pub struct IncidentCoordinator {
    config: IncidentConfig,
    clock: SharedClock,
    sessions: Arc<SessionRegistry>,
    devices: Option<Arc<dyn DeviceBlocker>>,
    alerts: Arc<dyn AlertSink>,
    logs: Arc<dyn LogSource>,
    journal: Arc<EventJournal>,
    identities: DashMap<String, IdentityRecord>,
    incidents: DashMap<String, Incident>,
}

impl std::fmt::Debug for IncidentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncidentCoordinator")
            .field("config", &self.config)
            .field("identities", &self.identities.len())
            .field("incidents", &self.incidents.len())
            .finish()
    }
}

impl IncidentCoordinator {
    pub fn new(
        config: IncidentConfig,
        clock: SharedClock,
        sessions: Arc<SessionRegistry>,
    ) -> ShieldResult<Self> {
        config.validate().map_err(ShieldError::InvalidConfig)?;
        let journal = Arc::new(EventJournal::new(config.journal_capacity));
        Ok(Self {
            config,
            clock,
            sessions,
            devices: None,
            alerts: Arc::new(TracingAlertSink),
            logs: journal.clone(),
            journal,
            identities: DashMap::new(),
            incidents: DashMap::new(),
        })
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_device_blocker(mut self, devices: Arc<dyn DeviceBlocker>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_log_source(mut self, logs: Arc<dyn LogSource>) -> Self {
        self.logs = logs;
        self
    }

    pub fn config(&self) -> &IncidentConfig {
        &self.config
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    fn block_duration(&self) -> Duration {
        Duration::from_millis(self.config.block_duration_minutes.saturating_mul(MILLIS_PER_MINUTE))
    }

    /// Count a violation; blocks the identity once the threshold is reached.
    pub fn record_violation(&self, identity: &str, kind: &str) -> ViolationOutcome {
        let now = self.clock.now_millis();
        let block_until = deadline(now, self.block_duration());

        let (violations, state, newly_blocked, blocked_until) = {
            let mut record = self.identities.entry(identity.to_string()).or_default();
            record.expire(now);
            record.violations += 1;
            record.last_violation = now;

            let newly_blocked =
                record.block.is_none() && record.violations >= self.config.auto_block_threshold;
            if newly_blocked {
                record.block = Some(BlockEntry {
                    identity: identity.to_string(),
                    reason: format!("auto-block after {} violations", record.violations),
                    blocked_at: now,
                    expires_at: block_until,
                });
            }
            (
                record.violations,
                record.state(),
                newly_blocked,
                record.block.as_ref().map(|b| b.expires_at),
            )
        };

        self.journal.record(now, identity, "violation", format!("{} (#{})", kind, violations));
        metrics::record_violation(kind);
        tracing::info!(identity = %identity, kind = %kind, violations, "Violation recorded");

        let incident_id = if newly_blocked {
            let mut details = BTreeMap::new();
            details.insert("trigger".to_string(), kind.to_string());
            details.insert("violations".to_string(), violations.to_string());
            let incident = self.create_incident(identity, IncidentKind::AutoBlock, details);

            tracing::warn!(
                identity = %identity,
                violations,
                duration_minutes = self.config.block_duration_minutes,
                incident_id = %incident.id,
                "Identity auto-blocked"
            );
            metrics::record_auto_block();
            self.notify(&incident, format!("{} auto-blocked after {} violations", identity, violations));
            Some(incident.id)
        } else {
            None
        };

        ViolationOutcome {
            identity: identity.to_string(),
            violations,
            state,
            newly_blocked,
            blocked_until,
            incident_id,
        }
    }

    /// Fire-and-forget alert; never blocks the caller.
    fn notify(&self, incident: &Incident, message: String) {
        let alert = Alert {
            incident_id: incident.id.clone(),
            identity: incident.identity.clone(),
            kind: incident.kind,
            severity: incident.severity,
            timestamp: incident.timestamp,
            message,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let alerts = self.alerts.clone();
                handle.spawn(async move {
                    if let Err(e) = alerts.send(alert).await {
                        tracing::error!(error = %e, "Failed to deliver alert");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(incident_id = %alert.incident_id, "No async runtime, alert logged only: {}", alert.message);
            }
        }
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        self.block_remaining_secs(identity).is_some()
    }

    /// Seconds until the identity's block lifts, if blocked.
    pub fn block_remaining_secs(&self, identity: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let expires_at = self
            .identities
            .get(identity)
            .and_then(|r| r.block.as_ref().map(|b| b.expires_at))?;
        if expires_at > now {
            return Some((expires_at - now).div_ceil(MILLIS_PER_SEC));
        }
        if let Some(mut record) = self.identities.get_mut(identity) {
            record.expire(now);
        }
        None
    }

    pub fn block_entry(&self, identity: &str) -> Option<BlockEntry> {
        if !self.is_blocked(identity) {
            return None;
        }
        self.identities.get(identity).and_then(|r| r.block.clone())
    }

    pub fn state(&self, identity: &str) -> IdentityState {
        let now = self.clock.now_millis();
        match self.identities.get_mut(identity) {
            Some(mut record) => {
                record.expire(now);
                record.state()
            }
            None => IdentityState::Clean,
        }
    }

    pub fn violation_count(&self, identity: &str) -> u32 {
        let now = self.clock.now_millis();
        self.identities
            .get_mut(identity)
            .map(|mut r| {
                r.expire(now);
                r.violations
            })
            .unwrap_or(0)
    }

    /// Block an identity directly, extending any shorter existing block.
    pub fn block(&self, identity: &str, duration: Duration, reason: &str) -> BlockEntry {
        let now = self.clock.now_millis();
        let expires_at = deadline(now, duration);
        let entry = {
            let mut record = self.identities.entry(identity.to_string()).or_default();
            record.expire(now);
            let expires_at = record
                .block
                .as_ref()
                .map(|b| b.expires_at.max(expires_at))
                .unwrap_or(expires_at);
            let entry = BlockEntry {
                identity: identity.to_string(),
                reason: reason.to_string(),
                blocked_at: now,
                expires_at,
            };
            record.block = Some(entry.clone());
            entry
        };

        self.journal.record(now, identity, "block", reason);
        tracing::warn!(identity = %identity, reason = %reason, duration_secs = duration.as_secs(), "Identity blocked");
        entry
    }

    /// Manual override: lift a block and clear the violation counter.
    pub fn unblock(&self, identity: &str) -> ShieldResult<()> {
        if !self.is_blocked(identity) {
            return Err(ShieldError::not_found("block", identity));
        }
        if let Some(mut record) = self.identities.get_mut(identity) {
            record.block = None;
            record.violations = 0;
        }
        let now = self.clock.now_millis();
        self.journal.record(now, identity, "unblock", "manual override");
        tracing::info!(identity = %identity, "Identity unblocked");
        Ok(())
    }

    /// Open an incident outside the violation counter path.
    pub fn create_incident(
        &self,
        identity: &str,
        kind: IncidentKind,
        details: BTreeMap<String, String>,
    ) -> Incident {
        let now = self.clock.now_millis();
        let incident = Incident {
            id: uuid::Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            kind,
            severity: kind.severity(),
            timestamp: now,
            details,
            resolved: false,
            resolved_at: None,
        };

        self.make_room_for_incident();
        self.incidents.insert(incident.id.clone(), incident.clone());
        self.journal.record(now, identity, "incident", format!("{} {}", kind.as_str(), incident.id));
        metrics::record_incident(kind.as_str());
        tracing::warn!(
            incident_id = %incident.id,
            identity = %identity,
            kind = kind.as_str(),
            severity = ?incident.severity,
            "Incident opened"
        );
        incident
    }

    fn make_room_for_incident(&self) {
        if self.incidents.len() < self.config.max_incidents {
            return;
        }
        let victim = self
            .incidents
            .iter()
            .min_by_key(|i| (!i.resolved, i.timestamp))
            .map(|i| i.id.clone());
        if let Some(id) = victim {
            self.incidents.remove(&id);
            tracing::debug!(incident_id = %id, "Incident store full, dropped oldest");
        }
    }

    pub fn get_incident(&self, id: &str) -> ShieldResult<Incident> {
        self.incidents
            .get(id)
            .map(|i| i.clone())
            .ok_or_else(|| ShieldError::not_found("incident", id))
    }

    /// Incidents, newest first.
    pub fn list_incidents(&self, unresolved_only: bool) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = self
            .incidents
            .iter()
            .filter(|i| !unresolved_only || !i.resolved)
            .map(|i| i.clone())
            .collect();
        incidents.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        incidents
    }

    pub fn resolve_incident(&self, id: &str) -> ShieldResult<Incident> {
        let now = self.clock.now_millis();
        let mut incident = self
            .incidents
            .get_mut(id)
            .ok_or_else(|| ShieldError::not_found("incident", id))?;
        if incident.resolved {
            return Err(ShieldError::terminal("incident", id));
        }
        incident.resolved = true;
        incident.resolved_at = Some(now);
        tracing::info!(incident_id = %id, "Incident resolved");
        Ok(incident.clone())
    }

    /// Forget identities with neither an active block nor a recent violation.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl = self.config.violation_ttl_minutes.saturating_mul(MILLIS_PER_MINUTE);
        self.journal.flush();
        for mut record in self.identities.iter_mut() {
            record.expire(now);
        }
        let removed = eviction::sweep_idle(&self.identities, now, ttl, |r| {
            if r.block.is_some() {
                now
            } else {
                r.last_seen()
            }
        });
        metrics::record_tracked("incident_coordinator", self.identities.len());
        removed
    }

    pub fn stats(&self) -> IncidentStats {
        let now = self.clock.now_millis();
        IncidentStats {
            tracked_identities: self.identities.len(),
            blocked_identities: self
                .identities
                .iter()
                .filter(|r| r.block.as_ref().is_some_and(|b| b.expires_at > now))
                .count(),
            open_incidents: self.incidents.iter().filter(|i| !i.resolved).count(),
            total_incidents: self.incidents.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SessionConfig;

    fn coordinator(threshold: u32) -> (IncidentCoordinator, Arc<ManualClock>, Arc<SessionRegistry>) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let sessions = Arc::new(SessionRegistry::new(SessionConfig::default(), clock.clone()).unwrap());
        let config = IncidentConfig {
            auto_block_threshold: threshold,
            ..Default::default()
        };
        let coordinator = IncidentCoordinator::new(config, clock.clone(), sessions.clone()).unwrap();
        (coordinator, clock, sessions)
    }

    #[test]
    fn test_auto_block_on_fifth_violation() {
        let (coordinator, clock, _) = coordinator(5);

        for i in 1..=4 {
            let outcome = coordinator.record_violation("ip9", "x");
            assert_eq!(outcome.violations, i);
            assert_eq!(outcome.state, IdentityState::Flagged);
            assert!(!coordinator.is_blocked("ip9"));
        }

        let outcome = coordinator.record_violation("ip9", "x");
        assert!(outcome.newly_blocked);
        assert_eq!(outcome.state, IdentityState::AutoBlocked);
        assert!(outcome.incident_id.is_some());
        assert!(coordinator.is_blocked("ip9"));

        clock.advance(Duration::from_secs(59 * 60));
        assert!(coordinator.is_blocked("ip9"));
        assert_eq!(coordinator.block_remaining_secs("ip9"), Some(60));

        clock.advance(Duration::from_secs(60));
        assert!(!coordinator.is_blocked("ip9"));
        assert_eq!(coordinator.state("ip9"), IdentityState::Clean);
        assert_eq!(coordinator.violation_count("ip9"), 0);
    }

    #[test]
    fn test_violations_while_blocked_do_not_reopen() {
        let (coordinator, _clock, _) = coordinator(2);
        coordinator.record_violation("a", "x");
        coordinator.record_violation("a", "x");
        let outcome = coordinator.record_violation("a", "x");
        assert!(!outcome.newly_blocked);
        assert_eq!(outcome.state, IdentityState::AutoBlocked);
        assert_eq!(coordinator.list_incidents(false).len(), 1);
    }

    #[test]
    fn test_counter_restarts_after_expiry() {
        let (coordinator, clock, _) = coordinator(2);
        coordinator.record_violation("a", "x");
        coordinator.record_violation("a", "x");
        clock.advance(Duration::from_secs(61 * 60));

        let outcome = coordinator.record_violation("a", "x");
        assert_eq!(outcome.violations, 1);
        assert_eq!(outcome.state, IdentityState::Flagged);
    }

    #[test]
    fn test_identities_do_not_interfere() {
        let (coordinator, _clock, _) = coordinator(1);
        coordinator.record_violation("a", "x");
        assert!(coordinator.is_blocked("a"));
        assert!(!coordinator.is_blocked("b"));
        assert_eq!(coordinator.state("b"), IdentityState::Clean);
    }

    #[test]
    fn test_manual_unblock() {
        let (coordinator, _clock, _) = coordinator(1);
        assert!(matches!(coordinator.unblock("a"), Err(ShieldError::NotFound { .. })));

        coordinator.record_violation("a", "x");
        coordinator.unblock("a").unwrap();
        assert!(!coordinator.is_blocked("a"));
        assert_eq!(coordinator.state("a"), IdentityState::Clean);
    }

    #[test]
    fn test_manual_block_keeps_longer_expiry() {
        let (coordinator, _clock, _) = coordinator(5);
        let long = coordinator.block("a", Duration::from_secs(3600), "first");
        let short = coordinator.block("a", Duration::from_secs(60), "second");
        assert_eq!(short.expires_at, long.expires_at);
        assert_eq!(coordinator.block_entry("a").unwrap().reason, "second");
    }

    #[test]
    fn test_huge_block_duration_saturates() {
        let (coordinator, clock, _) = coordinator(5);
        let entry = coordinator.block("x", Duration::from_secs(u64::MAX), "huge");
        assert_eq!(entry.expires_at, u64::MAX);
        assert!(coordinator.is_blocked("x"));

        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert!(coordinator.block_remaining_secs("x").is_some());
    }

    #[test]
    fn test_incident_lifecycle() {
        let (coordinator, _clock, _) = coordinator(5);
        let mut details = BTreeMap::new();
        details.insert("device_id".to_string(), "dev-1".to_string());
        let incident = coordinator.create_incident("10.0.0.1", IncidentKind::CredentialCompromise, details);
        assert_eq!(incident.severity, Severity::Critical);
        assert!(!incident.resolved);

        let resolved = coordinator.resolve_incident(&incident.id).unwrap();
        assert!(resolved.resolved);
        assert!(resolved.resolved_at.is_some());

        assert!(matches!(
            coordinator.resolve_incident(&incident.id),
            Err(ShieldError::AlreadyInTerminalState { .. })
        ));
        assert!(matches!(
            coordinator.resolve_incident("missing"),
            Err(ShieldError::NotFound { .. })
        ));
        assert!(coordinator.list_incidents(true).is_empty());
    }

    #[test]
    fn test_incident_store_is_bounded() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = Arc::new(SessionRegistry::new(SessionConfig::default(), clock.clone()).unwrap());
        let config = IncidentConfig {
            max_incidents: 2,
            ..Default::default()
        };
        let coordinator = IncidentCoordinator::new(config, clock.clone(), sessions).unwrap();

        let first = coordinator.create_incident("a", IncidentKind::Manual, BTreeMap::new());
        clock.advance(Duration::from_secs(1));
        let second = coordinator.create_incident("b", IncidentKind::Manual, BTreeMap::new());
        coordinator.resolve_incident(&second.id).unwrap();
        clock.advance(Duration::from_secs(1));
        coordinator.create_incident("c", IncidentKind::Manual, BTreeMap::new());

        // The resolved incident goes first even though it is newer.
        assert!(coordinator.get_incident(&first.id).is_ok());
        assert!(coordinator.get_incident(&second.id).is_err());
    }

    #[test]
    fn test_cleanup_forgets_quiet_identities() {
        let (coordinator, clock, _) = coordinator(5);
        coordinator.record_violation("quiet", "x");
        coordinator.block("blocked", Duration::from_secs(48 * 3600), "manual");
        clock.advance(Duration::from_secs(25 * 3600));

        assert_eq!(coordinator.cleanup_expired(), 1);
        assert_eq!(coordinator.violation_count("quiet"), 0);
        assert!(coordinator.is_blocked("blocked"));
    }

    #[test]
    fn test_journal_records_escalation() {
        let (coordinator, _clock, _) = coordinator(1);
        coordinator.record_violation("a", "burst");
        let kinds: Vec<_> = coordinator.journal().recent(10).into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&"violation".to_string()));
        assert!(kinds.contains(&"incident".to_string()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = Arc::new(SessionRegistry::new(SessionConfig::default(), clock.clone()).unwrap());
        let config = IncidentConfig {
            auto_block_threshold: 0,
            ..Default::default()
        };
        assert!(IncidentCoordinator::new(config, clock, sessions).is_err());
    }
}

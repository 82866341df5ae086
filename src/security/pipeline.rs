//! The request decision pipeline.
//!
//! `DefenseStack` owns the four components and runs them in a fixed order
//! for each inbound request. It is an explicit service object; nothing here
//! is global.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::validation::ValidationError;
use crate::config::ShieldConfig;
use crate::error::{ShieldError, ShieldResult};
use crate::observability::metrics;
use crate::security::abuse::{AbuseDetector, RecommendedAction};
use crate::security::incident::alert::{AlertSink, TracingAlertSink, WebhookAlertSink};
use crate::security::incident::{IdentityState, IncidentCoordinator, IncidentStats};
use crate::security::rate_limit::{RateLimitDecision, RateLimiter};
use crate::security::session::{SessionCleanup, SessionRegistry, SessionStats};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// What the pipeline needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Rate limiting and abuse key (device id, api key hash or ip).
    pub identity: String,
    pub source_ip: String,
    /// Payload text inspected by the abuse heuristics.
    pub message: String,
    /// Also charge `source_ip` against the rate limiter. Set when the
    /// identity came from client-controlled headers.
    pub limit_source: bool,
}

impl InboundRequest {
    pub fn new(identity: impl Into<String>, source_ip: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            source_ip: source_ip.into(),
            message: message.into(),
            limit_source: false,
        }
    }

    pub fn with_source_limit(mut self) -> Self {
        self.limit_source = true;
        self
    }
}

/// Outcome of inspecting a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allowed {
        remaining: u32,
        limit: u32,
        /// The request passed but the identity looks suspicious.
        flagged: bool,
    },
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
    },
    Blocked {
        retry_after_secs: u64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::RateLimited { retry_after_secs, .. } | Decision::Blocked { retry_after_secs } => {
                Some(*retry_after_secs)
            }
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            Decision::Allowed { flagged: false, .. } => "allowed",
            Decision::Allowed { flagged: true, .. } => "flagged",
            Decision::RateLimited { .. } => "rate_limited",
            Decision::Blocked { .. } => "blocked",
        }
    }
}

/// Result of one background sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub rate_limiter: usize,
    pub abuse_detector: usize,
    pub incident_identities: usize,
    pub sessions: SessionCleanup,
}

/// Point-in-time counts across components.
#[derive(Debug, Clone, Serialize)]
pub struct StackStatus {
    pub rate_limited_identities: usize,
    pub abuse_tracked_identities: usize,
    pub active_device_blocks: usize,
    pub incidents: IncidentStats,
    pub sessions: SessionStats,
}

/// The four defense components wired together.
#[derive(Debug, Clone)]
pub struct DefenseStack {
    limiter: Arc<RateLimiter>,
    detector: Arc<AbuseDetector>,
    coordinator: Arc<IncidentCoordinator>,
    sessions: Arc<SessionRegistry>,
}

impl DefenseStack {
    pub fn new(
        limiter: Arc<RateLimiter>,
        detector: Arc<AbuseDetector>,
        coordinator: Arc<IncidentCoordinator>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            limiter,
            detector,
            coordinator,
            sessions,
        }
    }

    /// Build every component from configuration, validating each section.
    pub fn from_config(config: &ShieldConfig, clock: SharedClock) -> ShieldResult<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone())?);
        let detector = Arc::new(AbuseDetector::new(config.abuse.clone(), clock.clone())?);
        let sessions = Arc::new(SessionRegistry::new(config.session.clone(), clock.clone())?);

        let alerts: Arc<dyn AlertSink> = match &config.incident.alert_webhook_url {
            Some(url) => Arc::new(WebhookAlertSink::new(url.clone(), WEBHOOK_TIMEOUT).map_err(|e| {
                ShieldError::InvalidConfig(vec![ValidationError::new(
                    "incident.alert_webhook_url",
                    e.to_string(),
                )])
            })?),
            None => Arc::new(TracingAlertSink),
        };

        let coordinator = Arc::new(
            IncidentCoordinator::new(config.incident.clone(), clock, sessions.clone())?
                .with_device_blocker(detector.clone())
                .with_alert_sink(alerts),
        );

        Ok(Self::new(limiter, detector, coordinator, sessions))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn detector(&self) -> &Arc<AbuseDetector> {
        &self.detector
    }

    pub fn coordinator(&self) -> &Arc<IncidentCoordinator> {
        &self.coordinator
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Decide whether a request may proceed.
    pub fn inspect(&self, request: &InboundRequest) -> Decision {
        let decision = self.decide(request);
        metrics::record_decision(decision.outcome());
        if !decision.is_allowed() {
            tracing::debug!(
                identity = %request.identity,
                source_ip = %request.source_ip,
                outcome = decision.outcome(),
                "Request denied"
            );
        }
        decision
    }

    fn decide(&self, request: &InboundRequest) -> Decision {
        let identity = request.identity.as_str();

        if let Some(retry_after_secs) = self.blocked_for(request) {
            return Decision::Blocked { retry_after_secs };
        }

        // Source first so rejected requests never create per-identity state.
        let mut source_remaining = None;
        if request.limit_source && !request.source_ip.is_empty() && request.source_ip != identity {
            let source = self.limiter.check(&request.source_ip);
            if !source.allowed {
                return self.rate_limited(&request.source_ip, &source);
            }
            source_remaining = Some(source.remaining);
        }

        let mut rate = self.limiter.check(identity);
        if !rate.allowed {
            return self.rate_limited(identity, &rate);
        }
        if let Some(remaining) = source_remaining {
            rate.remaining = rate.remaining.min(remaining);
        }

        let verdict = self
            .detector
            .check_request(identity, &request.message, &request.source_ip);
        let Some(pattern) = verdict.pattern else {
            return Decision::Allowed {
                remaining: rate.remaining,
                limit: rate.limit,
                flagged: false,
            };
        };

        let outcome = self.coordinator.record_violation(identity, pattern.as_str());
        if outcome.state == IdentityState::AutoBlocked {
            if let Some(retry_after_secs) = self.coordinator.block_remaining_secs(identity) {
                return Decision::Blocked { retry_after_secs };
            }
        }

        if self.detector.recommended_action(identity) == RecommendedAction::TemporaryBlock {
            self.detector
                .block_device_default(identity, &format!("repeated {}", pattern.as_str()));
            if let Some(retry_after_secs) = self.detector.device_block_remaining_secs(identity) {
                return Decision::Blocked { retry_after_secs };
            }
        }

        Decision::Allowed {
            remaining: rate.remaining,
            limit: rate.limit,
            flagged: true,
        }
    }

    fn rate_limited(&self, key: &str, rate: &RateLimitDecision) -> Decision {
        if rate.escalated {
            let outcome = self.coordinator.record_violation(key, "rate_limit");
            if outcome.state == IdentityState::AutoBlocked {
                if let Some(retry_after_secs) = self.coordinator.block_remaining_secs(key) {
                    return Decision::Blocked { retry_after_secs };
                }
            }
        }
        Decision::RateLimited {
            retry_after_secs: rate.retry_after_secs.unwrap_or(1),
            limit: rate.limit,
        }
    }

    /// Longest remaining block covering the request's identity or source.
    fn blocked_for(&self, request: &InboundRequest) -> Option<u64> {
        let identity = request.identity.as_str();
        let mut remaining = [
            self.coordinator.block_remaining_secs(identity),
            self.detector.device_block_remaining_secs(identity),
        ]
        .into_iter()
        .flatten()
        .max();

        if !request.source_ip.is_empty() && request.source_ip != request.identity {
            remaining = remaining.max(self.coordinator.block_remaining_secs(&request.source_ip));
        }
        remaining
    }

    /// Bound memory in every component. Never required for correctness.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            rate_limiter: self.limiter.cleanup_idle(),
            abuse_detector: self.detector.cleanup_idle(),
            incident_identities: self.coordinator.cleanup_expired(),
            sessions: self.sessions.cleanup_expired(),
        };
        tracing::debug!(
            rate_limiter = report.rate_limiter,
            abuse_detector = report.abuse_detector,
            incident_identities = report.incident_identities,
            sessions_reaped = report.sessions.sessions_reaped,
            blacklist_removed = report.sessions.blacklist_removed,
            "Sweep complete"
        );
        report
    }

    pub fn status(&self) -> StackStatus {
        StackStatus {
            rate_limited_identities: self.limiter.tracked_identities(),
            abuse_tracked_identities: self.detector.tracked_identities(),
            active_device_blocks: self.detector.active_device_blocks(),
            incidents: self.coordinator.stats(),
            sessions: self.sessions.stats(),
        }
    }
}

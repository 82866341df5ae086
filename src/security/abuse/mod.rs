//! Heuristic abuse detection over per-identity request history.
//!
//! # Data Flow
//! ```text
//! check_request(identity, message, ip)
//!     → append to bounded history
//!     → heuristics.rs cascade (burst → volume → repetition → bot timing)
//!     → keyword scan (independent, cumulative)
//!     → DeviceStatus updated, AnomalyVerdict returned
//! ```
//!
//! # Design Decisions
//! - History lives only in memory and is never persisted
//! - First positive heuristic wins; new heuristics are appended, not nested
//! - Device blocks expire on their own and are evaluated lazily

pub mod heuristics;
pub mod similarity;

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::clock::{deadline, SharedClock, MILLIS_PER_MINUTE, MILLIS_PER_SEC};
use crate::config::AbuseConfig;
use crate::error::{ShieldError, ShieldResult};
use crate::observability::metrics;
use crate::security::eviction;

pub use heuristics::{AbusePattern, Detection, Heuristic, RequestRecord};

/// Abuse bookkeeping for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub identity: String,
    pub flagged: bool,
    /// Only grows until [`AbuseDetector::reset_device`].
    pub abuse_count: u32,
    pub keyword_hits: u32,
    pub last_activity: u64,
}

/// Classification of a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    pub pattern: Option<AbusePattern>,
    pub confidence: f64,
    pub details: String,
}

impl AnomalyVerdict {
    fn clean() -> Self {
        Self {
            is_anomaly: false,
            pattern: None,
            confidence: 0.0,
            details: String::new(),
        }
    }

    fn from_detection(detection: Detection) -> Self {
        Self {
            is_anomaly: true,
            pattern: Some(detection.pattern),
            confidence: detection.confidence,
            details: detection.details,
        }
    }
}

/// What the caller should do about an identity, by abuse count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    None,
    LogOnly,
    Alert,
    TemporaryBlock,
}

#[derive(Debug)]
struct IdentityHistory {
    records: VecDeque<RequestRecord>,
    status: DeviceStatus,
}

impl IdentityHistory {
    fn new(identity: &str, now: u64) -> Self {
        Self {
            records: VecDeque::new(),
            status: DeviceStatus {
                identity: identity.to_string(),
                flagged: false,
                abuse_count: 0,
                keyword_hits: 0,
                last_activity: now,
            },
        }
    }
}

/// An active device block.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceBlock {
    pub identity: String,
    pub reason: String,
    pub blocked_at: u64,
    pub expires_at: u64,
}

/// Per-identity abuse classifier.
#[derive(Debug)]
pub struct AbuseDetector {
    config: AbuseConfig,
    clock: SharedClock,
    heuristics: Vec<Box<dyn Heuristic>>,
    keywords: Vec<String>,
    histories: DashMap<String, IdentityHistory>,
    device_blocks: DashMap<String, DeviceBlock>,
}

impl AbuseDetector {
    pub fn new(config: AbuseConfig, clock: SharedClock) -> ShieldResult<Self> {
        config.validate().map_err(ShieldError::InvalidConfig)?;
        let heuristics = heuristics::default_cascade(&config);
        let keywords = config.keywords.iter().map(|k| k.to_lowercase()).collect();
        Ok(Self {
            config,
            clock,
            heuristics,
            keywords,
            histories: DashMap::new(),
            device_blocks: DashMap::new(),
        })
    }

    /// Append a heuristic after the built-in ones.
    pub fn with_heuristic(mut self, heuristic: Box<dyn Heuristic>) -> Self {
        self.heuristics.push(heuristic);
        self
    }

    pub fn config(&self) -> &AbuseConfig {
        &self.config
    }

    /// Record a request and classify the identity's recent behavior.
    pub fn check_request(&self, identity: &str, message: &str, source_ip: &str) -> AnomalyVerdict {
        let now = self.clock.now_millis();
        eviction::make_room(
            &self.histories,
            identity,
            self.config.max_tracked_identities,
            |h| h.status.last_activity,
        );

        let mut entry = self
            .histories
            .entry(identity.to_string())
            .or_insert_with(|| IdentityHistory::new(identity, now));
        let state = entry.value_mut();

        state.records.push_back(RequestRecord {
            timestamp: now,
            message: message.to_string(),
            source_ip: source_ip.to_string(),
        });
        while state.records.len() > self.config.history_size {
            state.records.pop_front();
        }
        state.status.last_activity = now;

        let detection = self
            .heuristics
            .iter()
            .find_map(|h| h.evaluate(&state.records, now));

        let hits = self.keyword_hits(message);
        if hits > 0 {
            state.status.abuse_count += hits;
            state.status.keyword_hits += hits;
            if state.status.keyword_hits >= self.config.keyword_flag_threshold {
                state.status.flagged = true;
            }
        }

        let verdict = match detection {
            Some(detection) => {
                state.status.flagged = true;
                state.status.abuse_count += 1;
                AnomalyVerdict::from_detection(detection)
            }
            None if hits > 0
                && state.status.keyword_hits >= self.config.keyword_flag_threshold =>
            {
                AnomalyVerdict::from_detection(Detection {
                    pattern: AbusePattern::SuspiciousContent,
                    confidence: 1.0,
                    details: format!("{} watched phrase hits", state.status.keyword_hits),
                })
            }
            None => AnomalyVerdict::clean(),
        };

        if let Some(pattern) = verdict.pattern {
            tracing::warn!(
                identity = %identity,
                source_ip = %source_ip,
                pattern = pattern.as_str(),
                confidence = verdict.confidence,
                abuse_count = state.status.abuse_count,
                details = %verdict.details,
                "Anomalous request pattern"
            );
            metrics::record_anomaly(pattern.as_str());
        }

        verdict
    }

    fn keyword_hits(&self, message: &str) -> u32 {
        if self.keywords.is_empty() || message.trim().is_empty() {
            return 0;
        }
        let lowered = message.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| lowered.contains(k.as_str()))
            .count() as u32
    }

    pub fn device_status(&self, identity: &str) -> Option<DeviceStatus> {
        self.histories.get(identity).map(|h| h.status.clone())
    }

    pub fn abuse_count(&self, identity: &str) -> u32 {
        self.histories
            .get(identity)
            .map(|h| h.status.abuse_count)
            .unwrap_or(0)
    }

    /// Map the identity's abuse count to a response.
    pub fn recommended_action(&self, identity: &str) -> RecommendedAction {
        let count = self.abuse_count(identity);
        if count >= self.config.block_threshold {
            RecommendedAction::TemporaryBlock
        } else if count >= self.config.alert_threshold {
            RecommendedAction::Alert
        } else if count >= 1 {
            RecommendedAction::LogOnly
        } else {
            RecommendedAction::None
        }
    }

    /// Clear abuse counters, flag and history.
    pub fn reset_device(&self, identity: &str) -> ShieldResult<()> {
        let mut state = self
            .histories
            .get_mut(identity)
            .ok_or_else(|| ShieldError::not_found("device", identity))?;
        let now = self.clock.now_millis();
        *state = IdentityHistory::new(identity, now);
        tracing::info!(identity = %identity, "Device abuse state reset");
        Ok(())
    }

    /// Block for the configured default duration.
    pub fn block_device_default(&self, identity: &str, reason: &str) -> DeviceBlock {
        let duration = Duration::from_millis(self.config.device_block_minutes.saturating_mul(MILLIS_PER_MINUTE));
        self.block_device(identity, duration, reason)
    }

    pub fn block_device(&self, identity: &str, duration: Duration, reason: &str) -> DeviceBlock {
        let now = self.clock.now_millis();
        let block = DeviceBlock {
            identity: identity.to_string(),
            reason: reason.to_string(),
            blocked_at: now,
            expires_at: deadline(now, duration),
        };
        self.device_blocks.insert(identity.to_string(), block.clone());
        tracing::warn!(
            identity = %identity,
            reason = %reason,
            duration_secs = duration.as_secs(),
            "Device blocked"
        );
        block
    }

    /// True while an unexpired block exists; expired blocks are evicted here.
    pub fn is_device_blocked(&self, identity: &str) -> bool {
        self.device_block_remaining_secs(identity).is_some()
    }

    pub fn device_block_remaining_secs(&self, identity: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let expires_at = self.device_blocks.get(identity).map(|b| b.expires_at)?;
        if expires_at > now {
            Some((expires_at - now).div_ceil(MILLIS_PER_SEC))
        } else {
            self.device_blocks.remove_if(identity, |_, b| b.expires_at <= now);
            None
        }
    }

    pub fn unblock_device(&self, identity: &str) -> ShieldResult<()> {
        if !self.is_device_blocked(identity) {
            return Err(ShieldError::not_found("device block", identity));
        }
        self.device_blocks.remove(identity);
        tracing::info!(identity = %identity, "Device unblocked");
        Ok(())
    }

    /// Drop idle histories and expired device blocks.
    pub fn cleanup_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let removed = eviction::sweep_idle(
            &self.histories,
            now,
            self.config.idle_ttl_secs * MILLIS_PER_SEC,
            |h| h.status.last_activity,
        );
        self.device_blocks.retain(|_, b| b.expires_at > now);
        metrics::record_tracked("abuse_detector", self.histories.len());
        removed
    }

    pub fn tracked_identities(&self) -> usize {
        self.histories.len()
    }

    pub fn active_device_blocks(&self) -> usize {
        let now = self.clock.now_millis();
        self.device_blocks
            .iter()
            .filter(|b| b.expires_at > now)
            .count()
    }
}

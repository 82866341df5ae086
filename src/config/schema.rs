//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the shield.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ShieldConfig {
    /// Listener configuration (bind address, body limits).
    pub listener: ListenerConfig,

    /// Dual-window rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Heuristic abuse detection.
    pub abuse: AbuseConfig,

    /// Violation escalation and remediation.
    pub incident: IncidentConfig,

    /// Session lifetime.
    pub session: SessionConfig,

    /// Background memory-bounding sweeps.
    pub sweeper: SweeperConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum inspected payload size in bytes.
    pub max_body_size: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Key requests by `X-Device-Id` / `X-Api-Key` alone. Only enable behind
    /// a proxy that sets or strips these headers; otherwise the peer address
    /// is rate limited alongside the header identity.
    pub trust_identity_headers: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_size: 256 * 1024,
            request_timeout_secs: 30,
            trust_identity_headers: false,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Capacity of the per-minute bucket.
    pub requests_per_minute: u32,

    /// Capacity of the per-hour bucket.
    pub requests_per_hour: u32,

    /// Consecutive rejections that count as one abuse strike.
    pub escalation_threshold: u32,

    /// Identities idle longer than this are dropped by the sweeper.
    pub idle_ttl_secs: u64,

    /// Upper bound on tracked identities.
    pub max_tracked_identities: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            requests_per_hour: 1000,
            escalation_threshold: 3,
            idle_ttl_secs: 2 * 60 * 60,
            max_tracked_identities: 100_000,
        }
    }
}

/// Abuse detection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Requests kept per identity for classification.
    pub history_size: usize,

    pub burst_threshold: usize,
    pub burst_window_secs: u64,

    pub volume_threshold: usize,
    pub volume_window_secs: u64,

    /// Number of most recent messages compared for repetition.
    pub repetition_window: usize,
    /// Exact duplicates (or similar pairs) needed to flag repetition.
    pub repetition_threshold: usize,
    /// Normalized similarity at which two messages count as a similar pair.
    pub similarity_threshold: f64,

    /// Samples required before timing is analyzed at all.
    pub bot_min_samples: usize,
    /// Inter-arrival intervals required for the variance check.
    pub bot_variance_samples: usize,
    /// Interval variance (seconds squared) below which timing looks scripted.
    pub bot_variance_threshold: f64,
    /// Typing speed above which a message looks machine-generated.
    pub max_chars_per_sec: f64,

    /// Watched phrases (matched case-insensitively).
    pub keywords: Vec<String>,
    /// Cumulative keyword hits before the identity is reported.
    pub keyword_flag_threshold: u32,

    /// Abuse count at which an alert is recommended.
    pub alert_threshold: u32,
    /// Abuse count at which a temporary block is recommended.
    pub block_threshold: u32,
    /// Duration of a device block.
    pub device_block_minutes: u64,

    pub idle_ttl_secs: u64,
    pub max_tracked_identities: usize,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            burst_threshold: 8,
            burst_window_secs: 10,
            volume_threshold: 20,
            volume_window_secs: 60,
            repetition_window: 10,
            repetition_threshold: 3,
            similarity_threshold: 0.8,
            bot_min_samples: 5,
            bot_variance_samples: 10,
            bot_variance_threshold: 0.1,
            max_chars_per_sec: 50.0,
            keywords: default_keywords(),
            keyword_flag_threshold: 3,
            alert_threshold: 5,
            block_threshold: 10,
            device_block_minutes: 60,
            idle_ttl_secs: 60 * 60,
            max_tracked_identities: 100_000,
        }
    }
}

fn default_keywords() -> Vec<String> {
    [
        "ignore previous instructions",
        "ignore all previous instructions",
        "system prompt",
        "jailbreak",
        "developer mode",
        "disregard your rules",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Incident escalation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Violations before an identity is blocked automatically.
    pub auto_block_threshold: u32,

    /// Duration of automatic and BLOCK_IP blocks.
    pub block_duration_minutes: u64,

    /// Unblocked identities with no violation for this long are forgotten.
    pub violation_ttl_minutes: u64,

    /// Half-width of the log window captured by SNAPSHOT_LOGS.
    pub snapshot_window_secs: u64,

    /// Upper bound on stored incidents; oldest resolved ones go first.
    pub max_incidents: usize,

    /// Security events kept in the in-memory journal.
    pub journal_capacity: usize,

    /// Optional webhook receiving ALERT notifications.
    pub alert_webhook_url: Option<String>,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            auto_block_threshold: 5,
            block_duration_minutes: 60,
            violation_ttl_minutes: 24 * 60,
            snapshot_window_secs: 300,
            max_incidents: 10_000,
            journal_capacity: 5_000,
            alert_webhook_url: None,
        }
    }
}

/// Session lifetime configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity after which a session is no longer valid.
    pub timeout_minutes: u64,

    /// Natural lifetime of an access token; bounds how long blacklist entries are kept.
    pub token_ttl_minutes: u64,

    /// How long invalid sessions are kept before being reaped.
    pub retention_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 60,
            token_ttl_minutes: 24 * 60,
            retention_minutes: 24 * 60,
        }
    }
}

/// Background sweeper configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Default admin key. Never accepted as a credential.
pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // WARNING: This is a placeholder! Change this in production.
            api_key: PLACEHOLDER_API_KEY.to_string(),
        }
    }
}

impl AdminConfig {
    /// False for an empty or placeholder key.
    pub fn has_usable_key(&self) -> bool {
        let key = self.api_key.trim();
        !key.is_empty() && key != PLACEHOLDER_API_KEY
    }

    /// Turn the admin routes off when no real key is configured.
    /// Returns true if they were on.
    pub fn disable_if_unkeyed(&mut self) -> bool {
        let disabled = self.enabled && !self.has_usable_key();
        if disabled {
            self.enabled = false;
        }
        disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_surface() {
        let config = ShieldConfig::default();
        assert_eq!(config.rate_limit.requests_per_minute, 60);
        assert_eq!(config.rate_limit.requests_per_hour, 1000);
        assert_eq!(config.abuse.burst_threshold, 8);
        assert_eq!(config.abuse.volume_threshold, 20);
        assert_eq!(config.abuse.repetition_threshold, 3);
        assert_eq!(config.incident.auto_block_threshold, 5);
        assert_eq!(config.incident.block_duration_minutes, 60);
        assert_eq!(config.session.timeout_minutes, 60);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ShieldConfig = toml::from_str(
            r#"
            [rate_limit]
            requests_per_minute = 2

            [session]
            timeout_minutes = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.requests_per_minute, 2);
        assert_eq!(config.rate_limit.requests_per_hour, 1000);
        assert_eq!(config.session.timeout_minutes, 15);
        assert_eq!(config.abuse.history_size, 100);
    }

    #[test]
    fn test_placeholder_admin_key_is_not_usable() {
        let mut admin = AdminConfig::default();
        assert!(!admin.has_usable_key());
        admin.api_key = "  ".into();
        assert!(!admin.has_usable_key());
        admin.api_key = "s3cret".into();
        assert!(admin.has_usable_key());
        assert!(!ListenerConfig::default().trust_identity_headers);
    }

    #[test]
    fn test_unkeyed_admin_is_disabled() {
        let mut admin = AdminConfig::default();
        assert!(admin.disable_if_unkeyed());
        assert!(!admin.enabled);
        assert!(!admin.disable_if_unkeyed());

        let mut admin = AdminConfig {
            enabled: true,
            api_key: "s3cret".into(),
        };
        assert!(!admin.disable_if_unkeyed());
        assert!(admin.enabled);
    }
}

//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, ratios within bounds)
//! - Check addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ShieldConfig → Result<(), Vec<ValidationError>>
//! - Each component also validates its own section when constructed

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use crate::config::schema::{
    AbuseConfig, IncidentConfig, RateLimitConfig, SessionConfig, ShieldConfig,
};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

fn positive<T: PartialOrd + Default>(errors: &mut Vec<ValidationError>, field: &str, value: T) {
    if value <= T::default() {
        errors.push(ValidationError::new(field, "must be greater than 0"));
    }
}

/// Longest block any config or admin call may request.
pub const MAX_BLOCK_SECS: u64 = 366 * 24 * 60 * 60;

fn at_most(errors: &mut Vec<ValidationError>, field: &str, value: u64, max: u64) {
    if value > max {
        errors.push(ValidationError::new(field, format!("must be at most {}", max)));
    }
}

fn unit_interval(errors: &mut Vec<ValidationError>, field: &str, value: f64) {
    if !(value > 0.0 && value <= 1.0) {
        errors.push(ValidationError::new(field, "must be within (0, 1]"));
    }
}

fn finish(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        positive(&mut errors, "rate_limit.requests_per_minute", self.requests_per_minute);
        positive(&mut errors, "rate_limit.requests_per_hour", self.requests_per_hour);
        positive(&mut errors, "rate_limit.escalation_threshold", self.escalation_threshold);
        positive(&mut errors, "rate_limit.max_tracked_identities", self.max_tracked_identities);
        finish(errors)
    }
}

impl AbuseConfig {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        positive(&mut errors, "abuse.history_size", self.history_size);
        positive(&mut errors, "abuse.burst_threshold", self.burst_threshold);
        positive(&mut errors, "abuse.burst_window_secs", self.burst_window_secs);
        positive(&mut errors, "abuse.volume_threshold", self.volume_threshold);
        positive(&mut errors, "abuse.volume_window_secs", self.volume_window_secs);
        positive(&mut errors, "abuse.repetition_window", self.repetition_window);
        positive(&mut errors, "abuse.repetition_threshold", self.repetition_threshold);
        unit_interval(&mut errors, "abuse.similarity_threshold", self.similarity_threshold);
        positive(&mut errors, "abuse.bot_min_samples", self.bot_min_samples);
        positive(&mut errors, "abuse.bot_variance_samples", self.bot_variance_samples);
        positive(&mut errors, "abuse.bot_variance_threshold", self.bot_variance_threshold);
        positive(&mut errors, "abuse.max_chars_per_sec", self.max_chars_per_sec);
        positive(&mut errors, "abuse.keyword_flag_threshold", self.keyword_flag_threshold);
        positive(&mut errors, "abuse.device_block_minutes", self.device_block_minutes);
        at_most(&mut errors, "abuse.device_block_minutes", self.device_block_minutes, MAX_BLOCK_SECS / 60);
        positive(&mut errors, "abuse.max_tracked_identities", self.max_tracked_identities);

        if self.history_size < self.repetition_window {
            errors.push(ValidationError::new(
                "abuse.history_size",
                "must be at least abuse.repetition_window",
            ));
        }
        if self.alert_threshold > self.block_threshold {
            errors.push(ValidationError::new(
                "abuse.alert_threshold",
                "must not exceed abuse.block_threshold",
            ));
        }
        if self.keywords.iter().any(|k| k.trim().is_empty()) {
            errors.push(ValidationError::new("abuse.keywords", "must not contain empty phrases"));
        }
        finish(errors)
    }
}

impl IncidentConfig {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        positive(&mut errors, "incident.auto_block_threshold", self.auto_block_threshold);
        positive(&mut errors, "incident.block_duration_minutes", self.block_duration_minutes);
        at_most(&mut errors, "incident.block_duration_minutes", self.block_duration_minutes, MAX_BLOCK_SECS / 60);
        positive(&mut errors, "incident.violation_ttl_minutes", self.violation_ttl_minutes);
        positive(&mut errors, "incident.max_incidents", self.max_incidents);
        positive(&mut errors, "incident.journal_capacity", self.journal_capacity);
        if let Some(url) = &self.alert_webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ValidationError::new(
                    "incident.alert_webhook_url",
                    "must be an http(s) URL",
                ));
            }
        }
        finish(errors)
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        positive(&mut errors, "session.timeout_minutes", self.timeout_minutes);
        positive(&mut errors, "session.token_ttl_minutes", self.token_ttl_minutes);
        finish(errors)
    }
}

/// Validate the whole configuration, collecting every error.
pub fn validate_config(config: &ShieldConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for section in [
        config.rate_limit.validate(),
        config.abuse.validate(),
        config.incident.validate(),
        config.session.validate(),
    ] {
        if let Err(mut section_errors) = section {
            errors.append(&mut section_errors);
        }
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            "must be a socket address",
        ));
    }
    positive(&mut errors, "listener.max_body_size", config.listener.max_body_size);
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }
    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must not be empty"));
    }
    if config.sweeper.enabled {
        positive(&mut errors, "sweeper.interval_secs", config.sweeper.interval_secs);
    }

    finish(errors)
}

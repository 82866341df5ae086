//! Metrics collection and exposition.
//!
//! # Metrics
//! - `shield_rate_limited_total` (counter): rejections by window
//! - `shield_anomalies_total` (counter): classifier positives by pattern
//! - `shield_violations_total` (counter): recorded violations by kind
//! - `shield_auto_blocks_total` (counter): identities blocked automatically
//! - `shield_incidents_total` (counter): incidents opened by kind
//! - `shield_response_actions_total` (counter): remediation by action, outcome
//! - `shield_session_events_total` (counter): session lifecycle events
//! - `shield_tracked_identities` (gauge): map sizes by component
//! - `shield_decisions_total` (counter): pipeline decisions by outcome

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_rate_limited(window: &'static str) {
    metrics::counter!("shield_rate_limited_total", "window" => window).increment(1);
}

pub fn record_anomaly(pattern: &'static str) {
    metrics::counter!("shield_anomalies_total", "pattern" => pattern).increment(1);
}

/// Violation kinds with their own label; everything else is `other`.
const VIOLATION_KINDS: &[&str] = &[
    "rate_limit",
    "burst",
    "volume",
    "repetitive",
    "bot_timing",
    "suspicious_content",
    "manual",
];

fn violation_label(kind: &str) -> &'static str {
    VIOLATION_KINDS
        .iter()
        .copied()
        .find(|known| *known == kind)
        .unwrap_or("other")
}

pub fn record_violation(kind: &str) {
    metrics::counter!("shield_violations_total", "kind" => violation_label(kind)).increment(1);
}

pub fn record_auto_block() {
    metrics::counter!("shield_auto_blocks_total").increment(1);
}

pub fn record_incident(kind: &'static str) {
    metrics::counter!("shield_incidents_total", "kind" => kind).increment(1);
}

pub fn record_action(action: &'static str, executed: bool) {
    let outcome = if executed { "executed" } else { "failed" };
    metrics::counter!("shield_response_actions_total", "action" => action, "outcome" => outcome)
        .increment(1);
}

pub fn record_session_event(event: &'static str) {
    metrics::counter!("shield_session_events_total", "event" => event).increment(1);
}

pub fn record_tracked(component: &'static str, count: usize) {
    metrics::gauge!("shield_tracked_identities", "component" => component).set(count as f64);
}

pub fn record_decision(outcome: &'static str) {
    metrics::counter!("shield_decisions_total", "outcome" => outcome).increment(1);
}

//! Structured logging.
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Default directive set when `RUST_LOG` is absent.
pub fn default_filter(config: &ObservabilityConfig) -> String {
    format!(
        "admin_shield={level},shield_cli={level},tower_http={level}",
        level = config.log_level
    )
}

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_uses_configured_level() {
        let config = ObservabilityConfig {
            log_level: "warn".into(),
            ..Default::default()
        };
        let filter = default_filter(&config);
        assert!(filter.contains("admin_shield=warn"));
        assert!(EnvFilter::try_new(filter).is_ok());
    }
}

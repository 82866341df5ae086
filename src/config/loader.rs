//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ShieldConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Validation(Vec<ValidationError>),
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ShieldConfig, ConfigError> {
    let config: ShieldConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ShieldConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_invalid_values() {
        let err = parse_config("[incident]\nauto_block_threshold = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("incident.auto_block_threshold"));
    }

    #[test]
    fn test_empty_config_is_validated_defaults() {
        let mut config = parse_config("").unwrap();
        assert_eq!(config.rate_limit.requests_per_minute, 60);
        assert!(config.admin.disable_if_unkeyed());
    }

    #[test]
    fn test_parse_rejects_bad_toml() {
        let err = parse_config("[rate_limit\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("admin_shield_loader_test.toml");
        fs::write(&path, "[rate_limit]\nrequests_per_hour = 500\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.rate_limit.requests_per_hour, 500);

        fs::remove_file(&path).unwrap_or_default();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/admin-shield.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

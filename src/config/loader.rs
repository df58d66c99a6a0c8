//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::AggregatorConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AggregatorConfig, ConfigError> {
    let config: AggregatorConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AggregatorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Validate and write configuration to a TOML file.
///
/// The document is written to a sibling temp file first and renamed over the
/// target so a watching aggregator never reads a half-written file.
pub fn save_config(path: &Path, config: &AggregatorConfig) -> Result<(), ConfigError> {
    validate_config(config).map_err(ConfigError::Validation)?;
    let rendered = toml::to_string_pretty(config)?;

    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, rendered)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, TransportKind};

    #[test]
    fn test_parse_rejects_invalid_documents() {
        let err = parse_config(
            r#"
            [[backends]]
            id = ""
            transport = "http"
            endpoint = "http://localhost:1"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = parse_config("backends = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregator.toml");

        let mut config = AggregatorConfig::default();
        config.backends.push(BackendConfig {
            id: "search".into(),
            transport: TransportKind::Sse,
            endpoint: "http://127.0.0.1:7000/sse".into(),
            args: Vec::new(),
            env: Default::default(),
            weight: 3,
            handshake: true,
        });
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }
}

//! Configuration file loading and parsing.

use std::path::Path;

use anyhow::{Context, Result};

use super::model::AppConfig;
use crate::error::ConfigError;
use crate::validation::report::{format_brief_summary, format_report};
use crate::validation::validate_config;

/// Loads the configuration file from disk and parses it.
pub fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: AppConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(config)
}

/// Loads and fully validates the configuration file.
pub fn load_and_validate(path: &Path) -> Result<AppConfig> {
    let config = load_from_path(path).context("Failed to load configuration")?;

    let result = validate_config(&config);

    for issue in result.warnings() {
        tracing::warn!(
            path = %issue.path,
            message = %issue.message,
            suggestion = ?issue.suggestion,
            "Config validation warning"
        );
    }

    tracing::info!(path = %path.display(), "{}", format_brief_summary(&result));

    if !result.is_valid() {
        tracing::error!("{}", format_report(&result));
        anyhow::bail!(ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_partial_document_with_defaults() {
        let file = write_config(
            r#"
recovery:
  sweep_interval_seconds: 60
  critical_requires_approval: false
business_hours:
  default_timezone: Asia/Riyadh
  holidays: ["2026-09-23"]
"#,
        );

        let config = load_and_validate(file.path()).unwrap();
        assert_eq!(config.recovery.sweep_interval_seconds, 60);
        assert_eq!(config.recovery.batch_size, 50);
        assert!(!config.recovery.critical_requires_approval);
        assert_eq!(config.business_hours.default_timezone, "Asia/Riyadh");
        assert_eq!(config.business_hours.holidays.len(), 1);
    }

    #[test]
    fn invalid_config_is_rejected_with_count() {
        let file = write_config("recovery:\n  batch_size: 0\n  dispatch_concurrency: 0\n");

        let err = load_and_validate(file.path()).unwrap_err();
        match err.downcast_ref::<ConfigError>() {
            Some(ConfigError::ValidationFailed { error_count }) => assert_eq!(*error_count, 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let file = write_config("recovery: [unclosed");
        let err = load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_from_path(Path::new("/nonexistent/recovery.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }
}

//! Error types for rule loading and construction.

use std::path::PathBuf;

/// Errors that can occur during rule loading and management.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown detector type '{0}'")]
    UnknownDetector(String),

    #[error("unknown alerter '{0}'")]
    UnknownAlerter(String),

    #[error("unknown enhancement '{0}'")]
    UnknownEnhancement(String),

    #[error("alerter construction failed: {0}")]
    Alerter(#[from] searchlight_notify::AlertError),

    #[error("rule file not found: {0}")]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, RuleError>;

//! Engine error type.

use crate::backend::BackendError;

/// Errors surfaced by the rule execution core.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("rule error: {0}")]
    Rule(#[from] searchlight_rules::RuleError),

    #[error("config error: {0}")]
    Config(#[from] searchlight_core::ConfigError),

    #[error("time error: {0}")]
    Time(#[from] searchlight_core::time::TimeError),

    #[error("backend not ready: {0}")]
    Readiness(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

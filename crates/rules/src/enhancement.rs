//! Match enhancement contract.
//!
//! Enhancements run against each match before dispatch (or at match
//! time when `run_enhancements_first` is set). They may mutate the
//! match, drop it, or fail; failures are logged by the engine and do
//! not stop the batch.

use serde_json::{json, Value};

use searchlight_core::keys::lookup_es_key;
use searchlight_core::time::{pretty_ts, ts_to_dt};

use crate::error::RuleError;
use crate::schema::Rule;

/// Outcome signals an enhancement can raise.
#[derive(Debug, thiserror::Error)]
pub enum EnhancementError {
    /// Drop this match; it is skipped silently.
    #[error("match dropped")]
    DropMatch,

    /// The enhancement failed; logged, match kept.
    #[error("enhancement failed: {0}")]
    Failed(String),
}

/// A pluggable per-match transformation.
pub trait Enhancement: Send + Sync {
    fn process(&self, event: &mut Value) -> Result<(), EnhancementError>;
}

/// Adds a human-readable `pretty_timestamp` next to the event time.
pub struct TimeEnhancement {
    timestamp_field: String,
}

impl TimeEnhancement {
    pub fn new(timestamp_field: &str) -> Self {
        Self {
            timestamp_field: timestamp_field.to_string(),
        }
    }
}

impl Enhancement for TimeEnhancement {
    fn process(&self, event: &mut Value) -> Result<(), EnhancementError> {
        let pretty = lookup_es_key(event, &self.timestamp_field)
            .and_then(Value::as_str)
            .and_then(|s| ts_to_dt(s).ok())
            .map(|dt| pretty_ts(&dt));
        if let (Some(pretty), Some(obj)) = (pretty, event.as_object_mut()) {
            obj.insert("pretty_timestamp".to_string(), json!(pretty));
        }
        Ok(())
    }
}

/// Construct the enhancements named by `rule.match_enhancements`.
pub fn build_enhancements(rule: &Rule) -> Result<Vec<Box<dyn Enhancement>>, RuleError> {
    rule.match_enhancements
        .iter()
        .map(|name| match name.as_str() {
            "time" => Ok(Box::new(TimeEnhancement::new(&rule.timestamp_field))
                as Box<dyn Enhancement>),
            other => Err(RuleError::UnknownEnhancement(other.to_string())),
        })
        .collect()
}

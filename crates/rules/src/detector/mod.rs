//! Detector (rule-type) contract and built-in implementations.
//!
//! The engine core feeds windowed query results to a detector and
//! drains the matches it emits; it never interprets detection logic
//! itself. Detectors are synchronous and invoked only on their rule's
//! own tick.

mod any;
mod flatline;
mod frequency;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::RuleError;
use crate::schema::Rule;

pub use any::AnyDetector;
pub use flatline::FlatlineDetector;
pub use frequency::FrequencyDetector;

/// One bucket of a terms aggregation response.
#[derive(Debug, Clone)]
pub struct TermsBucket {
    pub key: Value,
    pub doc_count: u64,
}

/// A rule's match detector.
///
/// Exactly one of the `add_*` methods is called per query window,
/// matching the rule's query mode; the others default to no-ops so a
/// detector only implements the shapes it understands.
pub trait Detector: Send {
    /// Feed processed document hits (search mode).
    fn add_data(&mut self, hits: Vec<Value>);

    /// Feed `{window endtime: hit count}` results (count mode).
    fn add_count_data(&mut self, _counts: Vec<(DateTime<Utc>, u64)>) {}

    /// Feed `{window endtime: terms buckets}` results (terms mode).
    fn add_terms_data(&mut self, _terms: Vec<(DateTime<Utc>, Vec<TermsBucket>)>) {}

    /// Feed `{window endtime: aggregation tree}` results (metric mode).
    fn add_aggregation_data(&mut self, _payload: Vec<(DateTime<Utc>, Value)>) {}

    /// Called at each segment boundary so the detector can expire state
    /// and emit time-driven matches.
    fn garbage_collect(&mut self, _now: DateTime<Utc>) {}

    /// Emitted matches; the engine drains this list.
    fn matches_mut(&mut self) -> &mut Vec<Value>;

    /// Whether the runner may keep scrolling past the first page.
    fn allows_scrolling(&self) -> bool {
        true
    }

    /// Whether hits should arrive newest-first instead of the default
    /// ascending order.
    fn sort_descending(&self) -> bool {
        false
    }

    /// Whether this detector fires on the *absence* of events. Drives
    /// the widened top-count window and the `key`-based silence key.
    fn triggers_on_absence(&self) -> bool {
        false
    }
}

/// Construct the detector named by `rule.type`.
pub fn build_detector(rule: &Rule) -> Result<Box<dyn Detector>, RuleError> {
    match rule.detector_type.as_str() {
        "any" => Ok(Box::new(AnyDetector::new())),
        "frequency" => Ok(Box::new(FrequencyDetector::from_rule(rule)?)),
        "flatline" => Ok(Box::new(FlatlineDetector::from_rule(rule)?)),
        other => Err(RuleError::UnknownDetector(other.to_string())),
    }
}

//! Rule definitions for the searchlight alerting engine.
//!
//! This crate provides:
//! - The rule YAML schema with serde deserialization (`schema`)
//! - A filesystem loader with content hashing for reload sweeps (`loader`)
//! - The detector (rule-type) contract and built-in detectors (`detector`)
//! - The match-enhancement contract (`enhancement`)
//! - Alerter construction from rule/engine configuration (`alerts`)

pub mod alerts;
pub mod detector;
pub mod enhancement;
pub mod error;
pub mod loader;
pub mod schema;

pub use detector::{Detector, TermsBucket};
pub use enhancement::{Enhancement, EnhancementError};
pub use error::RuleError;
pub use loader::{LoadOutcome, LoadedRule, RuleLoader};
pub use schema::{AggregationSpec, Rule};

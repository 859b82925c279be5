//! Shared foundation for the searchlight alerting engine.
//!
//! This crate provides:
//! - Timestamp and duration utilities (`time`)
//! - Nested/compound document key helpers (`keys`)
//! - The global engine configuration (`config`)
//! - Serde helpers shared by config and rule schemas (`de`)

pub mod config;
pub mod de;
pub mod error;
pub mod keys;
pub mod time;

pub use config::Config;
pub use error::ConfigError;
pub use time::Interval;

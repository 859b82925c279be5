//! Rule execution core of the searchlight alerting engine.
//!
//! This crate provides:
//! - A search-backend abstraction with an HTTP implementation (`backend`)
//! - Query construction for the four query modes (`query`)
//! - Windowed query execution with scrolling and dedupe (`runner`)
//! - Per-rule cursors and window math (`state`, `cursor`)
//! - Match routing: silencing, aggregation, dispatch (`executor`,
//!   `silence`, `aggregation`, `dispatch`, `pending`)
//! - Durable writeback of status/alert/silence/error documents
//!   (`writeback`)
//! - Job scheduling and lifecycle (`scheduler`)

pub mod aggregation;
pub mod backend;
pub mod cursor;
pub mod discover;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod notifications;
pub mod pending;
pub mod query;
pub mod runner;
pub mod scheduler;
pub mod silence;
pub mod state;
pub mod writeback;

pub use backend::{BackendError, HttpBackend, SearchBackend, SearchOptions, WritebackKind};
pub use engine::{Engine, EngineOptions, RuleHandle, StartOption};
pub use error::{EngineError, Result};
pub use state::{RuleRuntime, RuleState, TickContext};

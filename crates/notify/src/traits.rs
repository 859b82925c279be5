//! Alerter trait definition and shared error types.

use std::collections::HashMap;

use serde_json::{json, Value};

/// Errors that can occur during alert delivery.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("template rendering failed: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Mutable state shared by every alerter of a single dispatch.
///
/// The dispatcher seeds it with `alert_time` and hands the same map to
/// each alerter in order, so alerters can pass data between themselves
/// (e.g. a ticket id created by the first alerter).
pub type Pipeline = HashMap<String, Value>;

/// Trait for alert channel implementations.
///
/// Matches are dictionary-shaped events produced by a rule's detector;
/// an alerter renders and delivers them. Raising an error marks the
/// dispatch attempt failed for this channel only.
#[async_trait::async_trait]
pub trait Alerter: Send + Sync {
    /// Deliver the given matches through this channel.
    async fn alert(&self, matches: &[Value], pipeline: &mut Pipeline) -> Result<(), AlertError>;

    /// Channel metadata recorded on the alert's writeback document.
    fn info(&self) -> Value {
        json!({ "type": self.name() })
    }

    /// Short channel name (e.g. `"email"`, `"webhook"`).
    fn name(&self) -> &str;
}

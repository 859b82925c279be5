//! Alert delivery channels for the searchlight engine.
//!
//! This crate provides:
//! - The `Alerter` trait consumed by the alert dispatcher
//! - Debug, email, and webhook alerter implementations
//! - Minijinja rendering for alert subjects and bodies

pub mod debug;
pub mod email;
pub mod templating;
pub mod traits;
pub mod webhook;

pub use debug::DebugAlerter;
pub use email::EmailAlerter;
pub use templating::{AlertContext, TemplateRenderer};
pub use traits::{AlertError, Alerter, Pipeline};
pub use webhook::WebhookAlerter;

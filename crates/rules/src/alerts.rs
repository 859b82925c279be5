//! Alerter construction from rule and engine configuration.

use searchlight_core::Config;
use searchlight_notify::{Alerter, DebugAlerter, EmailAlerter, WebhookAlerter};

use crate::error::RuleError;
use crate::schema::Rule;

/// Construct the alerter chain named by `rule.alert`, in order.
pub fn build_alerters(rule: &Rule, conf: &Config) -> Result<Vec<Box<dyn Alerter>>, RuleError> {
    rule.alert
        .iter()
        .map(|name| build_one(name, rule, conf))
        .collect()
}

fn build_one(name: &str, rule: &Rule, conf: &Config) -> Result<Box<dyn Alerter>, RuleError> {
    match name {
        "debug" => Ok(Box::new(DebugAlerter::new(&rule.name))),
        "email" => {
            let smtp_host = rule.smtp_host.as_deref().unwrap_or(&conf.smtp_host);
            let smtp_port = rule.smtp_port.unwrap_or(conf.smtp_port);
            let from = rule.from_addr.as_deref().unwrap_or(&conf.from_addr);
            let alerter = EmailAlerter::from_config(
                &rule.name,
                smtp_host,
                Some(smtp_port),
                None,
                from,
                &rule.email,
                rule.alert_subject.clone(),
                rule.alert_text.clone(),
            )?;
            Ok(Box::new(alerter))
        }
        "webhook" => {
            let url = rule.webhook_url.clone().ok_or_else(|| {
                RuleError::Validation(format!(
                    "rule '{}': webhook alerter requires webhook_url",
                    rule.name
                ))
            })?;
            let alerter = WebhookAlerter::from_config(
                &rule.name,
                url,
                rule.webhook_method.clone(),
                rule.webhook_headers.clone(),
                rule.alert_text.clone(),
            )?;
            Ok(Box::new(alerter))
        }
        other => Err(RuleError::UnknownAlerter(other.to_string())),
    }
}

/// Construct the engine-level error-notification alerters
/// (`notify_alert` in the global config). Channels that need per-rule
/// settings the global config cannot provide are skipped with a warning.
pub fn build_notify_alerters(conf: &Config) -> Vec<Box<dyn Alerter>> {
    let mut alerters: Vec<Box<dyn Alerter>> = Vec::new();
    for name in &conf.notify_alert {
        match name.as_str() {
            "debug" => alerters.push(Box::new(DebugAlerter::new("searchlight-error"))),
            "email" if !conf.notify_email.is_empty() => {
                match EmailAlerter::from_config(
                    "searchlight-error",
                    &conf.smtp_host,
                    Some(conf.smtp_port),
                    None,
                    &conf.from_addr,
                    &conf.notify_email,
                    None,
                    None,
                ) {
                    Ok(a) => alerters.push(Box::new(a)),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to build error-notification email alerter")
                    }
                }
            }
            other => {
                tracing::warn!(alerter = %other, "unsupported notify_alert channel, skipping")
            }
        }
    }
    alerters
}

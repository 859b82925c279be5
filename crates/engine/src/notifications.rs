//! Error reporting and notification fan-out.
//!
//! Every engine error is logged and persisted as an error document.
//! Configured recipients additionally get an email and/or a
//! synthesized match through the `notify_alert` alerters.

use lettre::{
    message::Mailbox, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::{json, Value};
use tracing::error;

use searchlight_core::time::{dt_to_ts, ts_now};
use searchlight_notify::Pipeline;

use crate::backend::WritebackKind;
use crate::engine::Engine;

impl Engine {
    /// Log an error and persist it to the error writeback index. With
    /// `notify_all_errors`, the notification fan-out also fires.
    pub(crate) async fn handle_error(&self, message: &str, data: Option<Value>) {
        error!("{}", message);
        self.metrics.errors.inc();

        let mut body = json!({ "message": message });
        if let Some(data) = data {
            body["data"] = data;
        }
        self.writeback.write(WritebackKind::Error, body).await;

        if self.conf.notify_all_errors {
            self.handle_notify_error(message, None).await;
        }
    }

    /// Fan an error out to `notify_email` recipients and the
    /// `notify_alert` alerters.
    pub(crate) async fn handle_notify_error(&self, message: &str, rule_name: Option<&str>) {
        if !self.conf.notify_email.is_empty() {
            self.send_notification_email(message, rule_name, &[]).await;
        }
        if self.notify_alerters.is_empty() {
            return;
        }
        let mut pipeline: Pipeline = Pipeline::new();
        pipeline.insert("alert_time".to_string(), json!(dt_to_ts(&ts_now())));
        let details = vec![json!({
            "timestamp": dt_to_ts(&ts_now()),
            "message": message,
            "rule": rule_name,
        })];
        for alerter in &self.notify_alerters {
            if let Err(e) = alerter.alert(&details, &mut pipeline).await {
                error!(
                    alerter = %alerter.name(),
                    error = %e,
                    "error while running notify alerter"
                );
            }
        }
    }

    /// Email the global `notify_email` recipients (plus any extras,
    /// e.g. a rule's own `notify_email`), deduplicated.
    pub(crate) async fn send_notification_email(
        &self,
        text: &str,
        rule_name: Option<&str>,
        extra_recipients: &[String],
    ) {
        let mut recipients: Vec<String> = self.conf.notify_email.clone();
        recipients.extend(extra_recipients.iter().cloned());
        recipients.sort();
        recipients.dedup();
        if recipients.is_empty() {
            return;
        }

        let subject = match rule_name {
            Some(name) => format!("Uncaught exception in searchlight - {}", name),
            None => "searchlight notification".to_string(),
        };
        let mut body = text.to_string();
        if let Some(name) = rule_name {
            body.push_str(&format!("\n\nThe rule {} has raised an error.", name));
            if self.conf.disable_rules_on_error {
                body.push_str("\nIt has been disabled and will be re-enabled when searchlight restarts or the rule file changes.");
            }
        }

        let Ok(from) = self.conf.from_addr.parse::<Mailbox>() else {
            error!(from = %self.conf.from_addr, "invalid from_addr, skipping notification email");
            return;
        };
        let mut builder = Message::builder().from(from).subject(subject);
        let mut valid = 0;
        for recipient in &recipients {
            match recipient.parse::<Mailbox>() {
                Ok(mailbox) => {
                    builder = builder.to(mailbox);
                    valid += 1;
                }
                Err(e) => error!(recipient = %recipient, error = %e, "invalid notify_email recipient"),
            }
        }
        if valid == 0 {
            return;
        }
        if let Some(reply_to) = &self.conf.email_reply_to {
            if let Ok(mailbox) = reply_to.parse::<Mailbox>() {
                builder = builder.reply_to(mailbox);
            }
        }
        let email = match builder.body(body) {
            Ok(email) => email,
            Err(e) => {
                error!(error = %e, "failed to build notification email");
                return;
            }
        };

        let transport =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.conf.smtp_host)
                .port(self.conf.smtp_port)
                .build();
        if let Err(e) = transport.send(email).await {
            error!(host = %self.conf.smtp_host, error = %e, "error connecting to SMTP host");
        }
    }

    /// An unexpected per-rule failure: report it, optionally disable
    /// the rule, and notify.
    pub(crate) async fn handle_uncaught_error(&self, rule_name: &str, err: &crate::error::EngineError) {
        let message = format!("Uncaught exception running rule {}: {}", rule_name, err);
        self.handle_error(&message, Some(json!({"rule": rule_name})))
            .await;

        if self.conf.disable_rules_on_error {
            self.disable_rule(rule_name).await;
        }

        let extra = self
            .get_rule(rule_name)
            .await
            .map(|rh| rh.rule.notify_email.clone())
            .unwrap_or_default();
        if !self.conf.notify_email.is_empty() || !extra.is_empty() {
            self.send_notification_email(&message, Some(rule_name), &extra)
                .await;
        }
        if !self.notify_alerters.is_empty() {
            self.handle_notify_error(&message, Some(rule_name)).await;
        }
    }

    /// Move a rule to the disabled set and clean its memory; its job
    /// loop observes the set and parks itself.
    pub(crate) async fn disable_rule(&self, rule_name: &str) {
        self.disabled_rules
            .lock()
            .expect("disabled set lock poisoned")
            .insert(rule_name.to_string());
        if let Some(rh) = self.get_rule(rule_name).await {
            let mut runtime = rh.runtime.lock().await;
            let now = ts_now();
            let horizon = rh.rule.buffer_time(&self.conf).duration()
                + rh.rule.query_delay.map(|d| d.duration()).unwrap_or_default();
            runtime.state.remove_old_events(now, horizon);
            runtime.state.remove_expired_aggregates(now);
            runtime.detector.garbage_collect(now);
        }
        tracing::info!(rule = %rule_name, "rule disabled");
    }
}

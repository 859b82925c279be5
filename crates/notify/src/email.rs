//! SMTP email alerter via `lettre` with TLS support.

use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};
use serde_json::{json, Value};

use crate::templating::{default_body, AlertContext, TemplateRenderer};
use crate::traits::{AlertError, Alerter, Pipeline};

/// Sends alerts as emails via SMTP.
///
/// Subject and body come from the rule's `alert_subject` / `alert_text`
/// minijinja templates when set; otherwise the subject is the rule name
/// and the body is the matches pretty-printed.
pub struct EmailAlerter {
    rule_name: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject_template: Option<String>,
    body_template: Option<String>,
    renderer: TemplateRenderer,
}

impl EmailAlerter {
    /// Build an `EmailAlerter` from SMTP configuration.
    ///
    /// Port 465 uses implicit TLS; other ports use STARTTLS unless `tls`
    /// is explicitly `Some(false)`. SMTP credentials are resolved from
    /// the `SMTP_USERNAME` and `SMTP_PASSWORD` environment variables; if
    /// both are set they are attached to the transport.
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        rule_name: &str,
        smtp_host: &str,
        smtp_port: Option<u16>,
        tls: Option<bool>,
        from: &str,
        to: &[String],
        subject_template: Option<String>,
        body_template: Option<String>,
    ) -> Result<Self, AlertError> {
        let from_mailbox: Mailbox = from
            .parse()
            .map_err(|e: lettre::address::AddressError| AlertError::Config(e.to_string()))?;

        let to_mailboxes: Vec<Mailbox> = to
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|e: lettre::address::AddressError| AlertError::Config(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if to_mailboxes.is_empty() {
            return Err(AlertError::Config(
                "email alerter requires at least one recipient".to_string(),
            ));
        }

        let renderer = TemplateRenderer::new();
        for template in [&subject_template, &body_template].into_iter().flatten() {
            renderer.validate(template)?;
        }

        let port = smtp_port.unwrap_or(587);
        let use_tls = tls.unwrap_or(true);

        let mut builder = if port == 465 || use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
                .map_err(|e| AlertError::Config(e.to_string()))?
                .port(port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host).port(port)
        };

        if let (Ok(username), Ok(password)) =
            (std::env::var("SMTP_USERNAME"), std::env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            rule_name: rule_name.to_string(),
            transport: builder.build(),
            from: from_mailbox,
            to: to_mailboxes,
            subject_template,
            body_template,
            renderer,
        })
    }
}

#[async_trait::async_trait]
impl Alerter for EmailAlerter {
    async fn alert(&self, matches: &[Value], _pipeline: &mut Pipeline) -> Result<(), AlertError> {
        let ctx = AlertContext::new(&self.rule_name, matches);

        let subject = match &self.subject_template {
            Some(t) => self.renderer.render(t, &ctx)?,
            None => format!("{} - {} matches", self.rule_name, matches.len()),
        };
        let body = match &self.body_template {
            Some(t) => self.renderer.render(t, &ctx)?,
            None => default_body(&self.rule_name, matches),
        };

        let mut message_builder = Message::builder().from(self.from.clone());
        for recipient in &self.to {
            message_builder = message_builder.to(recipient.clone());
        }
        let email = message_builder
            .subject(&subject)
            .body(body)
            .map_err(|e| AlertError::Smtp(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| AlertError::Smtp(e.to_string()))?;

        tracing::info!(
            rule = %self.rule_name,
            subject = %subject,
            recipients = self.to.len(),
            "alert email delivered"
        );
        Ok(())
    }

    fn info(&self) -> Value {
        json!({
            "type": "email",
            "recipients": self.to.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
        })
    }

    fn name(&self) -> &str {
        "email"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_a_recipient() {
        let result = EmailAlerter::from_config(
            "r",
            "localhost",
            None,
            None,
            "alerts@example.com",
            &[],
            None,
            None,
        );
        assert!(matches!(result, Err(AlertError::Config(_))));
    }

    #[test]
    fn rejects_invalid_from_address() {
        let result = EmailAlerter::from_config(
            "r",
            "localhost",
            None,
            None,
            "not an address",
            &["ops@example.com".to_string()],
            None,
            None,
        );
        assert!(matches!(result, Err(AlertError::Config(_))));
    }

    #[test]
    fn rejects_invalid_subject_template() {
        let result = EmailAlerter::from_config(
            "r",
            "localhost",
            None,
            None,
            "alerts@example.com",
            &["ops@example.com".to_string()],
            Some("{{ unclosed".to_string()),
            None,
        );
        assert!(matches!(result, Err(AlertError::Template(_))));
    }
}

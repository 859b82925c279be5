//! Generic HTTP webhook alerter.
//!
//! Delivers matches as JSON payloads to a configured URL with optional
//! custom headers and a minijinja body template.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::templating::{AlertContext, TemplateRenderer};
use crate::traits::{AlertError, Alerter, Pipeline};

/// Delivers alerts as JSON over HTTP to a configured endpoint.
pub struct WebhookAlerter {
    rule_name: String,
    url: String,
    /// HTTP method (defaults to POST).
    method: reqwest::Method,
    headers: HashMap<String, String>,
    /// Optional body template. When unset the payload is
    /// `{"rule": ..., "matches": [...]}`.
    body_template: Option<String>,
    renderer: TemplateRenderer,
    client: reqwest::Client,
}

impl WebhookAlerter {
    pub fn from_config(
        rule_name: &str,
        url: String,
        method: Option<String>,
        headers: Option<HashMap<String, String>>,
        body_template: Option<String>,
    ) -> Result<Self, AlertError> {
        let method = match method {
            Some(m) => m
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|_| AlertError::Config(format!("invalid HTTP method: {m}")))?,
            None => reqwest::Method::POST,
        };

        let renderer = TemplateRenderer::new();
        if let Some(ref template) = body_template {
            renderer.validate(template)?;
        }

        Ok(Self {
            rule_name: rule_name.to_string(),
            url,
            method,
            headers: headers.unwrap_or_default(),
            body_template,
            renderer,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, matches: &[Value], _pipeline: &mut Pipeline) -> Result<(), AlertError> {
        let body = match &self.body_template {
            Some(template) => self
                .renderer
                .render(template, &AlertContext::new(&self.rule_name, matches))?,
            None => serde_json::to_string(&json!({
                "rule": self.rule_name,
                "matches": matches,
            }))
            .map_err(|e| AlertError::Delivery(e.to_string()))?,
        };

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AlertError::Delivery(format!(
                "webhook returned {}: {}",
                status,
                text.chars().take(256).collect::<String>()
            )));
        }

        tracing::info!(
            rule = %self.rule_name,
            url = %self.url,
            status = %status,
            "alert webhook delivered"
        );
        Ok(())
    }

    fn info(&self) -> Value {
        json!({ "type": "webhook", "url": self.url })
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_method() {
        let result = WebhookAlerter::from_config(
            "r",
            "http://example.com/hook".to_string(),
            Some("NOT A METHOD".to_string()),
            None,
            None,
        );
        assert!(matches!(result, Err(AlertError::Config(_))));
    }

    #[test]
    fn default_method_is_post() {
        let alerter = WebhookAlerter::from_config(
            "r",
            "http://example.com/hook".to_string(),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(alerter.method, reqwest::Method::POST);
    }
}

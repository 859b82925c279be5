//! Minijinja rendering for alert subjects and bodies.
//!
//! Templates are arbitrary strings from rule files (not pre-registered),
//! so a fresh [`minijinja::Environment`] is created per render call.

use serde_json::Value;

use crate::traits::AlertError;

/// Context data available to alert templates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertContext {
    /// Name of the rule that produced the matches.
    pub rule_name: String,
    /// The first match (most templates only need one).
    #[serde(rename = "match")]
    pub first_match: Value,
    /// All matches of this dispatch.
    pub matches: Vec<Value>,
    pub num_matches: usize,
    /// Current timestamp, RFC 3339 UTC.
    pub now: String,
}

impl AlertContext {
    pub fn new(rule_name: &str, matches: &[Value]) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            first_match: matches.first().cloned().unwrap_or(Value::Null),
            matches: matches.to_vec(),
            num_matches: matches.len(),
            now: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Renders alert subject/body templates using minijinja.
#[derive(Debug, Default)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_env() -> minijinja::Environment<'static> {
        minijinja::Environment::new()
    }

    /// Render a template string with the given context.
    pub fn render(&self, template_str: &str, ctx: &AlertContext) -> Result<String, AlertError> {
        let env = Self::build_env();
        env.render_str(template_str, ctx)
            .map_err(|e| AlertError::Template(e.to_string()))
    }

    /// Validate that a template string parses, without evaluating it.
    pub fn validate(&self, template_str: &str) -> Result<(), AlertError> {
        let env = Self::build_env();
        env.template_from_str(template_str)
            .map_err(|e| AlertError::Template(e.to_string()))?;
        Ok(())
    }
}

/// Default plain-text body when a rule has no `alert_text` template:
/// the rule name followed by each match pretty-printed as JSON.
pub fn default_body(rule_name: &str, matches: &[Value]) -> String {
    let mut body = format!("{}\n\n", rule_name);
    for m in matches {
        body.push_str(&serde_json::to_string_pretty(m).unwrap_or_else(|_| m.to_string()));
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_match_fields() {
        let renderer = TemplateRenderer::new();
        let ctx = AlertContext::new("login-spike", &[json!({"user": "alice", "count": 7})]);
        let out = renderer
            .render("{{ rule_name }}: {{ match.user }} ({{ num_matches }})", &ctx)
            .unwrap();
        assert_eq!(out, "login-spike: alice (1)");
    }

    #[test]
    fn invalid_template_fails_validation() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.validate("{{ unclosed").is_err());
        assert!(renderer.validate("{{ ok }}").is_ok());
    }

    #[test]
    fn default_body_lists_matches() {
        let body = default_body("r", &[json!({"a": 1}), json!({"b": 2})]);
        assert!(body.starts_with("r\n"));
        assert!(body.contains("\"a\": 1"));
        assert!(body.contains("\"b\": 2"));
    }
}

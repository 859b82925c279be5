//! Console alerter used by `--debug` and for trial rule runs.

use serde_json::Value;

use crate::traits::{AlertError, Alerter, Pipeline};

/// Logs matches instead of delivering them anywhere.
#[derive(Debug)]
pub struct DebugAlerter {
    rule_name: String,
}

impl DebugAlerter {
    pub fn new(rule_name: &str) -> Self {
        Self {
            rule_name: rule_name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Alerter for DebugAlerter {
    async fn alert(&self, matches: &[Value], _pipeline: &mut Pipeline) -> Result<(), AlertError> {
        for m in matches {
            tracing::info!(
                rule = %self.rule_name,
                match_body = %serde_json::to_string(m).unwrap_or_else(|_| m.to_string()),
                "alert (debug)"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "debug"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn debug_alerter_always_succeeds() {
        let alerter = DebugAlerter::new("r");
        let mut pipeline: Pipeline = HashMap::new();
        assert!(alerter
            .alert(&[json!({"user": "alice"})], &mut pipeline)
            .await
            .is_ok());
        assert_eq!(alerter.info(), json!({"type": "debug"}));
    }
}

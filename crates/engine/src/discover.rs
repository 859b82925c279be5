//! Kibana/OpenSearch discover deep links for alert context.
//!
//! Links open the discover view on the rule's index pattern, centered
//! on the first match's timestamp.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use searchlight_core::keys::lookup_es_key;
use searchlight_core::time::{dt_to_ts, ts_to_dt};
use searchlight_rules::Rule;

fn match_window(rule: &Rule, event: &Value) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let ts = lookup_es_key(event, &rule.timestamp_field)
        .and_then(Value::as_str)
        .and_then(|s| ts_to_dt(s).ok())?;
    Some((ts - Duration::minutes(10), ts + Duration::minutes(10)))
}

fn percent_encode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

fn columns_rison(columns: &[String]) -> String {
    if columns.is_empty() {
        "!(_source)".to_string()
    } else {
        format!("!({})", columns.join(","))
    }
}

/// Kibana discover URL for the first match, when the rule configures
/// `kibana_discover_app_url` and `kibana_discover_index_pattern_id`.
pub fn generate_kibana_discover_url(rule: &Rule, event: &Value) -> Option<String> {
    if !rule.generate_kibana_discover_url {
        return None;
    }
    let app_url = rule.kibana_discover_app_url.as_ref()?;
    let index_pattern = rule.kibana_discover_index_pattern_id.as_ref()?;
    let (from, to) = match_window(rule, event)?;

    let globals = format!(
        "(time:(from:'{}',to:'{}'))",
        dt_to_ts(&from),
        dt_to_ts(&to)
    );
    let app_state = format!(
        "(columns:{},index:'{}')",
        columns_rison(&rule.kibana_discover_columns),
        index_pattern
    );
    Some(format!(
        "{}#/?_g={}&_a={}",
        app_url,
        percent_encode(&globals),
        percent_encode(&app_state)
    ))
}

/// OpenSearch Dashboards discover URL for the first match.
pub fn generate_opensearch_discover_url(rule: &Rule, event: &Value) -> Option<String> {
    if !rule.generate_opensearch_discover_url {
        return None;
    }
    let app_url = rule.opensearch_discover_app_url.as_ref()?;
    let index_pattern = rule.opensearch_discover_index_pattern_id.as_ref()?;
    let (from, to) = match_window(rule, event)?;

    let globals = format!(
        "(time:(from:'{}',to:'{}'))",
        dt_to_ts(&from),
        dt_to_ts(&to)
    );
    let app_state = format!("(discover:(columns:!(_source)),metadata:(indexPattern:'{}'))", index_pattern);
    Some(format!(
        "{}#?_g={}&_a={}",
        app_url,
        percent_encode(&globals),
        percent_encode(&app_state)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(yaml: &str) -> Rule {
        let conf: searchlight_core::Config = serde_yaml::from_str(
            "rules_folder: rules\nrun_every: {minutes: 1}\nbuffer_time: {minutes: 15}\nes_host: localhost\n",
        )
        .unwrap();
        let mut rule: Rule = serde_yaml::from_str(yaml).unwrap();
        rule.finalize(&conf).unwrap();
        rule
    }

    #[test]
    fn kibana_url_contains_window_and_pattern() {
        let r = rule(
            "name: r\ntype: any\nindex: logs-*\nalert: [debug]\n\
             generate_kibana_discover_url: true\n\
             kibana_discover_app_url: http://kibana:5601/app/discover\n\
             kibana_discover_index_pattern_id: logs-pattern\n",
        );
        let event = json!({"@timestamp": "2024-03-01T12:00:00Z"});
        let url = generate_kibana_discover_url(&r, &event).unwrap();
        assert!(url.starts_with("http://kibana:5601/app/discover#/?_g="));
        assert!(url.contains("logs-pattern"));
        // 10 minutes either side of the match.
        assert!(url.contains(percent_encode("2024-03-01T11:50:00").as_str()));
        assert!(url.contains(percent_encode("2024-03-01T12:10:00").as_str()));
    }

    #[test]
    fn disabled_or_unconfigured_yields_none() {
        let r = rule("name: r\ntype: any\nindex: logs-*\nalert: [debug]\n");
        let event = json!({"@timestamp": "2024-03-01T12:00:00Z"});
        assert!(generate_kibana_discover_url(&r, &event).is_none());

        let r = rule(
            "name: r\ntype: any\nindex: logs-*\nalert: [debug]\ngenerate_kibana_discover_url: true\n",
        );
        assert!(generate_kibana_discover_url(&r, &event).is_none());
    }
}

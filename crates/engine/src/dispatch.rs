//! Alert delivery: enhancements, context enrichment, the alerter
//! chain, and outcome writeback.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use searchlight_core::keys::{key_fragment, lookup_es_key};
use searchlight_core::time::{dt_to_ts, ts_now, ts_to_dt};
use searchlight_notify::{Alerter, DebugAlerter, Pipeline};
use searchlight_rules::{EnhancementError, Rule};

use crate::backend::WritebackKind;
use crate::discover;
use crate::engine::{Engine, RuleHandle};
use crate::error::Result;
use crate::runner::get_index;
use crate::state::TickContext;

/// Value of a named key field in a match, for keyed silencing and
/// aggregation grouping. `None` when the rule has no such key.
pub(crate) fn named_key_value(key: Option<&str>, event: &Value) -> Option<String> {
    let key = key?;
    lookup_es_key(event, key)
        .filter(|v| !v.is_null())
        .map(|v| key_fragment(Some(v)))
}

/// Silence-key suffix for a match. Absence detectors put the affected
/// key on the match itself.
pub(crate) fn query_key_value(rh: &RuleHandle, event: &Value) -> Option<String> {
    if rh.triggers_on_absence {
        if let Some(key) = event.get("key") {
            return Some(key_fragment(Some(key)));
        }
    }
    named_key_value(rh.rule.query_key.as_deref(), event)
}

impl Engine {
    /// Deliver matches, reporting any unexpected failure against the
    /// rule (which may disable it).
    pub(crate) async fn alert(
        &self,
        matches: Vec<Value>,
        rh: &Arc<RuleHandle>,
        alert_time: Option<DateTime<Utc>>,
        retried: bool,
        ctx: &mut TickContext,
    ) {
        if let Err(e) = self.send_alert(matches, rh, alert_time, retried, ctx).await {
            self.handle_uncaught_error(&rh.rule.name, &e).await;
        }
    }

    async fn send_alert(
        &self,
        mut matches: Vec<Value>,
        rh: &Arc<RuleHandle>,
        alert_time: Option<DateTime<Utc>>,
        retried: bool,
        ctx: &mut TickContext,
    ) -> Result<()> {
        if matches.is_empty() {
            return Ok(());
        }
        let rule = &rh.rule;
        let alert_time = alert_time.unwrap_or_else(ts_now);

        if !rule.top_count_keys.is_empty() {
            for event in &mut matches {
                let qk = named_key_value(rule.query_key.as_deref(), event);
                if let Some(counts) = self.top_counts_for_match(rh, event, qk.as_deref(), ctx).await
                {
                    if let (Some(obj), Some(counts)) = (event.as_object_mut(), counts.as_object())
                    {
                        for (key, value) in counts {
                            obj.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }

        if let Some(url) = discover::generate_kibana_discover_url(rule, &matches[0]) {
            matches[0]["kibana_discover_url"] = json!(url);
        }
        if let Some(url) = discover::generate_opensearch_discover_url(rule, &matches[0]) {
            matches[0]["opensearch_discover_url"] = json!(url);
        }

        include_rule_params(rule, &mut matches);

        // Enhancements already ran at match time when
        // run_enhancements_first is set, and on the original attempt
        // for retries.
        if !rule.run_enhancements_first && !retried {
            let mut surviving = Vec::with_capacity(matches.len());
            'matches: for mut event in matches {
                for enhancement in &rh.enhancements {
                    match enhancement.process(&mut event) {
                        Ok(()) => {}
                        Err(EnhancementError::DropMatch) => continue 'matches,
                        Err(EnhancementError::Failed(e)) => {
                            self.handle_error(
                                &format!("Error running match enhancement: {}", e),
                                Some(json!({"rule": rule.name})),
                            )
                            .await;
                        }
                    }
                }
                surviving.push(event);
            }
            matches = surviving;
            if matches.is_empty() {
                return Ok(());
            }
        }

        // Debug mode: log instead of delivering, no writeback.
        if self.opts.debug {
            let debug_alerter = DebugAlerter::new(&rule.name);
            let mut pipeline = Pipeline::new();
            pipeline.insert("alert_time".to_string(), json!(dt_to_ts(&alert_time)));
            let _ = debug_alerter.alert(&matches, &mut pipeline).await;
            return Ok(());
        }

        // The pipeline map is shared across the whole chain so alerters
        // can pass data between themselves. Delivery is best-effort:
        // one alerter failing does not stop the others, and the alert
        // counts as sent if any alerter succeeded.
        let mut alert_sent = false;
        let mut alert_exception: Option<String> = None;
        let mut pipeline = Pipeline::new();
        pipeline.insert("alert_time".to_string(), json!(dt_to_ts(&alert_time)));
        for alerter in &rh.alerters {
            match alerter.alert(&matches, &mut pipeline).await {
                Ok(()) => {
                    ctx.alerts_sent += 1;
                    alert_sent = true;
                }
                Err(e) => {
                    self.handle_error(
                        &format!("Error while running alert {}: {}", alerter.name(), e),
                        Some(json!({"rule": rule.name})),
                    )
                    .await;
                    alert_exception = Some(e.to_string());
                }
            }
        }

        // All matches of one dispatch share the first document's id as
        // their aggregate_id.
        let mut agg_id: Option<String> = None;
        for event in &matches {
            let mut body = self.get_alert_body(
                event,
                rh,
                alert_sent,
                alert_time,
                alert_exception.as_deref(),
            );
            if let Some(id) = &agg_id {
                body["aggregate_id"] = json!(id);
            }
            let res = self.writeback.write(WritebackKind::Alert, body).await;
            if agg_id.is_none() {
                agg_id = res;
            }
        }
        Ok(())
    }

    /// The writeback document for one match's alert attempt.
    pub(crate) fn get_alert_body(
        &self,
        event: &Value,
        rh: &RuleHandle,
        alert_sent: bool,
        alert_time: DateTime<Utc>,
        alert_exception: Option<&str>,
    ) -> Value {
        let rule = &rh.rule;
        let alert_info = if self.opts.debug {
            json!({})
        } else {
            rh.alerters
                .first()
                .map(|a| a.info())
                .unwrap_or_else(|| json!({}))
        };
        let mut body = json!({
            "match_body": event,
            "rule_name": rule.name,
            "alert_info": alert_info,
            "alert_sent": alert_sent,
            "alert_time": dt_to_ts(&alert_time),
        });

        if rule.include_match_in_root {
            if let (Some(obj), Some(event_obj)) = (body.as_object_mut(), event.as_object()) {
                for (key, value) in event_obj {
                    if !key.starts_with('_') {
                        obj.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        if self.conf.add_metadata_alert {
            body["category"] = json!(rule.category);
            body["description"] = json!(rule.description);
            body["owner"] = json!(rule.owner);
            body["priority"] = json!(rule.priority);
        }
        if let Some(match_time) = lookup_es_key(event, &rule.timestamp_field) {
            body["match_time"] = match_time.clone();
        }
        if !alert_sent {
            body["alert_exception"] = json!(alert_exception);
        }
        body
    }

    /// Top event counts around one match's timestamp. Absence
    /// detectors get a doubled lookback since their match time marks
    /// the *end* of a quiet period.
    async fn top_counts_for_match(
        &self,
        rh: &RuleHandle,
        event: &Value,
        qk: Option<&str>,
        ctx: &mut TickContext,
    ) -> Option<Value> {
        let rule = &rh.rule;
        let match_ts = lookup_es_key(event, &rule.timestamp_field)
            .and_then(Value::as_str)
            .and_then(|s| ts_to_dt(s).ok())?;
        let timeframe = match rule.timeframe {
            Some(t) if rh.triggers_on_absence => t.duration() * 2,
            Some(t) => t.duration(),
            None => Duration::minutes(10),
        };
        let start = match_ts - timeframe;
        let end = match_ts + Duration::minutes(10);
        Some(
            self.get_top_counts(rule, start, end, &rule.top_count_keys, None, qk, ctx)
                .await,
        )
    }

    /// Count the top values of each key field in a window. Returns a
    /// `top_events_<key>` map per key.
    pub(crate) async fn get_top_counts(
        &self,
        rule: &Rule,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        keys: &[String],
        number: Option<usize>,
        qk: Option<&str>,
        ctx: &mut TickContext,
    ) -> Value {
        let number = number.unwrap_or_else(|| rule.top_count_number.unwrap_or(5));
        let mut all_counts = Map::new();
        for key in keys {
            let index = get_index(rule, Some(start), Some(end));
            let top = match self
                .get_hits_terms(rule, start, end, &index, key, qk, Some(number as u64), ctx)
                .await
            {
                Ok(data) => {
                    let buckets = data.into_iter().next().map(|(_, b)| b).unwrap_or_default();
                    // These lookups are context, not rule traffic.
                    ctx.num_hits = ctx.num_hits.saturating_sub(buckets.len());
                    let mut counts: Vec<(String, u64)> = buckets
                        .into_iter()
                        .map(|b| (key_fragment(Some(&b.key)), b.doc_count))
                        .collect();
                    counts.sort_by(|a, b| b.1.cmp(&a.1));
                    counts.truncate(number);
                    Value::Object(counts.into_iter().map(|(k, v)| (k, json!(v))).collect())
                }
                Err(e) => {
                    self.handle_error(
                        &format!("Error running terms query: {}", e.truncated()),
                        Some(json!({"rule": rule.name})),
                    )
                    .await;
                    json!({})
                }
            };
            all_counts.insert(format!("top_events_{}", key), top);
        }
        Value::Object(all_counts)
    }
}

/// Copy configured rule params onto matches as `rule_param_<name>`.
fn include_rule_params(rule: &Rule, matches: &mut [Value]) {
    if rule.include_rule_params_in_matches.is_empty() {
        return;
    }
    let limit = if rule.include_rule_params_in_first_match_only {
        1
    } else {
        matches.len()
    };
    for event in matches.iter_mut().take(limit) {
        let Some(obj) = event.as_object_mut() else {
            continue;
        };
        for param in &rule.include_rule_params_in_matches {
            let value = rule.param(param).unwrap_or(Value::Null);
            obj.insert(format!("rule_param_{}", param), value);
        }
    }
}

//! Aggregation queue: group matches by key until a shared deadline.
//!
//! Every match destined for aggregation is persisted immediately as an
//! unsent alert document; the in-memory deadline maps only accelerate
//! grouping, and pending groups are re-adopted from the writeback
//! store after a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

use searchlight_core::keys::lookup_es_key;
use searchlight_core::time::{dt_to_ts, ts_now, ts_to_dt};
use searchlight_rules::schema::parse_cron;
use searchlight_rules::{AggregationSpec, Rule};

use crate::backend::{SearchOptions, WritebackKind};
use crate::dispatch::named_key_value;
use crate::engine::{Engine, RuleHandle};
use crate::state::RuleState;

/// Grouping key for a match: `None` when the rule has no
/// `aggregation_key`, the sentinel `"_missing"` when the configured
/// field is absent from the match.
pub(crate) fn aggregation_key_value(rule: &Rule, event: &Value) -> Option<String> {
    rule.aggregation_key.as_deref()?;
    Some(
        named_key_value(rule.aggregation_key.as_deref(), event)
            .unwrap_or_else(|| "_missing".to_string()),
    )
}

impl Engine {
    /// Deadline for a newly opened aggregation group.
    fn aggregation_alert_time(&self, rule: &Rule, event: &Value) -> DateTime<Utc> {
        match &rule.aggregation {
            Some(AggregationSpec::Schedule { schedule }) => parse_cron(schedule)
                .ok()
                .and_then(|s| s.after(&ts_now()).next())
                .unwrap_or_else(ts_now),
            Some(AggregationSpec::Window(window)) => {
                if rule.aggregate_by_match_time {
                    let match_ts = lookup_es_key(event, &rule.timestamp_field)
                        .and_then(Value::as_str)
                        .and_then(|s| ts_to_dt(s).ok())
                        .unwrap_or_else(ts_now);
                    match_ts + window.duration()
                } else {
                    ts_now() + window.duration()
                }
            }
            None => ts_now(),
        }
    }

    /// Look for a pre-existing pending aggregate for this rule (and
    /// key) in the writeback store; the engine may have restarted
    /// while groups were open.
    pub(crate) async fn find_pending_aggregate_alert(
        &self,
        rule: &Rule,
        key: Option<&str>,
    ) -> Option<(String, DateTime<Utc>)> {
        let mut must = vec![
            json!({"term": {"rule_name": rule.name}}),
            json!({"range": {"alert_time": {"gt": dt_to_ts(&ts_now())}}}),
            json!({"term": {"alert_sent": false}}),
        ];
        if let Some(key) = key {
            must.push(json!({"term": {"aggregation_key": key}}));
        }
        let query = json!({
            "query": {
                "bool": {
                    "filter": {
                        "bool": {
                            "must": must,
                            "must_not": [{"exists": {"field": "aggregate_id"}}],
                        }
                    }
                }
            },
            "sort": [{"alert_time": {"order": "desc"}}],
        });
        let index = self.writeback.index_for(WritebackKind::Alert);
        let res = match self
            .backend
            .search(&index, &query, SearchOptions::size(1))
            .await
        {
            Ok(res) => res,
            Err(e) => {
                self.handle_error(
                    &format!(
                        "Error searching for pending aggregated matches: {}",
                        e.truncated()
                    ),
                    Some(json!({"rule_name": rule.name})),
                )
                .await;
                return None;
            }
        };

        let hit = res["hits"]["hits"].get(0)?;
        let id = hit["_id"].as_str()?.to_string();
        let alert_time = hit["_source"]["alert_time"]
            .as_str()
            .and_then(|s| ts_to_dt(s).ok())?;
        Some((id, alert_time))
    }

    /// Queue one match into its aggregation group, persisting it as an
    /// unsent alert document. Returns the document id when persisted;
    /// on writeback failure the match is kept in memory and retried on
    /// the next sweep.
    pub(crate) async fn add_aggregated_alert(
        &self,
        rh: &Arc<RuleHandle>,
        state: &mut RuleState,
        event: Value,
    ) -> Option<String> {
        let _guard = self.alert_lock.lock().await;
        let rule = &rh.rule;
        let key = aggregation_key_value(rule, &event);

        let compare_ts = if rule.aggregation_alert_time_compared_with_timestamp_field {
            lookup_es_key(&event, &rule.timestamp_field)
                .and_then(Value::as_str)
                .and_then(|s| ts_to_dt(s).ok())
                .unwrap_or_else(ts_now)
        } else {
            ts_now()
        };

        let group_expired = state
            .aggregate_alert_time
            .get(&key)
            .is_some_and(|deadline| *deadline < compare_ts);
        let (agg_id, alert_time) = if !state.current_aggregate_id.contains_key(&key)
            || group_expired
        {
            if let Some((id, alert_time)) =
                self.find_pending_aggregate_alert(rule, key.as_deref()).await
            {
                state.aggregate_alert_time.insert(key.clone(), alert_time);
                state.current_aggregate_id.insert(key.clone(), id.clone());
                info!(
                    rule = %rule.name,
                    aggregate_id = %id,
                    aggregation_key = ?key,
                    next_alert = %alert_time,
                    "adding alert to existing aggregation"
                );
                (Some(id), alert_time)
            } else {
                let alert_time = self.aggregation_alert_time(rule, &event);
                state.aggregate_alert_time.insert(key.clone(), alert_time);
                info!(
                    rule = %rule.name,
                    aggregation_key = ?key,
                    next_alert = %alert_time,
                    "new aggregation group"
                );
                (None, alert_time)
            }
        } else {
            let agg_id = state.current_aggregate_id.get(&key).cloned();
            let alert_time = state
                .aggregate_alert_time
                .get(&key)
                .copied()
                .unwrap_or_else(ts_now);
            info!(
                rule = %rule.name,
                aggregate_id = ?agg_id,
                aggregation_key = ?key,
                next_alert = %alert_time,
                "adding alert to aggregation"
            );
            (agg_id, alert_time)
        };

        let mut body = self.get_alert_body(&event, rh, false, alert_time, None);
        if let Some(id) = &agg_id {
            body["aggregate_id"] = json!(id);
        }
        if let Some(key) = &key {
            body["aggregation_key"] = json!(key);
        }
        let res = self.writeback.write(WritebackKind::Alert, body).await;

        match &res {
            Some(doc_id) if agg_id.is_none() => {
                state.current_aggregate_id.insert(key, doc_id.clone());
            }
            Some(_) => {}
            None => {
                // Persistence failed; keep the match for the next sweep.
                state.agg_matches.push(event);
            }
        }
        res
    }
}

//! Windowed query execution: one query per window per rule mode, with
//! scroll pagination, hit post-processing, and `_id` dedupe.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use searchlight_core::keys::{compound_key_value, lookup_es_key, set_es_key};
use searchlight_core::time::{
    dt_to_ts, format_index, pretty_ts, ts_for_query, ts_to_dt, wildcard_index,
};
use searchlight_core::Config;
use searchlight_rules::schema::QueryMode;
use searchlight_rules::{Rule, TermsBucket};

use crate::backend::{BackendError, SearchOptions};
use crate::engine::{Engine, RuleHandle};
use crate::query;
use crate::state::{RuleRuntime, RuleState, TickContext};

/// Resolve the index (list) to query for a window.
///
/// With `use_strftime_index`, a known window expands the format tokens
/// across its days; an unknown window falls back to a wildcard.
pub fn get_index(rule: &Rule, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> String {
    if rule.use_strftime_index {
        match (start, end) {
            (Some(start), Some(end)) => {
                format_index(&rule.index, start, end, rule.search_extra_index)
            }
            _ => wildcard_index(&rule.index),
        }
    } else {
        rule.index.clone()
    }
}

fn query_timezone(rule: &Rule) -> Option<Tz> {
    rule.query_timezone
        .as_deref()
        .and_then(|name| match name.parse() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(rule = %rule.name, timezone = %name, "unknown query_timezone, using UTC");
                None
            }
        })
}

fn normalize_ts_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => ts_to_dt(s).ok(),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(|i| if i >= 1_000_000_000_000 { i } else { i * 1000 })?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// Post-process raw hits into flat `_source` events:
/// merge `fields` into `_source` (length-1 lists unwrap), normalize the
/// timestamp to RFC 3339 UTC, fold `_id`/`_index`/`_type` in, and
/// derive compound keys. Hits without a parseable timestamp are
/// dropped with a warning.
pub fn process_hits(rule: &Rule, raw_hits: &[Value]) -> Vec<Value> {
    let mut processed = Vec::with_capacity(raw_hits.len());
    for hit in raw_hits {
        let mut source = hit.get("_source").cloned().unwrap_or_else(|| json!({}));
        if !source.is_object() {
            source = json!({});
        }

        if let (Some(fields), Some(obj)) = (
            hit.get("fields").and_then(Value::as_object),
            source.as_object_mut(),
        ) {
            for (key, value) in fields {
                let value = match value.as_array() {
                    Some(items) if items.len() == 1 => items[0].clone(),
                    _ => value.clone(),
                };
                obj.entry(key.clone()).or_insert(value);
            }
        }

        let ts = lookup_es_key(&source, &rule.timestamp_field).and_then(normalize_ts_value);
        let Some(ts) = ts else {
            warn!(
                rule = %rule.name,
                field = %rule.timestamp_field,
                "hit without parseable timestamp, dropping"
            );
            continue;
        };
        set_es_key(&mut source, &rule.timestamp_field, json!(dt_to_ts(&ts)));

        if let Some(obj) = source.as_object_mut() {
            for meta in ["_id", "_index", "_type"] {
                if let Some(value) = hit.get(meta) {
                    obj.insert(meta.to_string(), value.clone());
                }
            }
        }

        if !rule.compound_query_key.is_empty() {
            let compound = compound_key_value(&source, &rule.compound_query_key);
            if let (Some(qk), Some(obj)) = (&rule.query_key, source.as_object_mut()) {
                obj.insert(qk.clone(), json!(compound));
            }
        }
        if !rule.compound_aggregation_key.is_empty() {
            let compound = compound_key_value(&source, &rule.compound_aggregation_key);
            if let (Some(ak), Some(obj)) = (&rule.aggregation_key, source.as_object_mut()) {
                obj.insert(ak.clone(), json!(compound));
            }
        }

        processed.push(source);
    }
    processed
}

/// Drop events whose `_id` was already processed; remember survivors.
pub fn remove_duplicate_events(
    events: Vec<Value>,
    state: &mut RuleState,
    timestamp_field: &str,
) -> Vec<Value> {
    events
        .into_iter()
        .filter(|event| {
            let Some(id) = event.get("_id").and_then(Value::as_str) else {
                return true;
            };
            if state.processed_hits.contains_key(id) {
                return false;
            }
            if let Some(ts) = lookup_es_key(event, timestamp_field)
                .and_then(Value::as_str)
                .and_then(|s| ts_to_dt(s).ok())
            {
                state.processed_hits.insert(id.to_string(), ts);
            }
            true
        })
        .collect()
}

fn check_shard_failures(res: &Value) -> Result<(), BackendError> {
    let failures = res["_shards"]["failures"].as_array();
    let Some(failures) = failures.filter(|f| !f.is_empty()) else {
        return Ok(());
    };
    let parse_errors: Vec<&str> = failures
        .iter()
        .filter_map(|f| f["reason"]["reason"].as_str())
        .filter(|reason| reason.contains("Failed to parse"))
        .collect();
    if parse_errors.is_empty() {
        Err(BackendError::ShardFailure(
            serde_json::to_string(failures).unwrap_or_default(),
        ))
    } else {
        Err(BackendError::ShardFailure(parse_errors.join("; ")))
    }
}

fn scrolling_may_continue(conf: &Config, scrolling_cycle: u32) -> bool {
    conf.max_scrolling_count == 0 || scrolling_cycle < conf.max_scrolling_count
}

impl Engine {
    /// Fetch one page of documents for a search-mode window.
    #[allow(clippy::too_many_arguments)]
    async fn get_hits(
        &self,
        rule: &Rule,
        state: &mut RuleState,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        index: &str,
        scroll: bool,
        descending: bool,
        ctx: &mut TickContext,
    ) -> Result<Vec<Value>, BackendError> {
        let keepalive = rule.scroll_keepalive(&self.conf).to_string();
        let client = self.client_for(rule);

        let res = if scroll {
            let Some(scroll_id) = state.scroll_id.clone() else {
                return Ok(Vec::new());
            };
            client.scroll(&scroll_id, &keepalive).await?
        } else {
            let tz = query_timezone(rule);
            let mut body = query::get_query(
                &rule.filter,
                Some(&ts_for_query(&start, tz.as_ref())),
                Some(&ts_for_query(&end, tz.as_ref())),
                &rule.timestamp_field,
                true,
                descending,
            );
            if let Some(fields) = &rule.include_fields {
                body["fields"] = json!(fields);
            }
            let opts = SearchOptions {
                size: Some(rule.max_query_size(&self.conf)),
                scroll: Some(keepalive),
                source_includes: if rule.include.is_empty() {
                    None
                } else {
                    Some(rule.include.clone())
                },
            };
            let res = client.search(index, &body, opts).await?;
            if let Some(scroll_id) = res.get("_scroll_id").and_then(Value::as_str) {
                state.scroll_id = Some(scroll_id.to_string());
            }
            ctx.total_hits = res["hits"]["total"]["value"].as_u64().unwrap_or(0);
            res
        };

        check_shard_failures(&res)?;
        debug!(response = %res, "search response");

        let hits = res["hits"]["hits"].as_array().cloned().unwrap_or_default();
        ctx.num_hits += hits.len();
        let status = format!(
            "Queried rule {} from {} to {}: {} / {} hits",
            rule.name,
            pretty_ts(&start),
            pretty_ts(&end),
            ctx.num_hits,
            hits.len()
        );
        if ctx.total_hits > rule.max_query_size(&self.conf) as u64 {
            info!("{} (scrolling..)", status);
        } else {
            info!("{}", status);
        }

        Ok(process_hits(rule, &hits))
    }

    /// Count-mode window: `{endtime: count}`.
    async fn get_hits_count(
        &self,
        rule: &Rule,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        index: &str,
        ctx: &mut TickContext,
    ) -> Result<Vec<(DateTime<Utc>, u64)>, BackendError> {
        let tz = query_timezone(rule);
        let body = query::get_query(
            &rule.filter,
            Some(&ts_for_query(&start, tz.as_ref())),
            Some(&ts_for_query(&end, tz.as_ref())),
            &rule.timestamp_field,
            false,
            false,
        );
        let count = self.client_for(rule).count(index, &body).await?;
        ctx.num_hits += count as usize;
        info!(
            "Queried rule {} from {} to {}: {} hits",
            rule.name,
            pretty_ts(&start),
            pretty_ts(&end),
            count
        );
        Ok(vec![(end, count)])
    }

    /// Terms-mode window: `{endtime: buckets}` over `key`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn get_hits_terms(
        &self,
        rule: &Rule,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        index: &str,
        key: &str,
        qk: Option<&str>,
        size: Option<u64>,
        ctx: &mut TickContext,
    ) -> Result<Vec<(DateTime<Utc>, Vec<TermsBucket>)>, BackendError> {
        let mut filters = rule.filter.clone();
        filters.extend(query::query_key_filters(rule, qk, &self.conf));

        let tz = query_timezone(rule);
        let base = query::get_query(
            &filters,
            Some(&ts_for_query(&start, tz.as_ref())),
            Some(&ts_for_query(&end, tz.as_ref())),
            &rule.timestamp_field,
            false,
            false,
        );
        let size = size.unwrap_or_else(|| rule.terms_size());
        let body = query::get_terms_query(base, rule, size, key, &self.conf);

        let res = self
            .client_for(rule)
            .search(index, &body, SearchOptions::size(0))
            .await?;
        check_shard_failures(&res)?;

        let Some(buckets) = res["aggregations"]["counts"]["buckets"].as_array() else {
            return Ok(Vec::new());
        };
        let buckets: Vec<TermsBucket> = buckets
            .iter()
            .map(|b| TermsBucket {
                key: b["key"].clone(),
                doc_count: b["doc_count"].as_u64().unwrap_or(0),
            })
            .collect();
        ctx.num_hits += buckets.len();
        info!(
            "Queried rule {} from {} to {}: {} buckets",
            rule.name,
            pretty_ts(&start),
            pretty_ts(&end),
            buckets.len()
        );
        Ok(vec![(end, buckets)])
    }

    /// Metric-aggregation window: `{endtime: aggregation tree}`.
    async fn get_hits_aggregation(
        &self,
        rule: &Rule,
        state: &RuleState,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        index: &str,
        ctx: &mut TickContext,
    ) -> Result<Vec<(DateTime<Utc>, Value)>, BackendError> {
        let tz = query_timezone(rule);
        let base = query::get_query(
            &rule.filter,
            Some(&ts_for_query(&start, tz.as_ref())),
            Some(&ts_for_query(&end, tz.as_ref())),
            &rule.timestamp_field,
            false,
            false,
        );
        let body = query::get_aggregation_query(
            base,
            rule,
            rule.query_key.as_deref(),
            rule.terms_size(),
            &rule.timestamp_field,
            state.bucket_offset_delta,
        );

        let res = self
            .client_for(rule)
            .search(index, &body, SearchOptions::size(0))
            .await?;
        check_shard_failures(&res)?;

        let Some(payload) = res.get("aggregations") else {
            return Ok(Vec::new());
        };
        // Metric aggregations count the full hit total, unlike terms
        // queries which count buckets.
        ctx.num_hits += res["hits"]["total"]["value"].as_u64().unwrap_or(0) as usize;
        Ok(vec![(end, payload.clone())])
    }

    /// Release a rule's scroll cursor, if any. Failures are swallowed;
    /// the scroll has usually expired on its own.
    pub(crate) async fn cleanup_scroll(&self, rule: &Rule, state: &mut RuleState) {
        if let Some(scroll_id) = state.scroll_id.take() {
            let _ = self.client_for(rule).clear_scroll(&scroll_id).await;
        }
    }

    /// Run one query window for a rule and feed the results to its
    /// detector. Returns `false` on backend failure (already reported).
    pub(crate) async fn run_query(
        &self,
        rh: &RuleHandle,
        runtime: &mut RuleRuntime,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        ctx: &mut TickContext,
    ) -> bool {
        let rule = &rh.rule;
        let index = get_index(rule, Some(start), Some(end));
        let RuleRuntime { state, detector } = runtime;

        match rule.query_mode() {
            QueryMode::Count => match self.get_hits_count(rule, start, end, &index, ctx).await {
                Ok(data) => {
                    detector.add_count_data(data);
                    true
                }
                Err(e) => {
                    self.handle_error(
                        &format!("Error running count query: {}", e.truncated()),
                        Some(json!({"rule": rule.name})),
                    )
                    .await;
                    false
                }
            },
            QueryMode::Terms => {
                let key = rule.query_key.clone().unwrap_or_default();
                match self
                    .get_hits_terms(rule, start, end, &index, &key, None, None, ctx)
                    .await
                {
                    Ok(data) => {
                        if !data.is_empty() {
                            detector.add_terms_data(data);
                        }
                        true
                    }
                    Err(e) => {
                        self.handle_error(
                            &format!("Error running terms query: {}", e.truncated()),
                            Some(json!({"rule": rule.name})),
                        )
                        .await;
                        false
                    }
                }
            }
            QueryMode::Aggregation => {
                match self
                    .get_hits_aggregation(rule, state, start, end, &index, ctx)
                    .await
                {
                    Ok(data) => {
                        if !data.is_empty() {
                            detector.add_aggregation_data(data);
                        }
                        true
                    }
                    Err(e) => {
                        self.handle_error(
                            &format!("Error running query: {}", e.truncated()),
                            Some(json!({"rule": rule.name})),
                        )
                        .await;
                        false
                    }
                }
            }
            QueryMode::Search => {
                let mut success = true;
                let mut scroll = false;
                let descending = detector.sort_descending();
                loop {
                    state.scrolling_cycle += 1;
                    let page = match self
                        .get_hits(rule, state, start, end, &index, scroll, descending, ctx)
                        .await
                    {
                        Ok(page) => page,
                        Err(e) => {
                            self.handle_error(
                                &format!("Error running query: {}", e.truncated()),
                                Some(json!({"rule": rule.name, "start": dt_to_ts(&start), "end": dt_to_ts(&end)})),
                            )
                            .await;
                            success = false;
                            break;
                        }
                    };

                    let before = page.len();
                    let fresh = remove_duplicate_events(page, state, &rule.timestamp_field);
                    ctx.num_dupes += before - fresh.len();
                    if !fresh.is_empty() {
                        detector.add_data(fresh);
                    }

                    let more = state.scroll_id.is_some()
                        && (ctx.num_hits as u64) < ctx.total_hits
                        && detector.allows_scrolling()
                        && scrolling_may_continue(&self.conf, state.scrolling_cycle);
                    if !more {
                        break;
                    }
                    scroll = true;
                }
                // One cleanup on every exit path.
                self.cleanup_scroll(rule, state).await;
                success
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conf() -> Config {
        serde_yaml::from_str(
            "rules_folder: rules\nrun_every: {minutes: 1}\nbuffer_time: {minutes: 15}\nes_host: localhost\n",
        )
        .unwrap()
    }

    fn rule(yaml: &str) -> Rule {
        let mut rule: Rule = serde_yaml::from_str(yaml).unwrap();
        rule.finalize(&conf()).unwrap();
        rule
    }

    const BASE: &str = "name: r\ntype: any\nindex: logs-*\nalert: [debug]\n";

    #[test]
    fn static_index_passthrough() {
        let r = rule(BASE);
        assert_eq!(get_index(&r, None, None), "logs-*");
    }

    #[test]
    fn strftime_index_expands_window() {
        let r = rule("name: r\ntype: any\nindex: 'logs-%Y.%m.%d'\nalert: [debug]\nuse_strftime_index: true\n");
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();
        assert_eq!(get_index(&r, Some(start), Some(end)), "logs-2024.03.01,logs-2024.03.02");
        assert_eq!(get_index(&r, None, None), "logs-*");
    }

    #[test]
    fn process_hits_normalizes_and_folds_metadata() {
        let r = rule(BASE);
        let raw = vec![json!({
            "_id": "h1",
            "_index": "logs-2024.03.01",
            "_source": {"@timestamp": "2024-03-01T12:00:00+01:00", "user": "alice"},
        })];
        let processed = process_hits(&r, &raw);
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0]["_id"], json!("h1"));
        assert_eq!(processed[0]["_index"], json!("logs-2024.03.01"));
        // Normalized to UTC.
        assert_eq!(processed[0]["@timestamp"], json!("2024-03-01T11:00:00.000000Z"));
    }

    #[test]
    fn process_hits_merges_fields_and_unwraps_singletons() {
        let r = rule(BASE);
        let raw = vec![json!({
            "_id": "h1",
            "_source": {"@timestamp": "2024-03-01T12:00:00Z"},
            "fields": {"user": ["alice"], "tags": ["a", "b"]},
        })];
        let processed = process_hits(&r, &raw);
        assert_eq!(processed[0]["user"], json!("alice"));
        assert_eq!(processed[0]["tags"], json!(["a", "b"]));
    }

    #[test]
    fn process_hits_epoch_millis_timestamp() {
        let r = rule(BASE);
        let raw = vec![json!({
            "_id": "h1",
            "_source": {"@timestamp": 1709294400000_i64},
        })];
        let processed = process_hits(&r, &raw);
        assert_eq!(processed[0]["@timestamp"], json!("2024-03-01T12:00:00.000000Z"));
    }

    #[test]
    fn process_hits_drops_unparseable_timestamp() {
        let r = rule(BASE);
        let raw = vec![json!({"_id": "h1", "_source": {"user": "alice"}})];
        assert!(process_hits(&r, &raw).is_empty());
    }

    #[test]
    fn process_hits_builds_compound_query_key() {
        let r = rule(&format!("{BASE}query_key: [user, host]\n"));
        let raw = vec![json!({
            "_id": "h1",
            "_source": {"@timestamp": "2024-03-01T12:00:00Z", "user": "alice", "host": "web-1"},
        })];
        let processed = process_hits(&r, &raw);
        assert_eq!(processed[0]["user,host"], json!("alice, web-1"));
    }

    #[test]
    fn duplicate_events_are_dropped_and_remembered() {
        let r = rule(BASE);
        let mut state = RuleState::default();
        let event = |id: &str| json!({"_id": id, "@timestamp": "2024-03-01T12:00:00.000000Z"});

        let fresh = remove_duplicate_events(
            vec![event("h1"), event("h2")],
            &mut state,
            &r.timestamp_field,
        );
        assert_eq!(fresh.len(), 2);
        assert!(state.processed_hits.contains_key("h1"));

        let fresh = remove_duplicate_events(
            vec![event("h1"), event("h3")],
            &mut state,
            &r.timestamp_field,
        );
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0]["_id"], json!("h3"));
    }

    #[test]
    fn shard_parse_failures_become_errors() {
        let res = json!({
            "_shards": {"failures": [
                {"reason": {"reason": "Failed to parse query [foo]"}},
            ]},
            "hits": {"hits": [], "total": {"value": 0}},
        });
        let err = check_shard_failures(&res).unwrap_err();
        assert!(matches!(err, BackendError::ShardFailure(_)));
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn clean_shards_pass() {
        assert!(check_shard_failures(&json!({"_shards": {"failures": []}})).is_ok());
        assert!(check_shard_failures(&json!({"hits": {}})).is_ok());
    }

    #[test]
    fn scroll_guard_respects_cap() {
        let conf = conf();
        assert!(scrolling_may_continue(&conf, 0));
        assert!(scrolling_may_continue(&conf, 989));
        assert!(!scrolling_may_continue(&conf, 990));
    }
}

//! Backend query construction.
//!
//! Builds the JSON bodies for the four query modes and applies the
//! rule-level filter transforms (legacy filter flattening, blacklist/
//! whitelist query strings, keyed term filters).

use serde_json::{json, Value};
use tracing::{debug, warn};

use searchlight_core::Config;
use searchlight_rules::schema::{keyword_postfix, Rule};

/// Flatten the legacy `{query: X}` filter shape into `X`.
fn flatten_legacy_filters(filters: &[Value]) -> Vec<Value> {
    filters
        .iter()
        .map(|f| match f.get("query") {
            Some(inner) => inner.clone(),
            None => f.clone(),
        })
        .collect()
}

/// Base query: a boolean `must` conjunction of the rule's filters plus
/// a half-open `(start, end]` range on the timestamp field, optionally
/// sorted by timestamp.
pub fn get_query(
    filters: &[Value],
    starttime: Option<&str>,
    endtime: Option<&str>,
    timestamp_field: &str,
    sort: bool,
    descending: bool,
) -> Value {
    let mut must = flatten_legacy_filters(filters);
    if let (Some(start), Some(end)) = (starttime, endtime) {
        must.insert(
            0,
            json!({ "range": { timestamp_field: { "gt": start, "lte": end } } }),
        );
    }
    let mut query = json!({
        "query": { "bool": { "filter": { "bool": { "must": must } } } }
    });
    if sort {
        let order = if descending { "desc" } else { "asc" };
        query["sort"] = json!([{ timestamp_field: { "order": order } }]);
    }
    query
}

/// Turn a base query into a terms-aggregation query over one field.
pub fn get_terms_query(
    mut base_query: Value,
    rule: &Rule,
    size: u64,
    field: &str,
    conf: &Config,
) -> Value {
    if let Some(obj) = base_query.as_object_mut() {
        obj.remove("sort");
    }
    let mut field = field.to_string();
    let postfix = keyword_postfix(conf);
    if rule.raw_count_keys && !field.ends_with(postfix) {
        field.push_str(postfix);
    }
    base_query["aggs"] = json!({
        "counts": {
            "terms": {
                "field": field,
                "size": size,
                "min_doc_count": rule.min_doc_count,
            }
        }
    });
    base_query
}

/// Turn a base query into a metric-aggregation query.
///
/// The rule's `aggregation_query_element` is embedded verbatim,
/// optionally wrapped in a fixed-interval date histogram, and nested
/// inside terms buckets for each compound query key, innermost field
/// first, so the first configured key ends up outermost.
pub fn get_aggregation_query(
    mut base_query: Value,
    rule: &Rule,
    query_key: Option<&str>,
    terms_size: u64,
    timestamp_field: &str,
    bucket_offset_delta: Option<i64>,
) -> Value {
    if let Some(obj) = base_query.as_object_mut() {
        obj.remove("sort");
    }
    let metric_element = rule
        .aggregation_query_element
        .clone()
        .unwrap_or_else(|| json!({}));

    let mut aggs_element = match &rule.bucket_interval {
        Some(interval) => {
            let mut histogram = json!({
                "field": timestamp_field,
                "fixed_interval": format!("{}s", interval.total_seconds()),
            });
            if let Some(offset) = bucket_offset_delta {
                histogram["offset"] = json!(format!("+{}s", offset));
            }
            json!({
                "interval_aggs": {
                    "date_histogram": histogram,
                    "aggs": metric_element,
                }
            })
        }
        None => metric_element,
    };

    if let Some(query_key) = query_key {
        for key in query_key.split(',').rev() {
            aggs_element = json!({
                "bucket_aggs": {
                    "terms": {
                        "field": key,
                        "size": terms_size,
                        "min_doc_count": rule.min_doc_count,
                    },
                    "aggs": aggs_element,
                }
            });
        }
    }

    base_query["aggs"] = aggs_element;
    base_query
}

/// Append the blacklist/whitelist `query_string` filter to the rule's
/// filter list. Terms wrapped in `/…/` are emitted unquoted (regex).
///
/// Called once at rule init; the enhanced filter is part of the
/// immutable rule afterwards.
pub fn enhance_filter(rule: &mut Rule) {
    if !rule.filter_by_list {
        return;
    }
    let (terms, whitelist) = if !rule.blacklist.is_empty() {
        (&rule.blacklist, false)
    } else if !rule.whitelist.is_empty() {
        (&rule.whitelist, true)
    } else {
        return;
    };
    let Some(compare_key) = &rule.compare_key else {
        return;
    };

    let rendered: Vec<String> = terms
        .iter()
        .map(|term| {
            if term.starts_with('/') && term.ends_with('/') && term.len() > 1 {
                format!("{}:{}", compare_key, term)
            } else {
                format!("{}:\"{}\"", compare_key, term)
            }
        })
        .collect();

    let query = if whitelist {
        format!("NOT {}", rendered.join(" AND NOT "))
    } else {
        rendered.join(" OR ")
    };
    let query_str_filter = json!({ "query_string": { "query": query } });
    debug!(filter = %query_str_filter, "enhanced filter with list terms");
    rule.filter.push(query_str_filter);
}

/// Keyed term filters for top-count queries: zip the rule's query keys
/// against a comma-separated value string. With no query key configured
/// this yields nothing and the filter is left unkeyed.
pub fn query_key_filters(rule: &Rule, qk_value_csv: Option<&str>, conf: &Config) -> Vec<Value> {
    let Some(csv) = qk_value_csv else {
        return Vec::new();
    };

    let qk_values: Vec<&str> = csv.split(',').map(str::trim).collect();
    let query_keys: Vec<&str> = if !rule.compound_query_key.is_empty() {
        rule.compound_query_key.iter().map(String::as_str).collect()
    } else if let Some(qk) = &rule.query_key {
        vec![qk.as_str()]
    } else {
        return Vec::new();
    };

    if qk_values.len() != query_keys.len() {
        warn!(
            values = qk_values.len(),
            keys = query_keys.len(),
            csv = %csv,
            "query key value count does not match key count; did a value contain a comma?"
        );
    }

    let postfix = keyword_postfix(conf);
    query_keys
        .iter()
        .zip(qk_values.iter())
        .map(|(key, value)| {
            let mut key = key.to_string();
            if rule.raw_count_keys && !key.ends_with(postfix) {
                key.push_str(postfix);
            }
            json!({ "term": { key: value } })
        })
        .collect()
}

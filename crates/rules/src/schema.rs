//! Rule YAML schema with serde deserialization.
//!
//! A rule file is a flat YAML document; detector-specific parameters
//! (e.g. `num_events`) are captured in `params` and interpreted by the
//! detector registry. Cadence/query-size fields left unset fall back to
//! the global config at the point of use.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use searchlight_core::de::{default_true, opt_string_or_list};
use searchlight_core::{Config, Interval};

use crate::error::RuleError;

/// How a rule queries the backend each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Plain document search, optionally scrolled.
    Search,
    /// Count query; the detector receives `{endtime: count}`.
    Count,
    /// Terms aggregation; the detector receives `{endtime: buckets}`.
    Terms,
    /// Metric aggregation; the detector receives `{endtime: tree}`.
    Aggregation,
}

/// Fixed-delay or cron-scheduled aggregation deadline.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AggregationSpec {
    Schedule { schedule: String },
    Window(Interval),
}

/// A field reference that may be a single key or a compound key list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    One(String),
    Many(Vec<String>),
}

/// A configured detection rule.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,

    /// Detector type (`any`, `frequency`, `flatline`).
    #[serde(rename = "type")]
    pub detector_type: String,

    /// Index (pattern) to query; may carry strftime tokens.
    pub index: String,
    #[serde(default)]
    pub use_strftime_index: bool,
    /// Also search the day before the window start (late-indexed events).
    #[serde(default)]
    pub search_extra_index: bool,

    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,

    // ── Cadence & windows (None → global default) ───────────────────
    #[serde(default)]
    pub run_every: Option<Interval>,
    #[serde(default)]
    pub buffer_time: Option<Interval>,
    #[serde(default)]
    pub timeframe: Option<Interval>,
    #[serde(default)]
    pub query_delay: Option<Interval>,
    #[serde(default)]
    pub scan_entire_timeframe: bool,

    // ── Query construction ──────────────────────────────────────────
    #[serde(default)]
    pub filter: Vec<Value>,
    #[serde(default)]
    pub use_count_query: bool,
    #[serde(default)]
    pub use_terms_query: bool,
    /// Metric aggregation element embedded verbatim into the query.
    #[serde(default)]
    pub aggregation_query_element: Option<Value>,
    #[serde(default, rename = "query_key")]
    query_key_raw: Option<KeySpec>,
    #[serde(default, rename = "aggregation_key")]
    aggregation_key_raw: Option<KeySpec>,
    /// Effective query key (compound keys joined with `,`). Computed.
    #[serde(skip)]
    pub query_key: Option<String>,
    #[serde(skip)]
    pub compound_query_key: Vec<String>,
    #[serde(skip)]
    pub aggregation_key: Option<String>,
    #[serde(skip)]
    pub compound_aggregation_key: Vec<String>,

    #[serde(default)]
    pub terms_size: Option<u64>,
    #[serde(default = "default_min_doc_count")]
    pub min_doc_count: u64,
    #[serde(default = "default_true")]
    pub raw_count_keys: bool,

    #[serde(default)]
    pub bucket_interval: Option<Interval>,
    #[serde(default)]
    pub sync_bucket_interval: bool,
    #[serde(default)]
    pub allow_buffer_time_overlap: bool,
    #[serde(default)]
    pub use_run_every_query_size: bool,

    #[serde(default)]
    pub max_query_size: Option<usize>,
    #[serde(default)]
    pub scroll_keepalive: Option<String>,
    /// Restrict `_source` to these fields.
    #[serde(default)]
    pub include: Vec<String>,
    /// Request these as `fields` alongside `_source`.
    #[serde(default)]
    pub include_fields: Option<Vec<String>>,

    /// Convert query range bounds into this timezone.
    #[serde(default)]
    pub query_timezone: Option<String>,

    // ── Blacklist / whitelist ───────────────────────────────────────
    #[serde(default)]
    pub compare_key: Option<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default = "default_true")]
    pub filter_by_list: bool,

    // ── Alerting ────────────────────────────────────────────────────
    #[serde(default)]
    pub alert: Vec<String>,
    #[serde(default)]
    pub realert: Option<Interval>,
    #[serde(default)]
    pub exponential_realert: Option<Interval>,
    #[serde(default)]
    pub aggregation: Option<AggregationSpec>,
    #[serde(default)]
    pub aggregate_by_match_time: bool,
    #[serde(default)]
    pub aggregation_alert_time_compared_with_timestamp_field: bool,

    #[serde(default)]
    pub top_count_keys: Vec<String>,
    #[serde(default)]
    pub top_count_number: Option<usize>,

    #[serde(default)]
    pub match_enhancements: Vec<String>,
    #[serde(default)]
    pub run_enhancements_first: bool,

    /// Copy these rule params onto matches as `rule_param_<name>`.
    #[serde(default)]
    pub include_rule_params_in_matches: Vec<String>,
    #[serde(default)]
    pub include_rule_params_in_first_match_only: bool,
    /// Merge match fields into the root of the alert document.
    #[serde(default)]
    pub include_match_in_root: bool,

    // ── Alerter settings ────────────────────────────────────────────
    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub email: Vec<String>,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    #[serde(default)]
    pub from_addr: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_method: Option<String>,
    #[serde(default)]
    pub webhook_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub alert_subject: Option<String>,
    #[serde(default)]
    pub alert_text: Option<String>,

    // ── Discover URLs ───────────────────────────────────────────────
    #[serde(default)]
    pub generate_kibana_discover_url: bool,
    #[serde(default)]
    pub kibana_discover_app_url: Option<String>,
    #[serde(default)]
    pub kibana_discover_index_pattern_id: Option<String>,
    #[serde(default)]
    pub kibana_discover_columns: Vec<String>,
    #[serde(default)]
    pub generate_opensearch_discover_url: bool,
    #[serde(default)]
    pub opensearch_discover_app_url: Option<String>,
    #[serde(default)]
    pub opensearch_discover_index_pattern_id: Option<String>,

    // ── Scheduling & lifecycle ──────────────────────────────────────
    /// Cron expression gating when ticks may run.
    #[serde(default)]
    pub limit_execution: Option<String>,
    /// Skip coverage of paused periods when gated.
    #[serde(default)]
    pub limit_execution_coverage: bool,
    #[serde(default = "default_true")]
    pub is_enabled: bool,

    // ── Backend overrides ───────────────────────────────────────────
    #[serde(default)]
    pub es_host: Option<String>,
    #[serde(default)]
    pub es_port: Option<u16>,

    // ── Metadata & notification ─────────────────────────────────────
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub notify_email: Vec<String>,

    /// Detector-specific parameters (e.g. `num_events`).
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

fn default_min_doc_count() -> u64 {
    1
}

impl Rule {
    /// Resolve computed fields and validate cross-field constraints.
    ///
    /// Called once by the loader after deserialization; the rule is
    /// immutable afterwards.
    pub fn finalize(&mut self, conf: &Config) -> Result<(), RuleError> {
        if self.name.is_empty() {
            return Err(RuleError::Validation("rule name must not be empty".into()));
        }
        if self.use_count_query && self.use_terms_query {
            return Err(RuleError::Validation(format!(
                "rule '{}': use_count_query and use_terms_query are mutually exclusive",
                self.name
            )));
        }

        let (qk, compound_qk) = split_key_spec(self.query_key_raw.take());
        self.query_key = qk;
        self.compound_query_key = compound_qk;
        let (ak, compound_ak) = split_key_spec(self.aggregation_key_raw.take());
        self.aggregation_key = ak;
        self.compound_aggregation_key = compound_ak;

        if self.use_terms_query && self.query_key.is_none() {
            return Err(RuleError::Validation(format!(
                "rule '{}': use_terms_query requires query_key",
                self.name
            )));
        }
        if (!self.blacklist.is_empty() || !self.whitelist.is_empty())
            && self.compare_key.is_none()
        {
            return Err(RuleError::Validation(format!(
                "rule '{}': blacklist/whitelist require compare_key",
                self.name
            )));
        }
        if !self.blacklist.is_empty() && !self.whitelist.is_empty() {
            return Err(RuleError::Validation(format!(
                "rule '{}': blacklist and whitelist cannot both be set",
                self.name
            )));
        }
        if self.scan_entire_timeframe && self.timeframe.is_none() {
            return Err(RuleError::Validation(format!(
                "rule '{}': scan_entire_timeframe requires timeframe",
                self.name
            )));
        }
        if self.sync_bucket_interval && self.bucket_interval.is_none() {
            return Err(RuleError::Validation(format!(
                "rule '{}': sync_bucket_interval requires bucket_interval",
                self.name
            )));
        }
        if let Some(expr) = &self.limit_execution {
            parse_cron(expr).map_err(|e| {
                RuleError::Validation(format!(
                    "rule '{}': invalid limit_execution cron '{}': {}",
                    self.name, expr, e
                ))
            })?;
        }
        if let Some(AggregationSpec::Schedule { schedule }) = &self.aggregation {
            parse_cron(schedule).map_err(|e| {
                RuleError::Validation(format!(
                    "rule '{}': invalid aggregation schedule '{}': {}",
                    self.name, schedule, e
                ))
            })?;
        }

        // Keyword postfix on top_count_keys.
        if self.raw_count_keys {
            let postfix = keyword_postfix(conf);
            for key in &mut self.top_count_keys {
                if !key.ends_with(postfix) {
                    key.push_str(postfix);
                }
            }
        }

        Ok(())
    }

    pub fn query_mode(&self) -> QueryMode {
        if self.use_count_query {
            QueryMode::Count
        } else if self.use_terms_query {
            QueryMode::Terms
        } else if self.aggregation_query_element.is_some() {
            QueryMode::Aggregation
        } else {
            QueryMode::Search
        }
    }

    /// Base key under which this rule's alerts are silenced.
    pub fn realert_key(&self) -> &str {
        &self.name
    }

    /// Realert window; rules without an explicit setting get one minute.
    pub fn realert(&self) -> Interval {
        self.realert.unwrap_or_else(|| Interval::minutes(1))
    }

    pub fn buffer_time(&self, conf: &Config) -> Interval {
        self.buffer_time.unwrap_or(conf.buffer_time)
    }

    pub fn run_every(&self, conf: &Config) -> Interval {
        self.run_every.unwrap_or(conf.run_every)
    }

    pub fn max_query_size(&self, conf: &Config) -> usize {
        self.max_query_size.unwrap_or(conf.max_query_size)
    }

    pub fn scroll_keepalive<'a>(&'a self, conf: &'a Config) -> &'a str {
        self.scroll_keepalive
            .as_deref()
            .unwrap_or(&conf.scroll_keepalive)
    }

    pub fn terms_size(&self) -> u64 {
        self.terms_size.unwrap_or(50)
    }

    /// A rule parameter by name, for `include_rule_params_in_matches`.
    pub fn param(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::String(self.name.clone())),
            "index" => Some(Value::String(self.index.clone())),
            "description" => self.description.clone().map(Value::String),
            "category" => self.category.clone().map(Value::String),
            "owner" => self.owner.clone().map(Value::String),
            "priority" => self.priority.map(Value::from),
            _ => self.params.get(name).cloned(),
        }
    }
}

fn split_key_spec(spec: Option<KeySpec>) -> (Option<String>, Vec<String>) {
    match spec {
        None => (None, Vec::new()),
        Some(KeySpec::One(key)) => (Some(key), Vec::new()),
        Some(KeySpec::Many(keys)) if keys.len() == 1 => {
            (keys.into_iter().next(), Vec::new())
        }
        Some(KeySpec::Many(keys)) => (Some(keys.join(",")), keys),
    }
}

/// Multi-field postfix appended to keyed fields (`.keyword` unless
/// overridden by `string_multi_field_name`).
pub fn keyword_postfix(conf: &Config) -> &str {
    conf.string_multi_field_name.as_deref().unwrap_or(".keyword")
}

/// Normalize a 5-field cron expression to the 6-field form the `cron`
/// crate requires, by prepending a seconds field.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parse a (5- or 6-field) cron expression.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    use std::str::FromStr;
    cron::Schedule::from_str(&normalize_cron(expr))
}

//! The `frequency` detector: at least `num_events` events within
//! `timeframe`, optionally tracked per `query_key` value.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use searchlight_core::keys::{key_fragment, lookup_es_key};
use searchlight_core::time::{dt_to_ts, ts_to_dt};

use crate::error::RuleError;
use crate::schema::Rule;

use super::{Detector, TermsBucket};

/// Sliding-window event counter keyed by query-key value.
pub struct FrequencyDetector {
    timestamp_field: String,
    query_key: Option<String>,
    num_events: u64,
    timeframe: Duration,
    /// Per-key window of (event time, weight, sample event).
    occurrences: HashMap<String, VecDeque<(DateTime<Utc>, u64, Value)>>,
    matches: Vec<Value>,
}

impl FrequencyDetector {
    pub fn from_rule(rule: &Rule) -> Result<Self, RuleError> {
        let num_events = rule
            .params
            .get("num_events")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                RuleError::Validation(format!(
                    "rule '{}': frequency requires num_events",
                    rule.name
                ))
            })?;
        let timeframe = rule.timeframe.ok_or_else(|| {
            RuleError::Validation(format!("rule '{}': frequency requires timeframe", rule.name))
        })?;
        Ok(Self {
            timestamp_field: rule.timestamp_field.clone(),
            query_key: rule.query_key.clone(),
            num_events,
            timeframe: timeframe.duration(),
            occurrences: HashMap::new(),
            matches: Vec::new(),
        })
    }

    fn key_for(&self, event: &Value) -> String {
        match &self.query_key {
            Some(qk) => key_fragment(lookup_es_key(event, qk)),
            None => "_all".to_string(),
        }
    }

    fn record(&mut self, key: String, ts: DateTime<Utc>, weight: u64, event: Value) {
        let window = self.occurrences.entry(key.clone()).or_default();
        window.push_back((ts, weight, event));
        while let Some((oldest, _, _)) = window.front() {
            if ts - *oldest > self.timeframe {
                window.pop_front();
            } else {
                break;
            }
        }
        let total: u64 = window.iter().map(|(_, w, _)| w).sum();
        if total >= self.num_events {
            if let Some((_, _, sample)) = window.back() {
                let mut m = sample.clone();
                if let Some(obj) = m.as_object_mut() {
                    obj.insert("count".to_string(), json!(total));
                }
                self.matches.push(m);
            }
            self.occurrences.remove(&key);
        }
    }
}

impl Detector for FrequencyDetector {
    fn add_data(&mut self, hits: Vec<Value>) {
        for hit in hits {
            let ts = lookup_es_key(&hit, &self.timestamp_field)
                .and_then(Value::as_str)
                .and_then(|s| ts_to_dt(s).ok());
            let Some(ts) = ts else {
                tracing::warn!(field = %self.timestamp_field, "event without parseable timestamp, skipping");
                continue;
            };
            let key = self.key_for(&hit);
            self.record(key, ts, 1, hit);
        }
    }

    fn add_count_data(&mut self, counts: Vec<(DateTime<Utc>, u64)>) {
        for (ts, count) in counts {
            if count == 0 {
                continue;
            }
            let event = json!({ (self.timestamp_field.clone()): dt_to_ts(&ts) });
            self.record("_all".to_string(), ts, count, event);
        }
    }

    fn add_terms_data(&mut self, terms: Vec<(DateTime<Utc>, Vec<TermsBucket>)>) {
        for (ts, buckets) in terms {
            for bucket in buckets {
                if bucket.doc_count == 0 {
                    continue;
                }
                let key = key_fragment(Some(&bucket.key));
                let mut event = json!({ (self.timestamp_field.clone()): dt_to_ts(&ts) });
                if let (Some(qk), Some(obj)) = (&self.query_key, event.as_object_mut()) {
                    obj.insert(qk.clone(), bucket.key.clone());
                }
                self.record(key, ts, bucket.doc_count, event);
            }
        }
    }

    fn garbage_collect(&mut self, now: DateTime<Utc>) {
        let timeframe = self.timeframe;
        for window in self.occurrences.values_mut() {
            while let Some((oldest, _, _)) = window.front() {
                if now - *oldest > timeframe {
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
        self.occurrences.retain(|_, window| !window.is_empty());
    }

    fn matches_mut(&mut self) -> &mut Vec<Value> {
        &mut self.matches
    }
}

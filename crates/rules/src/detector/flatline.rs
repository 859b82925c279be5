//! The `flatline` detector: fires when fewer than `threshold` events
//! arrive within `timeframe`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use searchlight_core::keys::{key_fragment, lookup_es_key};
use searchlight_core::time::{dt_to_ts, ts_to_dt};

use crate::error::RuleError;
use crate::schema::Rule;

use super::Detector;

/// Absence detector. A key is only eligible once it has been observed
/// for a full timeframe, so a freshly loaded rule does not fire on
/// startup.
pub struct FlatlineDetector {
    timestamp_field: String,
    query_key: Option<String>,
    threshold: u64,
    timeframe: Duration,
    /// Whether a key is dropped (and must re-appear) after it fires.
    forget_keys: bool,
    occurrences: HashMap<String, VecDeque<(DateTime<Utc>, u64)>>,
    first_seen: HashMap<String, DateTime<Utc>>,
    matches: Vec<Value>,
}

impl FlatlineDetector {
    pub fn from_rule(rule: &Rule) -> Result<Self, RuleError> {
        let threshold = rule
            .params
            .get("threshold")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                RuleError::Validation(format!("rule '{}': flatline requires threshold", rule.name))
            })?;
        let timeframe = rule.timeframe.ok_or_else(|| {
            RuleError::Validation(format!("rule '{}': flatline requires timeframe", rule.name))
        })?;
        Ok(Self {
            timestamp_field: rule.timestamp_field.clone(),
            query_key: rule.query_key.clone(),
            threshold,
            timeframe: timeframe.duration(),
            forget_keys: rule
                .params
                .get("forget_keys")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            occurrences: HashMap::new(),
            first_seen: HashMap::new(),
            matches: Vec::new(),
        })
    }

    fn record(&mut self, key: String, ts: DateTime<Utc>, weight: u64) {
        self.first_seen.entry(key.clone()).or_insert(ts);
        self.occurrences.entry(key).or_default().push_back((ts, weight));
    }
}

impl Detector for FlatlineDetector {
    fn add_data(&mut self, hits: Vec<Value>) {
        for hit in hits {
            let ts = lookup_es_key(&hit, &self.timestamp_field)
                .and_then(Value::as_str)
                .and_then(|s| ts_to_dt(s).ok());
            let Some(ts) = ts else { continue };
            let key = match &self.query_key {
                Some(qk) => key_fragment(lookup_es_key(&hit, qk)),
                None => "_all".to_string(),
            };
            self.record(key, ts, 1);
        }
    }

    fn add_count_data(&mut self, counts: Vec<(DateTime<Utc>, u64)>) {
        for (ts, count) in counts {
            self.record("_all".to_string(), ts, count);
        }
    }

    fn garbage_collect(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.timeframe;
        let mut fired = Vec::new();

        for (key, window) in &mut self.occurrences {
            while let Some((oldest, _)) = window.front() {
                if *oldest < horizon {
                    window.pop_front();
                } else {
                    break;
                }
            }
            // Only keys observed for a full timeframe can fire.
            let eligible = self
                .first_seen
                .get(key)
                .is_some_and(|first| now - *first >= self.timeframe);
            if !eligible {
                continue;
            }
            let count: u64 = window.iter().map(|(_, w)| w).sum();
            if count < self.threshold {
                self.matches.push(json!({
                    (self.timestamp_field.clone()): dt_to_ts(&now),
                    "key": key,
                    "count": count,
                }));
                fired.push(key.clone());
            }
        }

        for key in fired {
            if self.forget_keys {
                self.occurrences.remove(&key);
                self.first_seen.remove(&key);
            } else {
                // Restart the observation window so the rule does not
                // re-fire every tick while the key stays quiet.
                self.first_seen.insert(key, now);
            }
        }
    }

    fn matches_mut(&mut self) -> &mut Vec<Value> {
        &mut self.matches
    }

    fn allows_scrolling(&self) -> bool {
        false
    }

    fn triggers_on_absence(&self) -> bool {
        true
    }
}

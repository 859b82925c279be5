//! Silence cache and exponential realert backoff.
//!
//! The in-memory cache is an accelerator only; on a miss the durable
//! silence documents in the writeback store are authoritative, so
//! silences survive restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info};

use searchlight_core::time::{dt_to_ts, ts_now, ts_to_dt};
use searchlight_rules::Rule;

use crate::backend::{SearchBackend, SearchOptions, WritebackKind};
use crate::writeback::WritebackWriter;

pub struct SilenceTracker {
    /// silence key → (until, exponent).
    cache: Mutex<HashMap<String, (DateTime<Utc>, i64)>>,
    backend: Arc<dyn SearchBackend>,
    writeback: WritebackWriter,
    debug: bool,
}

impl SilenceTracker {
    pub fn new(backend: Arc<dyn SearchBackend>, writeback: WritebackWriter, debug: bool) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            backend,
            writeback,
            debug,
        }
    }

    /// Whether alerts for `key` are currently suppressed.
    ///
    /// Expired cache entries are evicted and the durable store is
    /// consulted; lookup errors fail open (not silenced).
    pub async fn is_silenced(&self, key: &str) -> bool {
        {
            let mut cache = self.cache.lock().expect("silence cache lock poisoned");
            if let Some((until, _)) = cache.get(key) {
                if ts_now() < *until {
                    return true;
                }
                cache.remove(key);
            }
        }

        if self.debug {
            return false;
        }

        let query = json!({
            "query": { "term": { "rule_name": key } },
            "sort": [{ "until": { "order": "desc" } }],
        });
        let index = self.writeback.index_for(WritebackKind::Silence);
        let opts = SearchOptions {
            size: Some(1),
            source_includes: Some(vec!["until".to_string(), "exponent".to_string()]),
            ..SearchOptions::default()
        };
        let res = match self.backend.search(&index, &query, opts).await {
            Ok(res) => res,
            Err(e) => {
                debug!(key = %key, error = %e.truncated(), "error querying silence status");
                return false;
            }
        };

        let Some(hit) = res["hits"]["hits"].get(0) else {
            return false;
        };
        let Some(until) = hit["_source"]["until"]
            .as_str()
            .and_then(|s| ts_to_dt(s).ok())
        else {
            return false;
        };
        let exponent = hit["_source"]["exponent"].as_i64().unwrap_or(0);

        {
            let mut cache = self.cache.lock().expect("silence cache lock poisoned");
            // A cached exponent survives the refresh; the durable doc
            // only overrides the deadline.
            let exponent = cache.get(key).map(|(_, e)| *e).unwrap_or(exponent);
            cache.insert(key.to_string(), (until, exponent));
        }
        ts_now() < until
    }

    /// Write a silence for `key` to both the cache and the durable
    /// store. Returns the writeback document id when persisted.
    pub async fn set_realert(
        &self,
        key: &str,
        until: DateTime<Utc>,
        exponent: i64,
    ) -> Option<String> {
        self.cache
            .lock()
            .expect("silence cache lock poisoned")
            .insert(key.to_string(), (until, exponent));
        self.writeback
            .write(
                WritebackKind::Silence,
                json!({
                    "rule_name": key,
                    "until": dt_to_ts(&until),
                    "exponent": exponent,
                }),
            )
            .await
    }

    /// Compute the next silence deadline and exponent for `key`.
    ///
    /// Without `exponential_realert` this is always `now + realert`.
    /// Otherwise the exponent grows when alerts fire inside the current
    /// backoff window and decays as quiet time accumulates; the wait is
    /// capped at `exponential_realert`.
    pub fn next_alert_time(&self, rule: &Rule, key: &str, now: DateTime<Utc>) -> (DateTime<Utc>, i64) {
        let realert = rule.realert().duration();
        let cached = self
            .cache
            .lock()
            .expect("silence cache lock poisoned")
            .get(key)
            .copied();

        let Some((last_until, mut exponent)) = cached else {
            // First alert, or the durable store was unreachable.
            return (now + realert, 0);
        };
        let Some(exponential_cap) = rule.exponential_realert else {
            return (now + realert, 0);
        };

        let realert_secs = realert.num_seconds();
        let mut diff = (now - last_until).num_seconds();
        if diff < backoff_secs(realert_secs, exponent) {
            exponent += 1;
        } else {
            while diff > backoff_secs(realert_secs, exponent) && exponent > 0 {
                diff -= backoff_secs(realert_secs, exponent);
                exponent -= 1;
            }
        }

        let wait = Duration::seconds(backoff_secs(realert_secs, exponent));
        if wait >= exponential_cap.duration() {
            return (now + exponential_cap.duration(), exponent - 1);
        }
        (now + wait, exponent)
    }

    /// Evict expired cache entries (memory GC).
    pub fn cleanup(&self) -> usize {
        let now = ts_now();
        let mut cache = self.cache.lock().expect("silence cache lock poisoned");
        let before = cache.len();
        cache.retain(|_, (until, _)| now < *until);
        let evicted = before - cache.len();
        if evicted > 0 {
            info!(evicted, "evicted expired silence cache entries");
        }
        evicted
    }

    #[cfg(test)]
    pub fn cached(&self, key: &str) -> Option<(DateTime<Utc>, i64)> {
        self.cache.lock().unwrap().get(key).copied()
    }
}

/// `realert * 2^exponent` in seconds, saturating.
fn backoff_secs(realert_secs: i64, exponent: i64) -> i64 {
    let shift = exponent.clamp(0, 32) as u32;
    realert_secs.saturating_mul(1_i64 << shift)
}

//! Per-rule mutable state and the per-tick scratch context.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use searchlight_rules::Detector;

/// Mutable execution state owned by a rule's executor.
///
/// Guarded by the rule's runtime mutex; touched by the rule's own tick,
/// the aggregation drain, and (via try-lock) the memory GC task.
#[derive(Default)]
pub struct RuleState {
    /// Next window start.
    pub starttime: Option<DateTime<Utc>>,
    pub previous_endtime: Option<DateTime<Utc>>,
    /// Lower bound from a persisted resume point.
    pub minimum_starttime: Option<DateTime<Utc>>,
    /// Window start before segmenting, for status reporting.
    pub original_starttime: Option<DateTime<Utc>>,
    /// Seeded from `--start`; consumed by the first tick.
    pub initial_starttime: Option<DateTime<Utc>>,
    /// Pause target for cron-gated rules.
    pub next_starttime: Option<DateTime<Utc>>,
    pub next_min_starttime: Option<DateTime<Utc>>,

    /// Active scroll cursor, if any.
    pub scroll_id: Option<String>,
    /// Scroll continuation counter within one window.
    pub scrolling_cycle: u32,
    /// Histogram offset computed by bucket alignment, consumed by the
    /// query builder.
    pub bucket_offset_delta: Option<i64>,

    /// Seen-hit dedupe map: document id → normalized event timestamp.
    pub processed_hits: HashMap<String, DateTime<Utc>>,

    /// In-memory pending matches awaiting an aggregation deadline
    /// (fallback when writeback persistence failed).
    pub agg_matches: Vec<Value>,
    /// Aggregation key → persisted pending-alert document id.
    pub current_aggregate_id: HashMap<Option<String>, String>,
    /// Aggregation key → group deadline.
    pub aggregate_alert_time: HashMap<Option<String>, DateTime<Utc>>,

    pub has_run_once: bool,
}

impl RuleState {
    /// Drop processed-hit entries older than the horizon
    /// (`buffer_time + query_delay`).
    pub fn remove_old_events(&mut self, now: DateTime<Utc>, horizon: Duration) {
        self.processed_hits.retain(|_, ts| now - *ts <= horizon);
    }

    /// Evict aggregate deadlines that have passed, with their linked
    /// pending-alert ids.
    pub fn remove_expired_aggregates(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Option<String>> = self
            .aggregate_alert_time
            .iter()
            .filter(|(_, deadline)| now > **deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.aggregate_alert_time.remove(key);
            self.current_aggregate_id.remove(key);
        }
        expired.len()
    }

    /// Adopt the carried-over state of a prior instance of this rule
    /// (config reload preserves progress and pending work).
    pub fn carry_over(&mut self, prior: &mut RuleState) {
        self.agg_matches = std::mem::take(&mut prior.agg_matches);
        self.current_aggregate_id = std::mem::take(&mut prior.current_aggregate_id);
        self.aggregate_alert_time = std::mem::take(&mut prior.aggregate_alert_time);
        self.processed_hits = std::mem::take(&mut prior.processed_hits);
        self.starttime = prior.starttime;
        self.minimum_starttime = prior.minimum_starttime;
        self.has_run_once = prior.has_run_once;
    }
}

/// A rule's state together with its detector, under one lock.
pub struct RuleRuntime {
    pub state: RuleState,
    pub detector: Box<dyn Detector>,
}

/// Per-tick scratch counters, passed down the executor/runner call
/// chain. Never shared across tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickContext {
    /// Hits seen in the current query (reset per segment).
    pub num_hits: usize,
    /// Hits dropped by `_id` dedupe.
    pub num_dupes: usize,
    /// Hits accumulated across segments.
    pub cumulative_hits: usize,
    /// `hits.total.value` reported by the last search.
    pub total_hits: u64,
    pub alerts_sent: usize,
}

impl TickContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn remove_old_events_enforces_horizon() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut state = RuleState::default();
        state
            .processed_hits
            .insert("fresh".to_string(), now - Duration::minutes(5));
        state
            .processed_hits
            .insert("stale".to_string(), now - Duration::minutes(30));
        state.remove_old_events(now, Duration::minutes(16));
        assert!(state.processed_hits.contains_key("fresh"));
        assert!(!state.processed_hits.contains_key("stale"));
    }

    #[test]
    fn expired_aggregates_drop_their_ids() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut state = RuleState::default();
        let key = Some("k".to_string());
        state
            .aggregate_alert_time
            .insert(key.clone(), now - Duration::minutes(1));
        state.current_aggregate_id.insert(key.clone(), "id-1".to_string());
        state
            .aggregate_alert_time
            .insert(Some("live".to_string()), now + Duration::minutes(5));
        assert_eq!(state.remove_expired_aggregates(now), 1);
        assert!(!state.current_aggregate_id.contains_key(&key));
        assert!(state
            .aggregate_alert_time
            .contains_key(&Some("live".to_string())));
    }

    #[test]
    fn carry_over_preserves_progress() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut prior = RuleState {
            starttime: Some(now),
            minimum_starttime: Some(now - Duration::minutes(5)),
            has_run_once: true,
            ..RuleState::default()
        };
        prior.processed_hits.insert("h1".to_string(), now);
        prior.agg_matches.push(serde_json::json!({"a": 1}));

        let mut fresh = RuleState::default();
        fresh.carry_over(&mut prior);
        assert_eq!(fresh.starttime, Some(now));
        assert!(fresh.has_run_once);
        assert_eq!(fresh.processed_hits.len(), 1);
        assert_eq!(fresh.agg_matches.len(), 1);
        // Cursor fields like previous_endtime start fresh.
        assert!(fresh.previous_endtime.is_none());
    }
}

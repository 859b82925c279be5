//! Time cursor logic: where the next query window starts.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::info;

use searchlight_core::time::{dt_to_unix, ts_now, ts_to_dt, unix_to_dt};
use searchlight_core::Config;
use searchlight_rules::schema::QueryMode;
use searchlight_rules::Rule;

use crate::backend::{SearchOptions, WritebackKind};
use crate::engine::Engine;
use crate::state::RuleState;

/// Segment width for walking a tick's window: `buffer_time` for
/// queries that may overlap, `run_every` for queries that must stay
/// strictly separate. This mimics the query size of continuous
/// operation when catching up over a long period.
pub fn segment_size(rule: &Rule, conf: &Config) -> Duration {
    match rule.query_mode() {
        QueryMode::Search => rule.buffer_time(conf).duration(),
        QueryMode::Aggregation => {
            if rule.use_run_every_query_size {
                conf.run_every.duration()
            } else {
                rule.buffer_time(conf).duration()
            }
        }
        QueryMode::Count | QueryMode::Terms => conf.run_every.duration(),
    }
}

/// Widen the window backwards for aggregation rules that allow their
/// buffer to overlap consecutive runs.
fn adjust_overlap(rule: &Rule, conf: &Config, state: &mut RuleState) {
    if rule.aggregation_query_element.is_some()
        && rule.allow_buffer_time_overlap
        && !rule.use_run_every_query_size
        && rule.buffer_time(conf).duration() > rule.run_every(conf).duration()
    {
        if let Some(start) = state.starttime {
            let adjusted =
                start - (rule.buffer_time(conf).duration() - rule.run_every(conf).duration());
            state.starttime = Some(adjusted);
            state.original_starttime = Some(adjusted);
        }
    }
}

/// Align the window to the aggregation bucket interval. With
/// `sync_bucket_interval` both edges shift down by the offset;
/// otherwise the offset is recorded for the query builder's histogram.
/// Returns the effective endtime.
fn adjust_interval_sync(
    rule: &Rule,
    state: &mut RuleState,
    endtime: DateTime<Utc>,
) -> DateTime<Utc> {
    if rule.aggregation_query_element.is_none() {
        return endtime;
    }
    let Some(interval) = rule.bucket_interval else {
        return endtime;
    };
    let delta_secs = interval.total_seconds();
    if delta_secs <= 0 {
        return endtime;
    }
    let Some(start) = state.starttime else {
        return endtime;
    };

    let offset = dt_to_unix(&start).rem_euclid(delta_secs);
    if rule.sync_bucket_interval {
        state.starttime = Some(unix_to_dt(dt_to_unix(&start) - offset));
        unix_to_dt(dt_to_unix(&endtime) - offset)
    } else {
        state.bucket_offset_delta = Some(offset);
        endtime
    }
}

impl Engine {
    /// Query writeback for the most recent run endtime of this rule.
    /// A resume point older than `old_query_limit` is ignored.
    pub(crate) async fn get_rule_starttime(&self, rule: &Rule) -> Option<DateTime<Utc>> {
        let query = json!({
            "query": { "bool": { "filter": { "term": { "rule_name": rule.name } } } },
            "sort": [{ "@timestamp": { "order": "desc" } }],
        });
        let index = self.writeback.index_for(WritebackKind::Status);
        let opts = SearchOptions {
            size: Some(1),
            source_includes: Some(vec!["endtime".to_string(), "rule_name".to_string()]),
            ..SearchOptions::default()
        };

        let res = match self.backend.search(&index, &query, opts).await {
            Ok(res) => res,
            Err(e) => {
                self.handle_error(
                    &format!("Error querying for last run: {}", e.truncated()),
                    Some(json!({"rule": rule.name})),
                )
                .await;
                return None;
            }
        };

        let endtime = res["hits"]["hits"]
            .get(0)?["_source"]["endtime"]
            .as_str()
            .and_then(|s| ts_to_dt(s).ok())?;
        if ts_now() - endtime < self.conf.old_query_limit.duration() {
            Some(endtime)
        } else {
            info!(rule = %rule.name, endtime = %endtime, "found expired previous run");
            None
        }
    }

    /// Compute the window start for this tick (unless a start was
    /// forced), clamping so that windows never regress behind the
    /// resume point or the previous endtime. Returns the effective
    /// endtime, which bucket alignment may have shifted.
    pub(crate) async fn set_starttime(
        &self,
        rule: &Rule,
        state: &mut RuleState,
        endtime: DateTime<Utc>,
    ) -> DateTime<Utc> {
        // First tick: resume from the last persisted run when possible.
        if state.starttime.is_none() && !rule.scan_entire_timeframe {
            if let Some(last_end) = self.get_rule_starttime(rule).await {
                state.starttime = Some(last_end);
                adjust_overlap(rule, &self.conf, state);
                let endtime = adjust_interval_sync(rule, state, endtime);
                state.minimum_starttime = state.starttime;
                return endtime;
            }
        }

        match rule.query_mode() {
            QueryMode::Count | QueryMode::Terms => {
                state.starttime = Some(if rule.scan_entire_timeframe {
                    endtime - timeframe_or_buffer(rule, &self.conf)
                } else {
                    // Continue from the previous run, or one run_every.
                    state
                        .previous_endtime
                        .unwrap_or(endtime - self.conf.run_every.duration())
                });
                endtime
            }
            _ => {
                let window = if rule.scan_entire_timeframe {
                    timeframe_or_buffer(rule, &self.conf)
                } else {
                    rule.buffer_time(&self.conf).duration()
                };
                let mut start = endtime - window;
                if let Some(min_start) = state.minimum_starttime {
                    if min_start > start {
                        start = min_start;
                    }
                }
                state.starttime = Some(start);
                if let Some(prev_end) = state.previous_endtime {
                    if prev_end > start {
                        state.starttime = Some(prev_end);
                        adjust_overlap(rule, &self.conf, state);
                    }
                }
                adjust_interval_sync(rule, state, endtime)
            }
        }
    }
}

fn timeframe_or_buffer(rule: &Rule, conf: &Config) -> Duration {
    rule.timeframe
        .map(|t| t.duration())
        .unwrap_or_else(|| rule.buffer_time(conf).duration())
}

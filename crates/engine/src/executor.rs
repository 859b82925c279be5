//! Rule tick orchestration: window segmentation, data ingestion, match
//! draining, silencing, and routing to dispatch or aggregation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use searchlight_core::time::{dt_to_ts, dt_to_unix, pretty_ts, ts_now};
use searchlight_rules::schema::{parse_cron, QueryMode};
use searchlight_rules::EnhancementError;

use crate::backend::WritebackKind;
use crate::cursor::segment_size;
use crate::dispatch::query_key_value;
use crate::engine::{Engine, RuleHandle};
use crate::error::{EngineError, Result};
use crate::state::{RuleRuntime, TickContext};

impl Engine {
    /// Run one rule over `[starttime, endtime]`, querying in segments
    /// and processing every match the detector emits. Returns the
    /// number of matches.
    pub(crate) async fn run_rule(
        &self,
        rh: &Arc<RuleHandle>,
        runtime: &mut RuleRuntime,
        endtime: DateTime<Utc>,
        initial_start: Option<DateTime<Utc>>,
        ctx: &mut TickContext,
    ) -> Result<usize> {
        let rule = &rh.rule;
        let run_start = std::time::Instant::now();

        // Retry in-memory pending aggregates; failed persists fall
        // back into agg_matches.
        let carried = std::mem::take(&mut runtime.state.agg_matches);
        for event in carried {
            self.add_aggregated_alert(rh, &mut runtime.state, event).await;
        }

        let mut endtime = endtime;
        if let Some(start) = initial_start {
            runtime.state.starttime = Some(start);
        } else {
            endtime = self.set_starttime(rule, &mut runtime.state, endtime).await;
        }
        runtime.state.original_starttime = runtime.state.starttime;
        runtime.state.scrolling_cycle = 0;

        let starttime = runtime.state.starttime.ok_or_else(|| {
            EngineError::Internal(format!("rule {} has no computed starttime", rule.name))
        })?;
        if ts_now() <= starttime {
            warn!(
                rule = %rule.name,
                starttime = %starttime,
                "attempted to use a query start time in the future, sleeping instead"
            );
            return Ok(0);
        }

        // Walk the window in segments, mimicking continuous operation
        // when catching up over a long period.
        let segment = segment_size(rule, &self.conf);
        let mut cursor = starttime;
        let mut tmp_endtime = starttime;

        while endtime - cursor > segment {
            tmp_endtime += segment;
            if !self.run_query(rh, runtime, cursor, tmp_endtime, ctx).await {
                return Ok(0);
            }
            ctx.cumulative_hits += ctx.num_hits;
            ctx.num_hits = 0;
            cursor = tmp_endtime;
            runtime.state.starttime = Some(cursor);
            runtime.detector.garbage_collect(cursor);
        }

        if rule.query_mode() == QueryMode::Aggregation {
            // Bucket-aligned rules only ever query whole segments.
            let tail = endtime - tmp_endtime;
            if tail == segment {
                if !self.run_query(rh, runtime, tmp_endtime, endtime, ctx).await {
                    return Ok(0);
                }
                ctx.cumulative_hits += ctx.num_hits;
            } else if runtime
                .state
                .original_starttime
                .is_some_and(|orig| (orig - tmp_endtime).num_seconds() == 0)
            {
                runtime.state.starttime = runtime.state.original_starttime;
                return Ok(0);
            } else {
                endtime = tmp_endtime;
            }
        } else {
            if !self.run_query(rh, runtime, cursor, endtime, ctx).await {
                return Ok(0);
            }
            ctx.cumulative_hits += ctx.num_hits;
            runtime.detector.garbage_collect(endtime);
        }

        let num_matches = runtime.detector.matches_mut().len();
        let matches = std::mem::take(runtime.detector.matches_mut());
        for event in matches {
            self.process_match(rh, runtime, event, num_matches, ctx).await;
        }

        runtime.state.previous_endtime = Some(endtime);

        let time_taken = run_start.elapsed().as_secs_f64();
        let hits = ctx.num_hits.max(ctx.cumulative_hits);
        let status = json!({
            "rule_name": rule.name,
            "endtime": dt_to_ts(&endtime),
            "starttime": runtime.state.original_starttime.map(|t| dt_to_ts(&t)),
            "matches": num_matches,
            "hits": hits,
            "time_taken": time_taken,
        });
        self.writeback.write(WritebackKind::Status, status).await;
        self.metrics.observe_tick(
            &rule.name,
            hits,
            ctx.num_dupes,
            num_matches,
            ctx.alerts_sent,
            time_taken,
        );

        Ok(num_matches)
    }

    /// Silence-check one match and route it to immediate dispatch or
    /// the aggregation queue.
    async fn process_match(
        &self,
        rh: &Arc<RuleHandle>,
        runtime: &mut RuleRuntime,
        mut event: Value,
        num_matches: usize,
        ctx: &mut TickContext,
    ) {
        let rule = &rh.rule;
        if let Some(obj) = event.as_object_mut() {
            obj.insert("num_hits".to_string(), json!(ctx.cumulative_hits));
            obj.insert("num_matches".to_string(), json!(num_matches));
        }

        let mut silence_key = rule.realert_key().to_string();
        if let Some(qk) = query_key_value(rh, &event) {
            silence_key = format!("{}.{}", silence_key, qk);
        }

        let rule_wide_key = format!("{}._silence", rule.name);
        if self.silence.is_silenced(&rule_wide_key).await
            || self.silence.is_silenced(&silence_key).await
        {
            info!("Ignoring match for silenced rule {}", silence_key);
            return;
        }

        if !rule.realert().is_zero() {
            let (until, exponent) = self.silence.next_alert_time(rule, &silence_key, ts_now());
            self.silence.set_realert(&silence_key, until, exponent).await;
        }

        if rule.run_enhancements_first {
            for enhancement in &rh.enhancements {
                match enhancement.process(&mut event) {
                    Ok(()) => {}
                    Err(EnhancementError::DropMatch) => return,
                    Err(EnhancementError::Failed(e)) => {
                        self.handle_error(
                            &format!("Error running match enhancement: {}", e),
                            Some(json!({"rule": rule.name})),
                        )
                        .await;
                    }
                }
            }
        }

        if rule.aggregation.is_none() {
            self.alert(vec![event], rh, None, false, ctx).await;
        } else {
            self.add_aggregated_alert(rh, &mut runtime.state, event).await;
        }
    }

    /// One scheduled tick: compute the endtime, honor the
    /// `limit_execution` gate, run the rule, and prune old state.
    /// Returns the instant to pause until for cron-gated rules.
    pub(crate) async fn handle_rule_execution(
        &self,
        rh: &Arc<RuleHandle>,
    ) -> Option<DateTime<Utc>> {
        let rule = &rh.rule;
        let mut ctx = TickContext::new();
        let run_every = rule.run_every(&self.conf).duration();
        let next_run = ts_now() + run_every;

        let endtime = if let Some(end) = self.opts.end {
            end
        } else if let Some(delay) = rule.query_delay {
            ts_now() - delay.duration()
        } else {
            ts_now()
        };

        // Cron-gated rules pause once the projected next tick would
        // still land before the next allowed time.
        if let Some(expr) = &rule.limit_execution {
            let mut runtime = rh.runtime.lock().await;
            runtime.state.next_starttime = None;
            runtime.state.next_min_starttime = None;
            if let Some(exec_next) = parse_cron(expr)
                .ok()
                .and_then(|schedule| schedule.after(&ts_now()).next())
            {
                if dt_to_unix(&endtime) + run_every.num_seconds() < dt_to_unix(&exec_next) - 59 {
                    runtime.state.next_starttime = Some(exec_next);
                    if rule.limit_execution_coverage {
                        runtime.state.next_min_starttime = Some(exec_next);
                    }
                    if !runtime.state.has_run_once {
                        drop(runtime);
                        return self.reset_rule_schedule(rh).await;
                    }
                }
            }
        }

        let outcome = {
            let mut runtime = rh.runtime.lock().await;
            runtime.state.has_run_once = true;
            let initial = runtime.state.initial_starttime.take();
            let outcome = self
                .run_rule(rh, &mut runtime, endtime, initial, &mut ctx)
                .await;

            let horizon = rule.buffer_time(&self.conf).duration()
                + rule.query_delay.map(|d| d.duration()).unwrap_or_default();
            runtime.state.remove_old_events(ts_now(), horizon);

            (outcome, runtime.state.original_starttime)
        };

        match outcome.0 {
            Ok(num_matches) => {
                let start_text = outcome
                    .1
                    .map(|t| pretty_ts(&t))
                    .unwrap_or_else(|| "-".to_string());
                info!(
                    "Ran {} from {} to {}: {} query hits ({} already seen), {} matches, {} alerts sent",
                    rule.name,
                    start_text,
                    pretty_ts(&endtime),
                    ctx.num_hits.max(ctx.cumulative_hits),
                    ctx.num_dupes,
                    num_matches,
                    ctx.alerts_sent
                );
                if next_run < ts_now() {
                    // Tick overran its interval; happens with a large
                    // --start backlog or an overloaded backend.
                    warn!(
                        "Querying from {} to {} took longer than {}!",
                        start_text,
                        pretty_ts(&endtime),
                        rule.run_every(&self.conf)
                    );
                }
            }
            Err(e) => {
                self.handle_uncaught_error(&rule.name, &e).await;
            }
        }

        self.reset_rule_schedule(rh).await
    }

    /// For cron-gated rules that hit the end of an allowed period:
    /// return the pause target, optionally resetting the cursor floor
    /// so paused time is not queried later.
    async fn reset_rule_schedule(&self, rh: &Arc<RuleHandle>) -> Option<DateTime<Utc>> {
        if rh.rule.limit_execution.is_none() {
            return None;
        }
        let mut runtime = rh.runtime.lock().await;
        let next = runtime.state.next_starttime?;
        if let Some(next_min) = runtime.state.next_min_starttime {
            runtime.state.minimum_starttime = Some(next_min);
            runtime.state.previous_endtime = Some(next_min);
        }
        info!(
            rule = %rh.rule.name,
            until = %pretty_ts(&next),
            "pausing until next scheduled execution window"
        );
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{hit, hits_response, FakeBackend};
    use crate::engine::EngineOptions;
    use chrono::Duration;
    use searchlight_core::time::ts_to_dt;

    fn conf() -> searchlight_core::Config {
        serde_yaml::from_str(
            "rules_folder: rules\nrun_every: {minutes: 1}\nbuffer_time: {minutes: 5}\nes_host: localhost\n",
        )
        .unwrap()
    }

    async fn install_rule(engine: &Engine, yaml: &str) -> Arc<RuleHandle> {
        let mut rule: searchlight_rules::Rule = serde_yaml::from_str(yaml).unwrap();
        rule.finalize(&conf()).unwrap();
        let detector = searchlight_rules::detector::build_detector(&rule).unwrap();
        let alerters = searchlight_rules::alerts::build_alerters(&rule, &conf()).unwrap();
        let name = rule.name.clone();
        let loaded = searchlight_rules::LoadedRule {
            rule,
            detector,
            alerters,
            enhancements: Vec::new(),
            source_path: "test.yml".into(),
            hash: "h".to_string(),
        };
        let rh = engine.init_rule(loaded, None).await;
        engine.rules.write().await.insert(name, rh.clone());
        rh
    }

    fn search_hit(id: &str, ts: &str) -> Value {
        hit(id, json!({"@timestamp": ts, "user": "alice"}))
    }

    const ANY_RULE: &str = "\
name: R
type: any
index: logs-*
alert: [debug]
realert: {seconds: 0}
";

    /// The same document returned in two consecutive windows is
    /// dispatched once; the second occurrence counts as a dupe.
    #[tokio::test]
    async fn dedupe_across_ticks() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(&engine, ANY_RULE).await;
        let now = ts_now();
        let ts = dt_to_ts(&(now - Duration::minutes(1)));

        // Tick 1: resume probe (empty), then the window query.
        backend.push_search(hits_response(Vec::new(), 0));
        backend.push_hits(vec![search_hit("H1", &ts)]);
        let mut runtime = rh.runtime.lock().await;
        let mut ctx = TickContext::new();
        let matched = engine
            .run_rule(&rh, &mut runtime, now, None, &mut ctx)
            .await
            .unwrap();
        assert_eq!(matched, 1);
        assert_eq!(ctx.num_dupes, 0);
        // One alert outcome doc and one status doc.
        let kinds: Vec<String> = backend
            .indexed_docs()
            .iter()
            .map(|(index, _)| index.clone())
            .collect();
        assert!(kinds.contains(&"searchlight".to_string()));
        assert!(kinds.contains(&"searchlight_status".to_string()));

        // Tick 2: same hit again.
        backend.push_hits(vec![search_hit("H1", &ts)]);
        let mut ctx = TickContext::new();
        let matched = engine
            .run_rule(&rh, &mut runtime, now + Duration::minutes(1), None, &mut ctx)
            .await
            .unwrap();
        assert_eq!(matched, 0);
        assert_eq!(ctx.num_dupes, 1);
    }

    /// A match for a silenced rule is dropped before dispatch.
    #[tokio::test]
    async fn silenced_rule_drops_matches() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(
            &engine,
            "name: R\ntype: any\nindex: logs-*\nalert: [debug]\nrealert: {minutes: 10}\n",
        )
        .await;

        // Prior `--silence hours=1` on the rule-wide key.
        engine
            .silence
            .set_realert("R._silence", ts_now() + Duration::hours(1), 0)
            .await;

        let now = ts_now();
        backend.push_search(hits_response(Vec::new(), 0)); // resume probe
        backend.push_hits(vec![search_hit("H1", &dt_to_ts(&(now - Duration::minutes(1))))]);

        let mut runtime = rh.runtime.lock().await;
        let mut ctx = TickContext::new();
        engine
            .run_rule(&rh, &mut runtime, now, None, &mut ctx)
            .await
            .unwrap();
        // No alert doc was written; only the silence doc (from the
        // seed) and the tick status doc exist.
        assert_eq!(ctx.alerts_sent, 0);
        let alert_docs: Vec<_> = backend
            .indexed_docs()
            .into_iter()
            .filter(|(index, _)| index == "searchlight")
            .collect();
        assert!(alert_docs.is_empty());
    }

    /// A future start time skips the tick.
    #[tokio::test]
    async fn future_starttime_skips_tick() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(&engine, ANY_RULE).await;

        let mut runtime = rh.runtime.lock().await;
        let mut ctx = TickContext::new();
        let matched = engine
            .run_rule(
                &rh,
                &mut runtime,
                ts_now() + Duration::hours(2),
                Some(ts_now() + Duration::hours(1)),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(matched, 0);
        assert!(backend.searches.lock().unwrap().is_empty());
    }

    /// Long windows are split into buffer_time segments, one query per
    /// segment, with the status doc reporting the cumulative hits.
    #[tokio::test]
    async fn window_is_segmented() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(&engine, ANY_RULE).await;
        let now = ts_now();

        let mut runtime = rh.runtime.lock().await;
        let mut ctx = TickContext::new();
        // 12 minute window with 5 minute buffer_time: 3 queries.
        engine
            .run_rule(
                &rh,
                &mut runtime,
                now,
                Some(now - Duration::minutes(12)),
                &mut ctx,
            )
            .await
            .unwrap();
        let searches = backend.searches.lock().unwrap();
        // All on the rule index (no writeback probes: initial_start
        // skips the resume query; empty responses everywhere).
        assert_eq!(searches.len(), 3);
        let range = &searches[0].1["query"]["bool"]["filter"]["bool"]["must"][0]["range"];
        let gt = range["@timestamp"]["gt"].as_str().unwrap();
        let lte = range["@timestamp"]["lte"].as_str().unwrap();
        let width = ts_to_dt(lte).unwrap() - ts_to_dt(gt).unwrap();
        assert_eq!(width, Duration::minutes(5));
    }

    /// Matches flow to the aggregation queue when aggregation is set.
    #[tokio::test]
    async fn aggregation_rules_defer_dispatch() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(
            &engine,
            "name: R\ntype: any\nindex: logs-*\nalert: [debug]\nrealert: {seconds: 0}\naggregation: {minutes: 10}\n",
        )
        .await;
        let now = ts_now();

        backend.push_search(hits_response(Vec::new(), 0)); // resume probe
        backend.push_hits(vec![search_hit("H1", &dt_to_ts(&(now - Duration::minutes(1))))]);
        // find_pending_aggregate_alert probe: empty.

        let mut runtime = rh.runtime.lock().await;
        let mut ctx = TickContext::new();
        engine
            .run_rule(&rh, &mut runtime, now, None, &mut ctx)
            .await
            .unwrap();

        // The match was persisted as an unsent aggregate, not alerted.
        assert_eq!(ctx.alerts_sent, 0);
        let alert_docs: Vec<_> = backend
            .indexed_docs()
            .into_iter()
            .filter(|(index, _)| index == "searchlight")
            .collect();
        assert_eq!(alert_docs.len(), 1);
        assert_eq!(alert_docs[0].1["alert_sent"], json!(false));
        assert_eq!(runtime.state.current_aggregate_id.len(), 1);
    }

    #[tokio::test]
    async fn handle_rule_execution_sets_previous_endtime() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(&engine, ANY_RULE).await;

        let pause = engine.handle_rule_execution(&rh).await;
        assert!(pause.is_none());
        let runtime = rh.runtime.lock().await;
        assert!(runtime.state.has_run_once);
        assert!(runtime.state.previous_endtime.is_some());
    }

    /// First execution of a cron-gated rule outside its window pauses
    /// without running.
    #[tokio::test]
    async fn limit_execution_pauses_before_first_run() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        // Gate on a yearly schedule far in the future.
        let rh = install_rule(
            &engine,
            "name: R\ntype: any\nindex: logs-*\nalert: [debug]\nlimit_execution: '0 0 1 1 *'\nlimit_execution_coverage: true\n",
        )
        .await;

        let pause = engine.handle_rule_execution(&rh).await;
        assert!(pause.is_some());
        let runtime = rh.runtime.lock().await;
        assert!(!runtime.state.has_run_once);
        // Coverage reset floors the cursor at the next window.
        assert_eq!(runtime.state.minimum_starttime, runtime.state.next_min_starttime);
        assert!(backend.searches.lock().unwrap().is_empty());
    }
}

//! Pending-alert sweep: retry unsent alerts and drain ready aggregates.
//!
//! The writeback store is the coordination medium between the
//! dispatcher and this sweep; `alert_lock` serializes the sweep with
//! all aggregate inserts. Per-rule runtime locks are only try-locked
//! while the alert lock is held (a rule mid-tick drains its own
//! in-memory aggregates at tick start anyway).

use chrono::Duration;
use serde_json::{json, Value};
use tracing::info;

use searchlight_core::time::{dt_to_ts, ts_now, ts_to_dt};

use crate::aggregation::aggregation_key_value;
use crate::backend::{SearchOptions, WritebackKind};
use crate::engine::Engine;
use crate::state::TickContext;

impl Engine {
    /// Unsent, non-aggregated alert documents whose alert time falls
    /// within `[now - time_limit, now]`, earliest first. Capped at
    /// 1000; the next sweep picks up the remainder.
    pub(crate) async fn find_recent_pending_alerts(
        &self,
        time_limit: Duration,
    ) -> Vec<(String, Value)> {
        let now = ts_now();
        let query = json!({
            "query": {
                "bool": {
                    "must": {"query_string": {"query": "!_exists_:aggregate_id AND alert_sent:false"}},
                    "filter": {"range": {"alert_time": {
                        "gte": dt_to_ts(&(now - time_limit)),
                        "lte": dt_to_ts(&now),
                    }}},
                }
            },
            "sort": [{"alert_time": {"order": "asc"}}],
        });
        let index = self.writeback.index_for(WritebackKind::Alert);
        let res = match self
            .backend
            .search(&index, &query, SearchOptions::size(1000))
            .await
        {
            Ok(res) => res,
            Err(e) => {
                self.handle_error(
                    &format!("Error finding recent pending alerts: {}", e.truncated()),
                    None,
                )
                .await;
                return Vec::new();
            }
        };

        res["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        let id = hit["_id"].as_str()?.to_string();
                        Some((id, hit["_source"].clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove and return all matches whose `aggregate_id` equals `id`.
    pub(crate) async fn get_aggregated_matches(&self, id: &str) -> Vec<Value> {
        let query = json!({
            "query": {"query_string": {"query": format!("aggregate_id:\"{}\"", id)}},
            "sort": [{"@timestamp": {"order": "asc"}}],
        });
        let index = self.writeback.index_for(WritebackKind::Alert);
        let res = match self
            .backend
            .search(&index, &query, SearchOptions::size(self.conf.max_aggregation))
            .await
        {
            Ok(res) => res,
            Err(e) => {
                self.handle_error(
                    &format!("Error fetching aggregated matches: {}", e.truncated()),
                    Some(json!({"id": id})),
                )
                .await;
                return Vec::new();
            }
        };

        let mut matches = Vec::new();
        if let Some(hits) = res["hits"]["hits"].as_array() {
            for hit in hits {
                matches.push(hit["_source"].clone());
                if let Some(doc_id) = hit["_id"].as_str() {
                    if let Err(e) = self.backend.delete_document(&index, doc_id).await {
                        self.handle_error(
                            &format!("Failed to delete aggregated match {}: {}", doc_id, e.truncated()),
                            None,
                        )
                        .await;
                    }
                }
            }
        }
        matches
    }

    /// One sweep: dispatch due persisted alerts (with their aggregated
    /// children), then drain in-memory aggregate groups whose deadline
    /// passed.
    pub async fn send_pending_alerts(&self) {
        let mut ctx = TickContext::new();
        // (rule name, pending doc id) pairs whose group ids must be
        // cleared once the alert lock is released.
        let mut resolved: Vec<(String, String)> = Vec::new();

        {
            let _guard = self.alert_lock.lock().await;

            let pending = self
                .find_recent_pending_alerts(self.conf.alert_time_limit.duration())
                .await;
            for (id, mut source) in pending {
                let Some(obj) = source.as_object_mut() else {
                    continue;
                };
                let (Some(rule_name), Some(alert_time), Some(match_body)) = (
                    obj.remove("rule_name").and_then(|v| v.as_str().map(str::to_string)),
                    obj.remove("alert_time")
                        .and_then(|v| v.as_str().and_then(|s| ts_to_dt(s).ok())),
                    obj.remove("match_body"),
                ) else {
                    // Malformed alert, drop it.
                    continue;
                };

                // Original rule is missing; keep the alert in case the
                // rule reappears.
                let Some(rh) = self.get_rule(&rule_name).await else {
                    continue;
                };

                if ts_now() <= alert_time {
                    continue;
                }

                let aggregated = self.get_aggregated_matches(&id).await;
                if !aggregated.is_empty() {
                    let mut all = vec![match_body];
                    all.extend(
                        aggregated
                            .into_iter()
                            .filter_map(|mut doc| doc.get_mut("match_body").map(Value::take)),
                    );
                    self.alert(all, &rh, Some(alert_time), false, &mut ctx).await;
                } else {
                    // No children: for non-aggregated rules this is a
                    // retry of a failed alert.
                    let retried = rh.rule.aggregation.is_none();
                    self.alert(vec![match_body], &rh, Some(alert_time), retried, &mut ctx)
                        .await;
                }
                resolved.push((rule_name, id.clone()));

                let index = self.writeback.index_for(WritebackKind::Alert);
                if let Err(e) = self.backend.delete_document(&index, &id).await {
                    self.handle_error(
                        &format!("Failed to delete alert {}: {}", id, e.truncated()),
                        None,
                    )
                    .await;
                }
            }

            // In-memory aggregate groups whose deadline has passed.
            let rules: Vec<_> = self.rules.read().await.values().cloned().collect();
            for rh in rules {
                let mut groups: Vec<Vec<Value>> = Vec::new();
                {
                    let Ok(mut runtime) = rh.runtime.try_lock() else {
                        continue;
                    };
                    if runtime.state.agg_matches.is_empty() {
                        continue;
                    }
                    let due_keys: Vec<Option<String>> = runtime
                        .state
                        .aggregate_alert_time
                        .iter()
                        .filter(|(_, deadline)| ts_now() > **deadline)
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in due_keys {
                        let (ready, rest): (Vec<Value>, Vec<Value>) = std::mem::take(&mut runtime.state.agg_matches)
                            .into_iter()
                            .partition(|event| aggregation_key_value(&rh.rule, event) == key);
                        runtime.state.agg_matches = rest;
                        if !ready.is_empty() {
                            groups.push(ready);
                        }
                    }
                }
                for group in groups {
                    self.alert(group, &rh, None, false, &mut ctx).await;
                }
            }
        }

        // Clear resolved group ids outside the alert lock (lock order
        // is runtime → alert_lock, never the reverse).
        for (rule_name, agg_id) in resolved {
            if let Some(rh) = self.get_rule(&rule_name).await {
                let mut runtime = rh.runtime.lock().await;
                runtime
                    .state
                    .current_aggregate_id
                    .retain(|_, id| id != &agg_id);
            }
        }

        info!(alerts_sent = ctx.alerts_sent, "pending alerts sweep complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{hit, hits_response, FakeBackend};
    use crate::engine::EngineOptions;
    use std::sync::Arc;

    fn conf() -> searchlight_core::Config {
        serde_yaml::from_str(
            "rules_folder: rules\nrun_every: {minutes: 1}\nbuffer_time: {minutes: 15}\nes_host: localhost\n",
        )
        .unwrap()
    }

    async fn install_rule(engine: &Engine, yaml: &str) -> Arc<crate::engine::RuleHandle> {
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

    /// Restart scenario: one persisted pending aggregate whose
    /// deadline has passed is dispatched once and deleted.
    #[tokio::test]
    async fn sweep_dispatches_and_deletes_due_pending_alert() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(
            &engine,
            "name: R\ntype: any\nindex: logs-*\nalert: [debug]\naggregation: {minutes: 10}\naggregation_key: service\n",
        )
        .await;
        // Seed the group id map as if the group was opened pre-restart.
        rh.runtime
            .lock()
            .await
            .state
            .current_aggregate_id
            .insert(Some("api".to_string()), "pending-1".to_string());

        let alert_time = ts_now() - Duration::minutes(1);
        backend.push_search(hits_response(
            vec![hit(
                "pending-1",
                json!({
                    "rule_name": "R",
                    "alert_time": dt_to_ts(&alert_time),
                    "alert_sent": false,
                    "aggregation_key": "api",
                    "match_body": {"service": "api", "n": 1},
                }),
            )],
            1,
        ));
        // No aggregated children.
        backend.push_search(hits_response(Vec::new(), 0));

        engine.send_pending_alerts().await;

        // The pending doc was deleted exactly once.
        let deleted = backend.deleted_docs();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].1, "pending-1");
        // Outcome written back for the dispatched match.
        let indexed = backend.indexed_docs();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].1["rule_name"], json!("R"));
        assert_eq!(indexed[0].1["alert_sent"], json!(true));
        // The resolved group id was cleared.
        assert!(rh
            .runtime
            .lock()
            .await
            .state
            .current_aggregate_id
            .is_empty());
    }

    #[tokio::test]
    async fn sweep_keeps_alert_for_removed_rule() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());

        let alert_time = ts_now() - Duration::minutes(1);
        backend.push_search(hits_response(
            vec![hit(
                "pending-1",
                json!({
                    "rule_name": "ghost",
                    "alert_time": dt_to_ts(&alert_time),
                    "match_body": {"n": 1},
                }),
            )],
            1,
        ));

        engine.send_pending_alerts().await;
        assert!(backend.deleted_docs().is_empty());
        assert!(backend.indexed_docs().is_empty());
    }

    #[tokio::test]
    async fn sweep_collects_aggregated_children() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        install_rule(
            &engine,
            "name: R\ntype: any\nindex: logs-*\nalert: [debug]\naggregation: {minutes: 10}\n",
        )
        .await;

        let alert_time = ts_now() - Duration::minutes(1);
        backend.push_search(hits_response(
            vec![hit(
                "parent-1",
                json!({
                    "rule_name": "R",
                    "alert_time": dt_to_ts(&alert_time),
                    "match_body": {"n": 1},
                }),
            )],
            1,
        ));
        backend.push_search(hits_response(
            vec![
                hit("child-1", json!({"aggregate_id": "parent-1", "match_body": {"n": 2}})),
                hit("child-2", json!({"aggregate_id": "parent-1", "match_body": {"n": 3}})),
            ],
            2,
        ));

        engine.send_pending_alerts().await;

        // Children and parent deleted; one outcome doc per match,
        // linked by the first doc's id.
        let deleted: Vec<String> = backend.deleted_docs().into_iter().map(|(_, id)| id).collect();
        assert!(deleted.contains(&"parent-1".to_string()));
        assert!(deleted.contains(&"child-1".to_string()));
        assert!(deleted.contains(&"child-2".to_string()));
        let indexed = backend.indexed_docs();
        assert_eq!(indexed.len(), 3);
        assert_eq!(indexed[1].1["aggregate_id"], indexed[2].1["aggregate_id"]);
    }

    #[tokio::test]
    async fn sweep_drains_due_in_memory_groups() {
        let backend = Arc::new(FakeBackend::new());
        let engine = Engine::new(conf(), EngineOptions::default(), backend.clone());
        let rh = install_rule(
            &engine,
            "name: R\ntype: any\nindex: logs-*\nalert: [debug]\naggregation: {minutes: 10}\naggregation_key: service\n",
        )
        .await;

        {
            let mut runtime = rh.runtime.lock().await;
            runtime.state.agg_matches.push(json!({"service": "api", "n": 1}));
            runtime.state.agg_matches.push(json!({"service": "db", "n": 2}));
            runtime
                .state
                .aggregate_alert_time
                .insert(Some("api".to_string()), ts_now() - Duration::minutes(1));
            runtime
                .state
                .aggregate_alert_time
                .insert(Some("db".to_string()), ts_now() + Duration::minutes(5));
        }

        engine.send_pending_alerts().await;

        let runtime = rh.runtime.lock().await;
        // Only the due group was drained.
        assert_eq!(runtime.state.agg_matches.len(), 1);
        assert_eq!(runtime.state.agg_matches[0]["service"], json!("db"));
        let indexed = backend.indexed_docs();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].1["match_body"]["service"], json!("api"));
    }
}

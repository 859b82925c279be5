//! Job scheduling and engine lifecycle: per-rule tick tasks, internal
//! sweeps, config reload, readiness, memory GC, and shutdown.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use rand::Rng;
use tracing::{error, info, warn};

use searchlight_core::time::ts_now;

use crate::engine::{Engine, RuleHandle};
use crate::error::{EngineError, Result};

impl Engine {
    /// Initial rule load. Per-file failures are reported and notified;
    /// they never abort startup.
    pub async fn load_all_rules(self: &Arc<Self>) -> Result<()> {
        let outcomes = self
            .loader
            .load(&self.conf, self.opts.rule_filter.as_deref())?;
        let hashes = self
            .loader
            .get_hashes(self.opts.rule_filter.as_deref())?;

        for outcome in outcomes {
            match outcome.result {
                Ok(loaded) => {
                    if !loaded.rule.is_enabled {
                        self.disabled_rules
                            .lock()
                            .expect("disabled set lock poisoned")
                            .insert(loaded.rule.name.clone());
                        continue;
                    }
                    let name = loaded.rule.name.clone();
                    if self.rules.read().await.contains_key(&name) {
                        self.handle_error(
                            &format!("A rule with the name {} already exists", name),
                            None,
                        )
                        .await;
                        continue;
                    }
                    let rh = self.init_rule(loaded, None).await;
                    self.rules.write().await.insert(name, rh);
                }
                Err(e) => {
                    let message =
                        format!("Could not load rule {}: {}", outcome.path.display(), e);
                    self.handle_error(&message, None).await;
                    let extra = self.rule_file_notify_email(&outcome.path);
                    self.send_notification_email(
                        &message,
                        outcome.path.to_str(),
                        &extra,
                    )
                    .await;
                }
            }
        }

        *self.rule_hashes.lock().expect("rule hashes lock poisoned") = hashes;
        info!(rules = self.rules.read().await.len(), "rules loaded");
        Ok(())
    }

    /// Best-effort extraction of a failing rule file's own
    /// `notify_email` so its owners hear about the breakage.
    fn rule_file_notify_email(&self, path: &Path) -> Vec<String> {
        let Ok(yaml) = self.loader.load_yaml(path) else {
            return Vec::new();
        };
        match yaml.get("notify_email") {
            Some(serde_yaml::Value::String(s)) => vec![s.clone()],
            Some(serde_yaml::Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Poll the writeback backend until it is reachable and the
    /// writeback index exists, bounded by `--patience`. Zero patience
    /// skips the check entirely.
    pub async fn wait_until_responsive(&self) -> Result<()> {
        let patience = self.opts.patience;
        if patience <= chrono::Duration::zero() {
            return Ok(());
        }
        let deadline = ts_now() + patience;
        while ts_now() < deadline {
            if self
                .backend
                .index_exists(&self.conf.writeback_index)
                .await
                .unwrap_or(false)
            {
                return Ok(());
            }
            tokio::time::sleep(StdDuration::from_secs(1)).await;
        }

        if self.backend.ping().await {
            Err(EngineError::Readiness(format!(
                "writeback index '{}' does not exist, create it before starting",
                self.conf.writeback_index
            )))
        } else {
            Err(EngineError::Readiness(format!(
                "could not reach the search backend at '{}:{}'",
                self.conf.es_host, self.conf.es_port
            )))
        }
    }

    /// Run the engine: spawn all jobs and sleep-loop until `--end` or
    /// shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.wait_until_responsive().await?;
        self.running.store(true, Ordering::SeqCst);
        info!("starting up");

        let names: Vec<String> = self.rules.read().await.keys().cloned().collect();
        for name in names {
            self.spawn_rule_job(name);
        }
        self.spawn_internal_jobs();

        let run_every = self.conf.run_every.duration();
        loop {
            let next_run = ts_now() + run_every;
            if let Some(end) = self.opts.end {
                if next_run > end {
                    info!(
                        end = %end,
                        next_run = %next_run,
                        "end time falls before the next run time, exiting"
                    );
                    break;
                }
            }
            if self.conf.show_disabled_rules {
                info!(disabled = ?self.disabled_rule_names(), "disabled rules");
            }
            tokio::time::sleep(self.conf.run_every.std_duration()).await;
            if !self.is_running() {
                break;
            }
        }
        self.stop().await;
        Ok(())
    }

    /// One tick task per rule. Non-overlap is structural (a task runs
    /// its own loop); missed fires coalesce. Start offset is jittered
    /// up to 15 s, recurring sleeps up to 5 s.
    pub(crate) fn spawn_rule_job(self: &Arc<Self>, name: String) {
        let engine = Arc::clone(self);
        let job_name = name.clone();
        let handle = tokio::spawn(async move {
            let initial_offset: u64 = rand::thread_rng().gen_range(0..=15);
            tokio::time::sleep(StdDuration::from_secs(initial_offset)).await;
            loop {
                if engine.is_disabled(&job_name) {
                    info!(rule = %job_name, "rule is disabled, parking its job");
                    break;
                }
                let Some(rh) = engine.get_rule(&job_name).await else {
                    break;
                };
                let pause_until = {
                    let Ok(_permit) = engine.pool.acquire().await else {
                        break;
                    };
                    engine.handle_rule_execution(&rh).await
                };

                let run_every = rh.rule.run_every(&engine.conf).std_duration();
                let jitter_ms: u64 = rand::thread_rng().gen_range(0..5000);
                match pause_until {
                    Some(at) => {
                        let wait = (at - ts_now()).to_std().unwrap_or_default();
                        tokio::time::sleep(wait).await;
                    }
                    None => {
                        tokio::time::sleep(run_every + StdDuration::from_millis(jitter_ms)).await
                    }
                }
            }
        });
        if let Some(old) = self
            .jobs
            .lock()
            .expect("jobs lock poisoned")
            .insert(name, handle)
        {
            old.abort();
        }
    }

    /// Pending-alert sweep and config-change check every `run_every`;
    /// memory GC every 10 minutes.
    fn spawn_internal_jobs(self: &Arc<Self>) {
        let run_every = self.conf.run_every.std_duration();

        let engine = Arc::clone(self);
        let pending = tokio::spawn(async move {
            loop {
                tokio::time::sleep(run_every).await;
                let Ok(_permit) = engine.pool.acquire().await else {
                    break;
                };
                engine.send_pending_alerts().await;
                engine.silence.cleanup();
                engine.cleanup_client_cache().await;
            }
        });

        let engine = Arc::clone(self);
        let config_check = tokio::spawn(async move {
            loop {
                tokio::time::sleep(run_every).await;
                if engine.opts.pin_rules {
                    continue;
                }
                let Ok(_permit) = engine.pool.acquire().await else {
                    break;
                };
                engine.load_rule_changes().await;
            }
        });

        let engine = Arc::clone(self);
        let memory_gc = tokio::spawn(async move {
            loop {
                tokio::time::sleep(StdDuration::from_secs(600)).await;
                let Ok(_permit) = engine.pool.acquire().await else {
                    break;
                };
                engine.cleanup_memory_caches().await;
            }
        });

        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        jobs.insert("_internal_pending_alerts".to_string(), pending);
        jobs.insert("_internal_config_check".to_string(), config_check);
        jobs.insert("_internal_memory_gc".to_string(), memory_gc);
    }

    /// Re-hash rule files and apply deletions, changes, and additions.
    /// Reloaded rules keep their cursors, dedupe map, and pending
    /// aggregates.
    pub async fn load_rule_changes(self: &Arc<Self>) {
        let new_hashes = match self.loader.get_hashes(self.opts.rule_filter.as_deref()) {
            Ok(hashes) => hashes,
            Err(e) => {
                self.handle_error(&format!("Error listing rule files: {}", e), None)
                    .await;
                return;
            }
        };
        let old_hashes = self
            .rule_hashes
            .lock()
            .expect("rule hashes lock poisoned")
            .clone();

        for (file, old_hash) in &old_hashes {
            match new_hashes.get(file) {
                None => {
                    info!(file = %file.display(), "rule file not found, stopping rule execution");
                    if let Some(name) = self.rule_name_for_path(file).await {
                        self.remove_rule(&name).await;
                    }
                }
                Some(new_hash) if new_hash != old_hash => {
                    self.reload_rule_file(file).await;
                }
                _ => {}
            }
        }

        if self.opts.rule_filter.is_none() {
            for file in new_hashes.keys() {
                if !old_hashes.contains_key(file) {
                    self.load_new_rule_file(file).await;
                }
            }
        }

        *self.rule_hashes.lock().expect("rule hashes lock poisoned") = new_hashes;
        info!("configuration change check complete");
    }

    async fn rule_name_for_path(&self, file: &Path) -> Option<String> {
        self.rules
            .read()
            .await
            .values()
            .find(|rh| rh.source_path == file)
            .map(|rh| rh.rule.name.clone())
    }

    async fn reload_rule_file(self: &Arc<Self>, file: &Path) {
        let loaded = match self.loader.load_configuration(file, &self.conf) {
            Ok(loaded) => loaded,
            Err(e) => {
                let message = format!("Could not load rule {}: {}", file.display(), e);
                self.handle_error(&message, None).await;
                let extra = self.rule_file_notify_email(file);
                self.send_notification_email(&message, file.to_str(), &extra)
                    .await;
                return;
            }
        };

        let name = loaded.rule.name.clone();
        if !loaded.rule.is_enabled {
            info!(file = %file.display(), "rule file is now disabled");
            if let Some(prior_name) = self.rule_name_for_path(file).await {
                self.remove_rule(&prior_name).await;
            }
            self.disabled_rules
                .lock()
                .expect("disabled set lock poisoned")
                .insert(name);
            return;
        }

        info!(file = %file.display(), rule = %name, "reloading rule configuration");
        self.disabled_rules
            .lock()
            .expect("disabled set lock poisoned")
            .remove(&name);

        let prior = {
            let rules = self.rules.read().await;
            rules
                .values()
                .find(|rh| rh.source_path == file)
                .cloned()
        };
        let rh = self.init_rule(loaded, prior.as_ref()).await;
        if let Some(prior) = &prior {
            if prior.rule.name != name {
                self.remove_rule(&prior.rule.name).await;
            }
        }
        self.rules.write().await.insert(name.clone(), rh);
        self.spawn_rule_job(name);
    }

    async fn load_new_rule_file(self: &Arc<Self>, file: &Path) {
        let loaded = match self.loader.load_configuration(file, &self.conf) {
            Ok(loaded) => loaded,
            Err(e) => {
                let message = format!("Could not load rule {}: {}", file.display(), e);
                self.handle_error(&message, None).await;
                let extra = self.rule_file_notify_email(file);
                self.send_notification_email(&message, file.to_str(), &extra)
                    .await;
                return;
            }
        };
        if !loaded.rule.is_enabled {
            return;
        }
        let name = loaded.rule.name.clone();
        if self.rules.read().await.contains_key(&name) {
            self.handle_error(
                &format!("A rule with the name {} already exists", name),
                None,
            )
            .await;
            return;
        }
        let rh = self.init_rule(loaded, None).await;
        self.rules.write().await.insert(name.clone(), rh);
        self.clients
            .lock()
            .expect("client cache lock poisoned")
            .remove(&name);
        info!(file = %file.display(), rule = %name, "loaded new rule");
        self.spawn_rule_job(name);
    }

    /// Periodic memory GC: expired silences, stale clients, expired
    /// aggregate deadlines, and old dedupe entries. Rules mid-tick are
    /// skipped rather than blocked.
    pub(crate) async fn cleanup_memory_caches(&self) {
        self.silence.cleanup();
        self.cleanup_client_cache().await;

        let now = ts_now();
        let rules: Vec<Arc<RuleHandle>> = self.rules.read().await.values().cloned().collect();
        for rh in rules {
            let Ok(mut runtime) = rh.runtime.try_lock() else {
                continue;
            };
            let horizon = rh.rule.buffer_time(&self.conf).duration()
                + rh.rule.query_delay.map(|d| d.duration()).unwrap_or_default();
            runtime.state.remove_old_events(now, horizon);
            let expired = runtime.state.remove_expired_aggregates(now);
            if expired > 0 {
                info!(rule = %rh.rule.name, expired, "evicted expired aggregate deadlines");
            }
        }
    }

    /// Stop all jobs and mark the engine stopped.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        for (name, job) in jobs.drain() {
            if !job.is_finished() {
                warn!(job = %name, "aborting job");
            }
            job.abort();
        }
    }
}

//! The engine: owns loaded rules, shared caches, and collaborators.
//!
//! Behaviour is spread across focused `impl Engine` blocks:
//! cursor math in `cursor`, query execution in `runner`, match routing
//! in `executor`, delivery in `dispatch`, grouping in `aggregation`,
//! retries in `pending`, and job lifecycle in `scheduler`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use searchlight_core::time::{parse_deadline, TimeError};
use searchlight_core::Config;
use searchlight_notify::Alerter;
use searchlight_rules::{Enhancement, LoadedRule, Rule, RuleLoader};

use crate::backend::{HttpBackend, SearchBackend};
use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::query;
use crate::silence::SilenceTracker;
use crate::state::{RuleRuntime, RuleState};
use crate::writeback::WritebackWriter;

/// `--start` seed for rule cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOption {
    Now,
    At(DateTime<Utc>),
}

/// Runtime options from the CLI.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Suppress real alerts and writeback; log instead.
    pub debug: bool,
    /// Single-rule mode: only this rule file is loaded.
    pub rule_filter: Option<PathBuf>,
    pub start: Option<StartOption>,
    /// Bound the total runtime; the engine exits cleanly when the next
    /// wake time would pass this instant.
    pub end: Option<DateTime<Utc>>,
    /// How long to wait for the backend at startup.
    pub patience: chrono::Duration,
    /// Disable the config-change sweep.
    pub pin_rules: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            debug: false,
            rule_filter: None,
            start: None,
            end: None,
            patience: chrono::Duration::zero(),
            pin_rules: false,
        }
    }
}

/// A loaded rule with its collaborators and runtime state.
pub struct RuleHandle {
    pub rule: Rule,
    /// Mutable state + detector, serialized per rule.
    pub runtime: Mutex<RuleRuntime>,
    pub alerters: Vec<Box<dyn Alerter>>,
    pub enhancements: Vec<Box<dyn Enhancement>>,
    /// Detector capability, cached so dispatch paths don't need the
    /// runtime lock.
    pub triggers_on_absence: bool,
    pub source_path: PathBuf,
    pub hash: String,
}

pub struct Engine {
    pub(crate) conf: Config,
    pub(crate) opts: EngineOptions,
    /// Writeback backend (also the default query backend).
    pub(crate) backend: Arc<dyn SearchBackend>,
    /// Per-rule query clients, for rules with backend overrides.
    pub(crate) clients: StdMutex<HashMap<String, Arc<dyn SearchBackend>>>,
    pub(crate) writeback: WritebackWriter,
    pub(crate) silence: SilenceTracker,
    pub(crate) rules: RwLock<HashMap<String, Arc<RuleHandle>>>,
    pub(crate) disabled_rules: StdMutex<HashSet<String>>,
    pub(crate) rule_hashes: StdMutex<BTreeMap<PathBuf, String>>,
    pub(crate) loader: RuleLoader,
    /// Serializes the pending-alert sweep with aggregate inserts.
    pub(crate) alert_lock: Mutex<()>,
    /// Bounds how many ticks/sweeps run at once (`max_threads`).
    pub(crate) pool: tokio::sync::Semaphore,
    /// Alerters invoked with a synthesized match on engine errors.
    pub(crate) notify_alerters: Vec<Box<dyn Alerter>>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) jobs: StdMutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    pub(crate) running: AtomicBool,
}

impl Engine {
    pub fn new(conf: Config, opts: EngineOptions, backend: Arc<dyn SearchBackend>) -> Arc<Self> {
        let writeback = WritebackWriter::new(backend.clone(), &conf.writeback_index, opts.debug);
        let silence = SilenceTracker::new(backend.clone(), writeback.clone(), opts.debug);
        let loader = RuleLoader::new(conf.rules_folder.clone());
        let notify_alerters = searchlight_rules::alerts::build_notify_alerters(&conf);
        let conf_max_threads = conf.max_threads.max(1);
        Arc::new(Self {
            conf,
            opts,
            backend,
            clients: StdMutex::new(HashMap::new()),
            writeback,
            silence,
            rules: RwLock::new(HashMap::new()),
            disabled_rules: StdMutex::new(HashSet::new()),
            rule_hashes: StdMutex::new(BTreeMap::new()),
            loader,
            alert_lock: Mutex::new(()),
            pool: tokio::sync::Semaphore::new(conf_max_threads),
            notify_alerters,
            metrics: Arc::new(Metrics::new()),
            jobs: StdMutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    /// Expose `/metrics` on the given address.
    pub fn serve_metrics(&self, addr: std::net::SocketAddr) {
        self.metrics.serve(addr);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn initial_starttime(&self) -> Option<DateTime<Utc>> {
        match self.opts.start {
            Some(StartOption::Now) => Some(searchlight_core::time::ts_now()),
            Some(StartOption::At(at)) => Some(at),
            None => None,
        }
    }

    /// Wrap a loaded rule into a handle, applying list-filter
    /// enhancement and carrying state over from a prior instance.
    pub(crate) async fn init_rule(
        &self,
        loaded: LoadedRule,
        prior: Option<&Arc<RuleHandle>>,
    ) -> Arc<RuleHandle> {
        let LoadedRule {
            mut rule,
            detector,
            alerters,
            enhancements,
            source_path,
            hash,
        } = loaded;
        query::enhance_filter(&mut rule);

        let mut state = RuleState::default();
        if let Some(prior) = prior {
            let mut prior_runtime = prior.runtime.lock().await;
            state.carry_over(&mut prior_runtime.state);
        } else {
            state.initial_starttime = self.initial_starttime();
        }

        let triggers_on_absence = detector.triggers_on_absence();
        Arc::new(RuleHandle {
            rule,
            runtime: Mutex::new(RuleRuntime { state, detector }),
            alerters,
            enhancements,
            triggers_on_absence,
            source_path,
            hash,
        })
    }

    pub(crate) async fn get_rule(&self, name: &str) -> Option<Arc<RuleHandle>> {
        self.rules.read().await.get(name).cloned()
    }

    pub(crate) fn is_disabled(&self, name: &str) -> bool {
        self.disabled_rules
            .lock()
            .expect("disabled set lock poisoned")
            .contains(name)
    }

    /// Names of currently disabled rules, for the status log line.
    pub fn disabled_rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .disabled_rules
            .lock()
            .expect("disabled set lock poisoned")
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Query client for a rule: the shared backend unless the rule
    /// overrides the connection, in which case a client is cached per
    /// rule name.
    pub(crate) fn client_for(&self, rule: &Rule) -> Arc<dyn SearchBackend> {
        if rule.es_host.is_none() && rule.es_port.is_none() {
            return self.backend.clone();
        }
        let mut clients = self.clients.lock().expect("client cache lock poisoned");
        if let Some(client) = clients.get(&rule.name) {
            return client.clone();
        }
        let scheme = if self.conf.use_ssl { "https" } else { "http" };
        let host = rule.es_host.as_deref().unwrap_or(&self.conf.es_host);
        let port = rule.es_port.unwrap_or(self.conf.es_port);
        let url = format!("{}://{}:{}", scheme, host, port);
        let client: Arc<dyn SearchBackend> = Arc::new(HttpBackend::new(
            &url,
            self.conf.es_username.clone(),
            self.conf.es_password.clone(),
        ));
        clients.insert(rule.name.clone(), client.clone());
        client
    }

    /// Drop cached clients whose rule no longer exists (memory GC).
    pub(crate) async fn cleanup_client_cache(&self) {
        let rules = self.rules.read().await;
        let disabled = self
            .disabled_rules
            .lock()
            .expect("disabled set lock poisoned")
            .clone();
        let mut clients = self.clients.lock().expect("client cache lock poisoned");
        clients.retain(|name, _| rules.contains_key(name) || disabled.contains(name));
    }

    /// One-shot `--silence` mode: silence a single rule (optionally one
    /// query-key value) for a fixed period, then exit.
    pub async fn silence_rule(
        &self,
        duration: &str,
        qk_value: Option<&str>,
    ) -> Result<()> {
        if self.opts.debug {
            return Err(EngineError::Internal(
                "--silence is not compatible with --debug".to_string(),
            ));
        }
        let rules = self.rules.read().await;
        let rh = rules.values().next().ok_or_else(|| {
            EngineError::Internal("--silence must be used with --rule".to_string())
        })?;

        let silence_key = match qk_value {
            Some(value) => format!("{}.{}", rh.rule.realert_key(), value),
            None => format!("{}._silence", rh.rule.name),
        };
        let until = parse_deadline(duration).map_err(|e: TimeError| {
            EngineError::Internal(format!("'{}' is not a valid time period: {}", duration, e))
        })?;

        if self.silence.set_realert(&silence_key, until, 0).await.is_none() {
            return Err(EngineError::Internal(
                "failed to save silence command to the writeback index".to_string(),
            ));
        }
        tracing::info!(key = %silence_key, until = %until, "rule silenced");
        Ok(())
    }

    /// Remove a rule's job, state, and caches.
    pub(crate) async fn remove_rule(&self, name: &str) {
        if let Some(job) = self
            .jobs
            .lock()
            .expect("jobs lock poisoned")
            .remove(name)
        {
            job.abort();
        }
        if self.rules.write().await.remove(name).is_none() {
            warn!(rule = %name, "attempted to remove unknown rule");
        }
        self.clients
            .lock()
            .expect("client cache lock poisoned")
            .remove(name);
    }
}

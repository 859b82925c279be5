//! Global engine configuration, loaded from `config.yaml`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::de::{default_true, opt_string_or_list};
use crate::error::ConfigError;
use crate::time::Interval;

/// Top-level engine configuration.
///
/// Per-rule settings may override the cadence and query-size defaults;
/// everything else is engine-wide.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory scanned (recursively) for rule YAML files.
    pub rules_folder: PathBuf,

    /// Default tick interval for rules that don't set their own.
    pub run_every: Interval,

    /// Default sliding-window width for search-mode rules.
    pub buffer_time: Interval,

    // ── Search backend ──────────────────────────────────────────────
    pub es_host: String,
    #[serde(default = "default_es_port")]
    pub es_port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub es_username: Option<String>,
    #[serde(default)]
    pub es_password: Option<String>,
    /// Extra path prefix when the backend sits behind a proxy.
    #[serde(default)]
    pub es_url_prefix: Option<String>,

    /// Base name for the engine's own documents; status/silence/error
    /// documents land in suffixed companions resolved by the client.
    #[serde(default = "default_writeback_index")]
    pub writeback_index: String,

    /// How far back the pending-alert sweep will retry unsent alerts.
    #[serde(default = "default_alert_time_limit")]
    pub alert_time_limit: Interval,

    /// Maximum age of a persisted run endtime that still counts as a
    /// resume point on startup.
    #[serde(default = "default_old_query_limit")]
    pub old_query_limit: Interval,

    #[serde(default = "default_max_query_size")]
    pub max_query_size: usize,

    #[serde(default = "default_scroll_keepalive")]
    pub scroll_keepalive: String,

    /// Upper bound on scroll continuations within a single window.
    #[serde(default = "default_max_scrolling_count")]
    pub max_scrolling_count: u32,

    /// Cap on matches fetched for one aggregated dispatch.
    #[serde(default = "default_max_aggregation")]
    pub max_aggregation: usize,

    /// Worker-pool width shared by rule ticks and internal jobs.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    #[serde(default)]
    pub disable_rules_on_error: bool,

    #[serde(default = "default_true")]
    pub show_disabled_rules: bool,

    /// Multi-field postfix for keyword sub-fields (default `.keyword`).
    #[serde(default)]
    pub string_multi_field_name: Option<String>,

    /// Copy rule category/description/owner/priority onto alert docs.
    #[serde(default)]
    pub add_metadata_alert: bool,

    // ── Error notification ──────────────────────────────────────────
    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub notify_email: Vec<String>,
    #[serde(default)]
    pub notify_all_errors: bool,
    /// Alerter names invoked with a synthesized match on engine errors.
    #[serde(default)]
    pub notify_alert: Vec<String>,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_from_addr")]
    pub from_addr: String,
    #[serde(default)]
    pub email_reply_to: Option<String>,
}

fn default_es_port() -> u16 {
    9200
}

fn default_writeback_index() -> String {
    "searchlight".to_string()
}

fn default_alert_time_limit() -> Interval {
    Interval::days(2)
}

fn default_old_query_limit() -> Interval {
    Interval {
        weeks: 1,
        ..Interval::default()
    }
}

fn default_max_query_size() -> usize {
    10_000
}

fn default_scroll_keepalive() -> String {
    "30s".to_string()
}

fn default_max_scrolling_count() -> u32 {
    990
}

fn default_max_aggregation() -> usize {
    10_000
}

fn default_max_threads() -> usize {
    10
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_from_addr() -> String {
    "searchlight".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run_every.is_zero() {
            return Err(ConfigError::Validation(
                "run_every must be a positive interval".to_string(),
            ));
        }
        if self.buffer_time.is_zero() {
            return Err(ConfigError::Validation(
                "buffer_time must be a positive interval".to_string(),
            ));
        }
        if self.es_host.is_empty() {
            return Err(ConfigError::Validation("es_host must be set".to_string()));
        }
        Ok(())
    }

    /// Base URL of the search backend.
    pub fn es_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        let prefix = match &self.es_url_prefix {
            Some(p) => format!("/{}", p.trim_matches('/')),
            None => String::new(),
        };
        format!("{}://{}:{}{}", scheme, self.es_host, self.es_port, prefix)
    }
}

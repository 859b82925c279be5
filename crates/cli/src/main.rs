//! searchlight: rule-driven alerting against search backends.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use searchlight_core::time::{parse_timedelta, ts_to_dt};
use searchlight_core::Config;
use searchlight_engine::{Engine, EngineOptions, HttpBackend, StartOption};

/// Rule-driven alerting engine for Elasticsearch/OpenSearch-compatible
/// backends.
#[derive(Parser, Debug)]
#[command(name = "searchlight", version, about)]
struct Cli {
    /// Global config file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Suppress alerts and print information instead. Not compatible
    /// with --verbose.
    #[arg(long)]
    debug: bool,

    /// Increase verbosity without suppressing alerts. Not compatible
    /// with --debug.
    #[arg(long)]
    verbose: bool,

    /// Run only a specific rule (by file, must be in the rules folder).
    #[arg(long)]
    rule: Option<PathBuf>,

    /// Silence the rule for a period. Must be used with --rule.
    /// Usage: --silence <units>=<number>, e.g. --silence hours=2
    #[arg(long)]
    silence: Option<String>,

    /// Silence the rule only for this query key value.
    #[arg(long = "silence_qk_value")]
    silence_qk_value: Option<String>,

    /// Start querying from this timestamp (ISO 8601), or "NOW".
    #[arg(long)]
    start: Option<String>,

    /// Query until this timestamp (ISO 8601) and exit once reached.
    #[arg(long)]
    end: Option<String>,

    /// Maximum time to wait for the backend to become responsive.
    /// Usage: --patience <units>=<number>, e.g. --patience minutes=5
    #[arg(long)]
    patience: Option<String>,

    /// Stop monitoring rule files for changes.
    #[arg(long = "pin_rules")]
    pin_rules: bool,

    /// Enable verbose logging of backend queries.
    #[arg(long = "es_debug")]
    es_debug: bool,

    /// Log backend queries as curl commands to this file.
    #[arg(long = "es_debug_trace")]
    es_debug_trace: Option<PathBuf>,

    /// Enable Prometheus metrics on this port.
    #[arg(long = "prometheus_port")]
    prometheus_port: Option<u16>,

    /// Address to bind the Prometheus metrics server on.
    #[arg(long = "prometheus_addr", default_value = "0.0.0.0")]
    prometheus_addr: String,
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug || cli.verbose || cli.es_debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("searchlight={level},searchlight_core={level},searchlight_rules={level},searchlight_notify={level},searchlight_engine={level},info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_options(cli: &Cli) -> anyhow::Result<EngineOptions> {
    let start = match cli.start.as_deref() {
        None => None,
        Some("NOW") => Some(StartOption::Now),
        Some(ts) => Some(StartOption::At(ts_to_dt(ts).map_err(|_| {
            anyhow::anyhow!("{} is not a valid ISO 8601 timestamp (YYYY-MM-DDTHH:MM:SS)", ts)
        })?)),
    };
    let end = match cli.end.as_deref() {
        None => None,
        Some(ts) => Some(ts_to_dt(ts).map_err(|_| {
            anyhow::anyhow!("{} is not a valid ISO 8601 timestamp (YYYY-MM-DDTHH:MM:SS)", ts)
        })?),
    };
    let patience = match cli.patience.as_deref() {
        None => chrono::Duration::zero(),
        Some(spec) => parse_timedelta(spec)
            .map_err(|e| anyhow::anyhow!("invalid --patience value: {}", e))?,
    };

    Ok(EngineOptions {
        debug: cli.debug,
        rule_filter: cli.rule.clone(),
        start,
        end,
        patience,
        pin_rules: cli.pin_rules,
    })
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    if cli.debug && cli.verbose {
        info!("Note: --debug and --verbose flags are set. --debug takes precedent.");
    }
    if cli.debug {
        info!("Note: in debug mode, alerts will be logged to console but NOT actually sent. To send them but remain verbose, use --verbose instead.");
    }
    if cli.silence.is_some() && cli.rule.is_none() {
        error!("--silence must be used with --rule");
        return Ok(1);
    }

    let conf = match Config::load(&cli.config) {
        Ok(conf) => conf,
        Err(e) => {
            error!(config = %cli.config.display(), error = %e, "failed to load configuration");
            return Ok(1);
        }
    };

    let opts = build_options(&cli)?;

    let mut backend = HttpBackend::new(
        &conf.es_url(),
        conf.es_username.clone(),
        conf.es_password.clone(),
    );
    if let Some(trace) = &cli.es_debug_trace {
        backend = backend
            .with_trace_file(trace)
            .map_err(|e| anyhow::anyhow!("cannot open --es_debug_trace file: {}", e))?;
    }

    let engine = Engine::new(conf, opts, Arc::new(backend));
    engine.load_all_rules().await?;

    // One-shot silence mode: write the silence and exit.
    if let Some(duration) = &cli.silence {
        return match engine
            .silence_rule(duration, cli.silence_qk_value.as_deref())
            .await
        {
            Ok(()) => Ok(0),
            Err(e) => {
                error!(error = %e, "failed to silence rule");
                Ok(1)
            }
        };
    }

    // SIGINT exits immediately; nothing should be able to swallow it.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, stopping searchlight");
            std::process::exit(0);
        }
    });

    if let (Some(port), false) = (cli.prometheus_port, cli.debug) {
        let addr: IpAddr = cli
            .prometheus_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --prometheus_addr {}", cli.prometheus_addr))?;
        engine.serve_metrics(SocketAddr::new(addr, port));
    }

    match engine.start().await {
        Ok(()) => Ok(0),
        Err(e) => {
            error!(error = %e, "engine failed to start");
            Ok(1)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            1
        }
    };
    std::process::exit(code);
}

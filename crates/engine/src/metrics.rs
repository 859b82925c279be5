//! Prometheus metrics for rule execution.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{
    GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

/// Per-rule execution metrics, exposed over `/metrics` when a
/// prometheus port is configured.
pub struct Metrics {
    registry: Registry,
    pub hits: IntCounterVec,
    pub dupes: IntCounterVec,
    pub matches: IntCounterVec,
    pub alerts_sent: IntCounterVec,
    pub errors: IntCounter,
    pub time_taken: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let hits = IntCounterVec::new(
            Opts::new("searchlight_query_hits_total", "Query hits per rule"),
            &["rule_name"],
        )
        .expect("valid metric opts");
        let dupes = IntCounterVec::new(
            Opts::new(
                "searchlight_already_seen_hits_total",
                "Hits dropped by dedupe per rule",
            ),
            &["rule_name"],
        )
        .expect("valid metric opts");
        let matches = IntCounterVec::new(
            Opts::new("searchlight_matches_total", "Matches per rule"),
            &["rule_name"],
        )
        .expect("valid metric opts");
        let alerts_sent = IntCounterVec::new(
            Opts::new("searchlight_alerts_sent_total", "Alerts sent per rule"),
            &["rule_name"],
        )
        .expect("valid metric opts");
        let errors = IntCounter::new("searchlight_errors_total", "Engine errors")
            .expect("valid metric opts");
        let time_taken = GaugeVec::new(
            Opts::new("searchlight_rule_time_taken_seconds", "Last tick duration"),
            &["rule_name"],
        )
        .expect("valid metric opts");

        for collector in [&hits, &dupes, &matches, &alerts_sent] {
            registry
                .register(Box::new(collector.clone()))
                .expect("metric registration");
        }
        registry
            .register(Box::new(errors.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(time_taken.clone()))
            .expect("metric registration");

        Self {
            registry,
            hits,
            dupes,
            matches,
            alerts_sent,
            errors,
            time_taken,
        }
    }

    /// Record the outcome of one rule tick.
    pub fn observe_tick(
        &self,
        rule_name: &str,
        hits: usize,
        dupes: usize,
        matches: usize,
        alerts_sent: usize,
        time_taken_secs: f64,
    ) {
        self.hits.with_label_values(&[rule_name]).inc_by(hits as u64);
        self.dupes
            .with_label_values(&[rule_name])
            .inc_by(dupes as u64);
        self.matches
            .with_label_values(&[rule_name])
            .inc_by(matches as u64);
        self.alerts_sent
            .with_label_values(&[rule_name])
            .inc_by(alerts_sent as u64);
        self.time_taken
            .with_label_values(&[rule_name])
            .set(time_taken_secs);
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }

    /// Serve `/metrics` on the given address in a background task.
    pub fn serve(self: &Arc<Self>, addr: SocketAddr) {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/metrics",
                axum::routing::get(move || {
                    let metrics = Arc::clone(&metrics);
                    async move { metrics.render() }
                }),
            );
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "serving prometheus metrics");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "metrics server failed");
                    }
                }
                Err(e) => error!(%addr, error = %e, "failed to bind metrics listener"),
            }
        });
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_tick_accumulates() {
        let metrics = Metrics::new();
        metrics.observe_tick("r", 10, 2, 1, 1, 0.5);
        metrics.observe_tick("r", 5, 0, 0, 0, 0.2);
        let rendered = metrics.render();
        assert!(rendered.contains("searchlight_query_hits_total{rule_name=\"r\"} 15"));
        assert!(rendered.contains("searchlight_already_seen_hits_total{rule_name=\"r\"} 2"));
        assert!(rendered.contains("searchlight_rule_time_taken_seconds{rule_name=\"r\"} 0.2"));
    }
}

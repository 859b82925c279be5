//! Tests for the built-in detectors.

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use searchlight_core::time::dt_to_ts;

use super::*;

fn conf() -> searchlight_core::Config {
    serde_yaml::from_str(
        "rules_folder: rules\nrun_every: {minutes: 1}\nbuffer_time: {minutes: 15}\nes_host: localhost\n",
    )
    .unwrap()
}

fn rule_from(yaml: &str) -> Rule {
    let mut rule: Rule = serde_yaml::from_str(yaml).unwrap();
    rule.finalize(&conf()).unwrap();
    rule
}

fn event(ts: chrono::DateTime<Utc>, user: &str) -> serde_json::Value {
    json!({ "@timestamp": dt_to_ts(&ts), "user": user })
}

// ── any ─────────────────────────────────────────────────────────────

#[test]
fn any_emits_every_hit() {
    let mut det = AnyDetector::new();
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_data(vec![event(t, "alice"), event(t, "bob")]);
    assert_eq!(det.matches_mut().len(), 2);
}

// ── frequency ───────────────────────────────────────────────────────

fn frequency_rule() -> Rule {
    rule_from(
        "name: freq\ntype: frequency\nindex: logs-*\nalert: [debug]\nnum_events: 3\ntimeframe: {minutes: 5}\n",
    )
}

#[test]
fn frequency_fires_at_threshold() {
    let mut det = FrequencyDetector::from_rule(&frequency_rule()).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_data(vec![
        event(t0, "alice"),
        event(t0 + Duration::seconds(30), "alice"),
    ]);
    assert!(det.matches_mut().is_empty());
    det.add_data(vec![event(t0 + Duration::seconds(60), "alice")]);
    assert_eq!(det.matches_mut().len(), 1);
    assert_eq!(det.matches_mut()[0]["count"], json!(3));
}

#[test]
fn frequency_window_slides() {
    let mut det = FrequencyDetector::from_rule(&frequency_rule()).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_data(vec![event(t0, "alice"), event(t0 + Duration::seconds(10), "alice")]);
    // Third event outside the 5 minute window; the first two have aged out.
    det.add_data(vec![event(t0 + Duration::minutes(10), "alice")]);
    assert!(det.matches_mut().is_empty());
}

#[test]
fn frequency_tracks_query_keys_independently() {
    let rule = rule_from(
        "name: freq\ntype: frequency\nindex: logs-*\nalert: [debug]\nnum_events: 2\ntimeframe: {minutes: 5}\nquery_key: user\n",
    );
    let mut det = FrequencyDetector::from_rule(&rule).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_data(vec![event(t0, "alice"), event(t0, "bob")]);
    assert!(det.matches_mut().is_empty());
    det.add_data(vec![event(t0 + Duration::seconds(5), "alice")]);
    assert_eq!(det.matches_mut().len(), 1);
    assert_eq!(det.matches_mut()[0]["user"], json!("alice"));
}

#[test]
fn frequency_accepts_count_data() {
    let mut det = FrequencyDetector::from_rule(&frequency_rule()).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_count_data(vec![(t0, 5)]);
    assert_eq!(det.matches_mut().len(), 1);
}

#[test]
fn frequency_requires_params() {
    let rule = rule_from("name: freq\ntype: frequency\nindex: logs-*\nalert: [debug]\n");
    assert!(FrequencyDetector::from_rule(&rule).is_err());
}

// ── flatline ────────────────────────────────────────────────────────

fn flatline_rule() -> Rule {
    rule_from(
        "name: flat\ntype: flatline\nindex: logs-*\nalert: [debug]\nthreshold: 2\ntimeframe: {minutes: 5}\n",
    )
}

#[test]
fn flatline_fires_when_events_stop() {
    let mut det = FlatlineDetector::from_rule(&flatline_rule()).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_count_data(vec![(t0, 3)]);
    // Still within the first timeframe: not yet eligible.
    det.garbage_collect(t0 + Duration::minutes(1));
    assert!(det.matches_mut().is_empty());
    // A full timeframe later the events have aged out.
    det.garbage_collect(t0 + Duration::minutes(6));
    assert_eq!(det.matches_mut().len(), 1);
    assert_eq!(det.matches_mut()[0]["key"], json!("_all"));
}

#[test]
fn flatline_quiet_key_does_not_refire_immediately() {
    let mut det = FlatlineDetector::from_rule(&flatline_rule()).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_count_data(vec![(t0, 3)]);
    det.garbage_collect(t0 + Duration::minutes(6));
    assert_eq!(det.matches_mut().len(), 1);
    // The next tick is inside the restarted observation window.
    det.garbage_collect(t0 + Duration::minutes(7));
    assert_eq!(det.matches_mut().len(), 1);
}

#[test]
fn flatline_satisfied_threshold_stays_quiet() {
    let mut det = FlatlineDetector::from_rule(&flatline_rule()).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    det.add_count_data(vec![(t0, 1)]);
    det.add_count_data(vec![(t0 + Duration::minutes(5), 2)]);
    det.garbage_collect(t0 + Duration::minutes(6));
    assert!(det.matches_mut().is_empty());
}

#[test]
fn flatline_capabilities() {
    let det = FlatlineDetector::from_rule(&flatline_rule()).unwrap();
    assert!(det.triggers_on_absence());
    assert!(!det.allows_scrolling());
}

// ── registry ────────────────────────────────────────────────────────

#[test]
fn registry_rejects_unknown_type() {
    let rule = rule_from("name: r\ntype: does-not-exist\nindex: logs-*\nalert: [debug]\n");
    assert!(matches!(
        build_detector(&rule),
        Err(RuleError::UnknownDetector(_))
    ));
}

//! Timestamp and duration helpers.
//!
//! All internal time is `DateTime<Utc>`. Conversion to a rule's
//! `query_timezone` happens only when range bounds are rendered into a
//! query body; everything else (state, writeback, logs) stays UTC.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Errors from timestamp/duration parsing.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid duration '{0}': expected <units>=<number>, e.g. hours=2")]
    InvalidDuration(String),

    #[error("unknown time unit '{0}'")]
    UnknownUnit(String),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Current instant.
pub fn ts_now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a timestamp string into an absolute instant.
///
/// Accepts RFC 3339 (with or without offset), a bare date, and unix
/// epoch digits (seconds, or milliseconds when 13+ digits). Naive
/// timestamps are interpreted as UTC.
pub fn ts_to_dt(ts: &str) -> Result<DateTime<Utc>, TimeError> {
    let ts = ts.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(ts, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if !ts.is_empty() && ts.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = ts
            .parse()
            .map_err(|_| TimeError::InvalidTimestamp(ts.to_string()))?;
        let dt = if ts.len() >= 13 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
        return dt.ok_or_else(|| TimeError::InvalidTimestamp(ts.to_string()));
    }
    Err(TimeError::InvalidTimestamp(ts.to_string()))
}

/// Render an instant as an RFC 3339 UTC string.
pub fn dt_to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn dt_to_unix(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn unix_to_dt(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Human-friendly timestamp for log lines.
pub fn pretty_ts(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Parse a `<units>=<number>` duration, e.g. `hours=2` or `minutes=30`.
///
/// Supported units: seconds, minutes, hours, days, weeks.
pub fn parse_timedelta(s: &str) -> Result<Duration, TimeError> {
    let (unit, number) = s
        .split_once('=')
        .ok_or_else(|| TimeError::InvalidDuration(s.to_string()))?;
    let n: i64 = number
        .trim()
        .parse()
        .map_err(|_| TimeError::InvalidDuration(s.to_string()))?;
    match unit.trim() {
        "seconds" => Ok(Duration::seconds(n)),
        "minutes" => Ok(Duration::minutes(n)),
        "hours" => Ok(Duration::hours(n)),
        "days" => Ok(Duration::days(n)),
        "weeks" => Ok(Duration::weeks(n)),
        other => Err(TimeError::UnknownUnit(other.to_string())),
    }
}

/// Parse a `<units>=<number>` duration into an absolute deadline from now.
pub fn parse_deadline(s: &str) -> Result<DateTime<Utc>, TimeError> {
    Ok(ts_now() + parse_timedelta(s)?)
}

/// Resolve a named IANA timezone.
pub fn parse_timezone(name: &str) -> Result<Tz, TimeError> {
    name.parse()
        .map_err(|_| TimeError::UnknownTimezone(name.to_string()))
}

/// Render an instant for a query body, converting to `query_timezone`
/// when one is configured.
pub fn ts_for_query(dt: &DateTime<Utc>, tz: Option<&Tz>) -> String {
    match tz {
        Some(tz) => dt
            .with_timezone(tz)
            .to_rfc3339_opts(SecondsFormat::Micros, false),
        None => dt_to_ts(dt),
    }
}

/// Expand strftime-style tokens in an index pattern across a window.
///
/// One index per day touched by `[start, end]`, deduplicated and
/// comma-joined. With `add_extra`, earlier days are prepended until one
/// additional distinct index is present (for events indexed slightly
/// behind their timestamp).
pub fn format_index(
    pattern: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    add_extra: bool,
) -> String {
    let mut indices = std::collections::BTreeSet::new();
    let mut day = start;
    while day.date_naive() <= end.date_naive() {
        indices.insert(day.format(pattern).to_string());
        day += Duration::days(1);
    }
    if add_extra {
        let base_len = indices.len();
        let mut extra = start;
        while indices.len() == base_len {
            extra -= Duration::days(1);
            let formatted = extra.format(pattern).to_string();
            if formatted == pattern {
                // Static index, nothing to expand.
                break;
            }
            indices.insert(formatted);
        }
    }
    indices.into_iter().collect::<Vec<_>>().join(",")
}

/// Replace the format-token span of an index pattern with a wildcard.
///
/// Used when the query window is unknown and a concrete index list
/// cannot be computed.
pub fn wildcard_index(pattern: &str) -> String {
    match (pattern.find('%'), pattern.rfind('%')) {
        (Some(first), Some(last)) => {
            let tail_start = (last + 2).min(pattern.len());
            format!("{}*{}", &pattern[..first], &pattern[tail_start..])
        }
        _ => pattern.to_string(),
    }
}

// ── Interval ────────────────────────────────────────────────────────

/// A configured span of time, deserialized from the YAML unit-map form
/// (`minutes: 5`, `hours: 1`, combinations allowed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Interval {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub weeks: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub days: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub hours: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minutes: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seconds: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub milliseconds: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl Interval {
    pub fn seconds(n: i64) -> Self {
        Self {
            seconds: n,
            ..Self::default()
        }
    }

    pub fn minutes(n: i64) -> Self {
        Self {
            minutes: n,
            ..Self::default()
        }
    }

    pub fn hours(n: i64) -> Self {
        Self {
            hours: n,
            ..Self::default()
        }
    }

    pub fn days(n: i64) -> Self {
        Self {
            days: n,
            ..Self::default()
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::weeks(self.weeks)
            + Duration::days(self.days)
            + Duration::hours(self.hours)
            + Duration::minutes(self.minutes)
            + Duration::seconds(self.seconds)
            + Duration::milliseconds(self.milliseconds)
    }

    pub fn total_seconds(&self) -> i64 {
        self.duration().num_seconds()
    }

    pub fn is_zero(&self) -> bool {
        self.duration().is_zero()
    }

    pub fn std_duration(&self) -> std::time::Duration {
        self.duration()
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

impl From<Interval> for Duration {
    fn from(interval: Interval) -> Self {
        interval.duration()
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.duration().cmp(&other.duration()))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.total_seconds();
        write!(f, "{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_round_trip() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let parsed = ts_to_dt(&dt_to_ts(&dt)).unwrap();
        assert_eq!(parsed, dt);
    }

    #[test]
    fn ts_parses_naive_as_utc() {
        let dt = ts_to_dt("2024-03-01T12:30:45").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap());
    }

    #[test]
    fn ts_parses_offset() {
        let dt = ts_to_dt("2024-03-01T12:30:45+02:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 45).unwrap());
    }

    #[test]
    fn ts_parses_epoch_seconds_and_millis() {
        assert_eq!(
            ts_to_dt("1709294445").unwrap(),
            Utc.timestamp_opt(1_709_294_445, 0).unwrap()
        );
        assert_eq!(
            ts_to_dt("1709294445123").unwrap(),
            Utc.timestamp_millis_opt(1_709_294_445_123).unwrap()
        );
    }

    #[test]
    fn ts_rejects_garbage() {
        assert!(ts_to_dt("not a time").is_err());
    }

    #[test]
    fn timedelta_units() {
        assert_eq!(parse_timedelta("hours=2").unwrap(), Duration::hours(2));
        assert_eq!(parse_timedelta("minutes=30").unwrap(), Duration::minutes(30));
        assert_eq!(parse_timedelta("weeks=1").unwrap(), Duration::weeks(1));
    }

    #[test]
    fn timedelta_rejects_bad_input() {
        assert!(parse_timedelta("2 hours").is_err());
        assert!(parse_timedelta("fortnights=1").is_err());
        assert!(parse_timedelta("hours=abc").is_err());
    }

    #[test]
    fn interval_from_yaml_map() {
        let i: Interval = serde_yaml::from_str("minutes: 5").unwrap();
        assert_eq!(i.duration(), Duration::minutes(5));
        let i: Interval = serde_yaml::from_str("hours: 1\nminutes: 30").unwrap();
        assert_eq!(i.duration(), Duration::minutes(90));
    }

    #[test]
    fn format_index_spans_days() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 3, 2, 0, 0).unwrap();
        let got = format_index("logstash-%Y.%m.%d", start, end, false);
        assert_eq!(got, "logstash-2024.03.01,logstash-2024.03.02,logstash-2024.03.03");
    }

    #[test]
    fn format_index_bound_is_days_plus_one() {
        // Spanning N day boundaries yields at most N+1 indices.
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 5, 23, 0, 0).unwrap();
        let got = format_index("logs-%Y.%m.%d", start, end, false);
        assert_eq!(got.split(',').count(), 5);
    }

    #[test]
    fn format_index_add_extra_prepends_day() {
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap();
        let got = format_index("logs-%Y.%m.%d", start, end, true);
        assert_eq!(got, "logs-2024.03.01,logs-2024.03.02");
    }

    #[test]
    fn wildcard_index_replaces_token_span() {
        assert_eq!(wildcard_index("logstash-%Y.%m.%d"), "logstash-*");
        assert_eq!(wildcard_index("%Y-logs-suffix"), "*-logs-suffix");
        assert_eq!(wildcard_index("static-index"), "static-index");
    }

    #[test]
    fn query_rendering_honors_timezone() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(ts_for_query(&dt, None).ends_with('Z'));
        let tz: Tz = "Europe/Amsterdam".parse().unwrap();
        assert!(ts_for_query(&dt, Some(&tz)).contains("+01:00"));
    }
}

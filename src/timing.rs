//! Elapsed-time calculation and timestamp handling.
//!
//! Every duration in the tracker is the difference of two absolute,
//! timezone-aware timestamps. Nothing here caches or ticks: the live timer is
//! the caller asking for `elapsed_seconds(start, clock.now())` as often as it
//! wants to redraw.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{Result, TrackerError};

/// Zone-less layouts accepted when reading stored timestamps. Values in these
/// layouts are interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Seconds elapsed from `from` to `to`.
///
/// Negative when `to` precedes `from`. Both instants are normalised to UTC
/// first, so mixed offsets compare correctly.
pub fn elapsed_seconds<A: TimeZone, B: TimeZone>(from: &DateTime<A>, to: &DateTime<B>) -> f64 {
    let delta = to.with_timezone(&Utc) - from.with_timezone(&Utc);
    duration_seconds(delta)
}

fn duration_seconds(delta: Duration) -> f64 {
    match delta.num_nanoseconds() {
        Some(nanos) => nanos as f64 / 1e9,
        // Only beyond ~292 years
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// Parse a stored timestamp.
///
/// Accepts RFC 3339 (any offset), `YYYY-MM-DD HH:MM:SS[.f]+HH:MM`, and the
/// zone-less layouts in [`NAIVE_FORMATS`], which are taken to be UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(TrackerError::storage(format!(
        "Unrecognised timestamp '{}'",
        value
    )))
}

/// Canonical storage representation: RFC 3339, UTC, nanosecond precision.
pub fn to_storage_string(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Format seconds as `MM:SS.mmm`.
pub fn format_time(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "--:--".to_string();
    }
    let minutes = (seconds / 60.0).floor();
    let secs = seconds - minutes * 60.0;
    format!("{:02}:{:06.3}", minutes as i64, secs)
}

/// Format a delta with an explicit `+` for slower, e.g. `+1.234s`, `-0.500s`.
pub fn format_delta(seconds: f64) -> String {
    let sign = if seconds > 0.0 { "+" } else { "" };
    format!("{}{:.3}s", sign, seconds)
}

/// Format a delta in minutes, e.g. `+1.25 mins`.
pub fn format_delta_minutes(seconds: f64) -> String {
    let sign = if seconds > 0.0 { "+" } else { "" };
    format!("{}{:.2} mins", sign, seconds / 60.0)
}

// ============================================================================
// Clocks
// ============================================================================

/// Source of "now" for the run lifecycle.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by a (possibly fractional) number of seconds.
    pub fn advance(&self, seconds: f64) {
        let step = Duration::nanoseconds((seconds * 1e9).round() as i64);
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += step;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

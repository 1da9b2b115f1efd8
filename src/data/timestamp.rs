//! Timestamp normalization for upstream date fields
//!
//! CIMA mixes UNIX millisecond timestamps, second timestamps and free-form
//! date strings across endpoints. `normalize_timestamp` turns any of them into
//! an ISO-8601 string with an explicit UTC offset, and hands back the original
//! value untouched when it cannot make sense of it.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Numeric values at or above this magnitude (more than 10 digits) are
/// milliseconds since the epoch; smaller values are seconds.
pub const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// Naive date-time layouts, tried in order. Slash, dash and dot dates are
/// read day-first.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Offset-bearing layouts not covered by RFC 3339 / RFC 2822.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Date-only layouts, interpreted as midnight UTC.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];

/// Normalizes a value that may hold a date into an ISO-8601 string.
///
/// # Behavior
/// - JSON numbers and digit-only strings are UNIX epoch offsets. Values whose
///   magnitude is at least [`MILLIS_THRESHOLD`] are milliseconds, smaller ones
///   are seconds. Floats are truncated.
/// - Other strings go through a permissive parser; results without a timezone
///   are taken as UTC.
/// - Anything else (null, booleans, arrays, objects) is returned unchanged.
///
/// Never panics: unparseable or out-of-range input comes back as-is.
pub fn normalize_timestamp(value: &Value) -> Value {
    let normalized = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().and_then(truncate_float))
            .and_then(from_epoch)
            .map(|dt| format_iso(&dt.fixed_offset())),
        Value::String(text) if is_digits(text) => text
            .parse::<i64>()
            .ok()
            .and_then(from_epoch)
            .map(|dt| format_iso(&dt.fixed_offset())),
        Value::String(text) => parse_date_string(text).map(|dt| format_iso(&dt)),
        _ => None,
    };

    normalized.map(Value::String).unwrap_or_else(|| value.clone())
}

/// Rewrites `value` in place through [`normalize_timestamp`].
pub fn normalize_in_place(value: &mut Value) {
    let normalized = normalize_timestamp(value);
    *value = normalized;
}

/// Parses a free-form date string.
///
/// Returns `None` when no known layout matches.
pub fn parse_date_string(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt);
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc().fixed_offset());
        }
    }

    None
}

/// Converts an epoch offset to a UTC date-time using the magnitude rule.
pub fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.unsigned_abs() >= MILLIS_THRESHOLD as u64 {
        DateTime::from_timestamp_millis(raw)
    } else {
        DateTime::from_timestamp(raw, 0)
    }
}

fn truncate_float(raw: f64) -> Option<i64> {
    if raw.is_finite() && raw.abs() < i64::MAX as f64 {
        Some(raw.trunc() as i64)
    } else {
        None
    }
}

fn is_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

fn format_iso(dt: &DateTime<FixedOffset>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

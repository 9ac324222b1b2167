//! Timestamp handling.
//!
//! Everything inside the client is Unix milliseconds. The backend sends
//! ISO-8601 text, sometimes with an offset (`2024-05-01T12:00:00Z`) and
//! sometimes without one (`2024-05-01T12:00:00.123`). Offset-less values are
//! taken as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parse a backend timestamp into Unix millis.
pub fn parse_timestamp(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return u64::try_from(dt.timestamp_millis()).ok();
    }
    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(text, fmt)
            .ok()
            .and_then(|naive| u64::try_from(naive.and_utc().timestamp_millis()).ok())
    })
}

/// Format Unix millis as RFC 3339 (UTC, millisecond precision).
pub fn format_timestamp(millis: u64) -> String {
    let millis = i64::try_from(millis).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

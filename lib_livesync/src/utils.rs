//! Small time helpers shared by the engine and the binaries.

use chrono::Utc;

/// Current wall-clock time as Unix milliseconds.
///
/// Source timestamps on the wire use the same unit, so ages are a plain
/// subtraction.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// RFC 3339 rendering of a Unix-millisecond timestamp, for log lines.
pub fn millis_to_rfc3339(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

//! RFC3339(Nano) timestamp parsing (spec §4.1).
//!
//! Empty or unparseable input is "unknown", represented as `None` rather than
//! a zero `DateTime` so callers can't accidentally format a bogus epoch time.

use chrono::{DateTime, Utc};

/// Parse an RFC3339 timestamp, tolerating the nanosecond-precision variants
/// emitted by all three agents. Returns `None` on empty or unparseable input.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

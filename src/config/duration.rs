//! Human-readable duration strings ("500ms", "5s", "2m", "1h", "7d").

use crate::error::{Error, Result};
use std::time::Duration;

/// Parse a duration string like "500ms", "30s", "2m", "1h" or "7d".
///
/// A bare number is read as seconds. Returns `None` when the string
/// cannot be parsed.
///
/// ```
/// use stackup::config::parse_duration_string;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration_string("5s"), Some(Duration::from_secs(5)));
/// assert_eq!(parse_duration_string("250ms"), Some(Duration::from_millis(250)));
/// assert_eq!(parse_duration_string("2m"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_duration_string("30"), Some(Duration::from_secs(30)));
/// ```
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (digits, millis_per_unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, 86_400_000)
    } else {
        (s, 1_000)
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()?
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
}

/// Resolve an optional duration field, falling back to `default` when unset.
///
/// `field` names the setting in error messages.
pub fn resolve_duration(field: &str, value: Option<&str>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration_string(raw).ok_or_else(|| {
            Error::Validation(format!(
                "{} has invalid duration '{}' (expected e.g. 500ms, 5s, 2m)",
                field, raw
            ))
        }),
    }
}

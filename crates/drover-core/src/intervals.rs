//! Fixed interval strings such as `"30s"`, `"5m"`, `"1h"`, `"2d"`.

use crate::error::{Result, TaskManagerError};
use chrono::Duration;

/// Parse an interval string into milliseconds.
///
/// Accepts a positive integer followed by one of `s`, `m`, `h`, `d`.
pub fn parse_interval_millis(interval: &str) -> Result<i64> {
    let invalid = || TaskManagerError::InvalidSchedule(format!("invalid interval '{}'", interval));

    let unit = interval.chars().last().ok_or_else(invalid)?;
    let digits = &interval[..interval.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(TaskManagerError::InvalidSchedule(format!(
            "interval '{}' must be greater than zero",
            interval
        )));
    }

    let unit_ms: i64 = match unit {
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        _ => return Err(invalid()),
    };

    amount.checked_mul(unit_ms).ok_or_else(invalid)
}

/// Parse an interval string into a [`Duration`].
pub fn parse_interval(interval: &str) -> Result<Duration> {
    parse_interval_millis(interval).map(Duration::milliseconds)
}

/// Whether the string is a well-formed interval.
pub fn is_interval(interval: &str) -> bool {
    parse_interval_millis(interval).is_ok()
}

/// Render a millisecond count as the coarsest exact interval string.
pub fn as_interval(millis: i64) -> String {
    const UNITS: [(i64, char); 3] = [(86_400_000, 'd'), (3_600_000, 'h'), (60_000, 'm')];
    for (unit_ms, suffix) in UNITS {
        if millis >= unit_ms && millis % unit_ms == 0 {
            return format!("{}{}", millis / unit_ms, suffix);
        }
    }
    format!("{}s", (millis / 1_000).max(1))
}

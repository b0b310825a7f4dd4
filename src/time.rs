use chrono::{DateTime, Utc};

/// Human-readable age of `timestamp` as seen from `now`, e.g. "5 minutes ago".
///
/// Timestamps in the future render as "in ...", anything within ten seconds as "just now".
pub fn relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(timestamp);
    let secs = delta.num_seconds();
    if secs.abs() < 10 {
        return "just now".to_string();
    }

    let magnitude = secs.unsigned_abs();
    let (value, unit) = match magnitude {
        s if s < 60 => (s, "second"),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s if s < 30 * 86_400 => (s / 86_400, "day"),
        s if s < 365 * 86_400 => (s / (30 * 86_400), "month"),
        s => (s / (365 * 86_400), "year"),
    };
    let plural = if value == 1 { "" } else { "s" };

    if secs > 0 {
        format!("{value} {unit}{plural} ago")
    } else {
        format!("in {value} {unit}{plural}")
    }
}

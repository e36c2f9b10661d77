//! Timestamp parsing and run time axes

use crate::errors::{FusionError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse RFC 3339 or a naive `YYYY-MM-DD HH:MM[:SS]` timestamp taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| {
            FusionError::config(format!(
                "invalid timestamp '{s}', expected RFC 3339 or 'YYYY-MM-DD HH:MM'"
            ))
        })
}

/// Every `step` from `start` through `end`, both ends included.
///
/// # Errors
///
/// Returns a Config error if `start > end` or `step` is not positive.
pub fn time_range(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Result<Vec<DateTime<Utc>>> {
    if step <= Duration::zero() {
        return Err(FusionError::config("time step must be positive"));
    }
    if start > end {
        return Err(FusionError::config(format!(
            "start {start} is after end {end}"
        )));
    }
    let mut times = Vec::new();
    let mut t = start;
    while t <= end {
        times.push(t);
        t += step;
    }
    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_formats() {
        let a = parse_timestamp("2024-07-01T06:00:00Z").unwrap();
        let b = parse_timestamp("2024-07-01 06:00").unwrap();
        assert_eq!(a, b);
        let c = parse_timestamp("2024-07-01T08:00:00+02:00").unwrap();
        assert_eq!(a, c);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn inclusive_hourly_range() {
        let start = parse_timestamp("2024-07-01 00:00").unwrap();
        let end = parse_timestamp("2024-07-01 03:00").unwrap();
        let times = time_range(start, end, Duration::hours(1)).unwrap();
        assert_eq!(times.len(), 4);
        assert_eq!(times[3], end);
        assert_eq!(time_range(start, start, Duration::hours(1)).unwrap(), vec![start]);
        assert!(time_range(end, start, Duration::hours(1)).is_err());
    }
}

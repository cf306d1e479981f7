//! Timer schedules: durations and next firing times

use chrono::{DateTime, Duration, Utc};

use crate::types::ScheduleSpec;

/// Parses `"100ms"`, `"3s"`, `"1m30s"`, `"2h"`, `"1d"`, `"1w"`
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return (secs >= 0.0).then(|| Duration::milliseconds((secs * 1000.0) as i64));
    }

    let mut total = Duration::zero();
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let millis = match &rest[..unit_len] {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            "w" => 604_800_000.0,
            _ => return None,
        };
        rest = &rest[unit_len..];

        total = total + Duration::milliseconds((value * millis) as i64);
    }

    Some(total)
}

impl ScheduleSpec {
    pub fn is_recurring(&self) -> bool {
        matches!(self, ScheduleSpec::Every(_))
    }

    /// Next firing time after `from`, None when the schedule cannot be read
    pub fn next_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::In(s) | ScheduleSpec::Every(s) => parse_duration(s).map(|d| from + d),
            ScheduleSpec::At(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("100ms"), Some(Duration::milliseconds(100)));
        assert_eq!(parse_duration("3s"), Some(Duration::seconds(3)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::seconds(90)));
        assert_eq!(parse_duration("1.5"), Some(Duration::milliseconds(1500)));
        assert_eq!(parse_duration("2h"), Some(Duration::hours(2)));
        assert_eq!(parse_duration("1d1h"), Some(Duration::hours(25)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("3x"), None);
    }

    #[test]
    fn test_next_time() {
        let from = Utc::now();

        let spec = ScheduleSpec::In("2s".to_string());
        assert_eq!(spec.next_time(from), Some(from + Duration::seconds(2)));
        assert!(!spec.is_recurring());

        let at = ScheduleSpec::At("2030-01-01T00:00:00Z".to_string());
        assert_eq!(
            at.next_time(from).map(|t| t.to_rfc3339()),
            Some("2030-01-01T00:00:00+00:00".to_string())
        );

        assert!(ScheduleSpec::Every("1m".to_string()).is_recurring());
        assert_eq!(ScheduleSpec::At("nope".to_string()).next_time(from), None);
    }
}

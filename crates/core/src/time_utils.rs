//! Timestamp helpers. Stored timestamps are RFC 3339 strings.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn to_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Milliseconds since epoch for the first parsable candidate, else 0.
pub fn first_timestamp_ms<'a, I>(candidates: I) -> i64
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .flatten()
        .find_map(parse_timestamp)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_through_candidates() {
        assert_eq!(
            first_timestamp_ms([Some("garbage"), Some("1970-01-01T00:00:01Z")]),
            1000
        );
        assert_eq!(first_timestamp_ms([None, Some("nope")]), 0);
    }

    #[test]
    fn compares_instants_not_offsets() {
        let a = first_timestamp_ms([Some("2026-01-01T01:00:00+01:00")]);
        let b = first_timestamp_ms([Some("2026-01-01T00:00:00Z")]);
        assert_eq!(a, b);
    }
}

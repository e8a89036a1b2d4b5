//! UTC-naive timestamp handling at the storage boundary.
//!
//! The chat library hands out timezone-aware values; both store dialects
//! persist naive UTC so queries behave identically. The viewer re-applies a
//! display timezone on its own.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Normalise a timezone-aware value to naive UTC.
pub fn to_utc_naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

pub fn to_utc_naive_opt(dt: Option<DateTime<Utc>>) -> Option<NaiveDateTime> {
    dt.map(to_utc_naive)
}

pub fn now_utc_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Render for the embedded store, which keeps timestamps as text.
pub fn format_ts(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Parse a stored timestamp. Accepts the space-separated form with or
/// without fractional seconds, plus the ISO `T` separator for values written
/// by other tooling.
pub fn parse_ts(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn aware_values_lose_their_offset() {
        let aware = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        assert_eq!(format_ts(to_utc_naive(aware)), "2024-06-01 12:30:00.000000");
    }

    #[test]
    fn format_parse_round_trip_at_microsecond_precision() {
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 15, 123456)
            .unwrap();
        assert_eq!(parse_ts(&format_ts(dt)), Some(dt));
    }

    #[test]
    fn parses_second_precision_and_iso_forms() {
        assert!(parse_ts("2024-06-01 12:30:00").is_some());
        assert!(parse_ts("2024-06-01T12:30:00.123456").is_some());
        assert!(parse_ts("not a date").is_none());
    }
}

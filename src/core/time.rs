//! Timestamp helpers shared by the store, the reports, and the CLI.
//!
//! All instants are UTC. Persisted timestamps use RFC 3339 with millisecond
//! precision and a `Z` suffix so that lexical order equals chronological order.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::core::errors::{DlgError, Result};

/// Format an instant in the canonical persisted form.
#[must_use]
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 instant (any offset) into UTC.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DlgError::InvalidQuery {
            details: format!("invalid timestamp {raw:?}: {e}"),
        })
}

/// Validate that `start <= end`.
pub fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end < start {
        return Err(DlgError::InvalidTimeRange {
            start: format_ts(start),
            end: format_ts(end),
        });
    }
    Ok(())
}

/// Parse a compact duration such as `15m`, `24h`, `7d`, `90s`.
///
/// A bare number is read as minutes.
pub fn parse_window(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(DlgError::InvalidQuery {
            details: "empty window string".to_string(),
        });
    }
    let (digits, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n: i64 = digits.parse().map_err(|_| DlgError::InvalidQuery {
        details: format!("invalid window value: {s}"),
    })?;
    let seconds_per_unit = match suffix {
        "s" | "sec" => 1,
        "m" | "min" | "" => 60,
        "h" | "hr" => 3_600,
        "d" | "day" => 86_400,
        "w" | "wk" => 7 * 86_400,
        _ => {
            return Err(DlgError::InvalidQuery {
                details: format!("unknown window suffix: {suffix}"),
            });
        }
    };
    n.checked_mul(seconds_per_unit)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| DlgError::InvalidQuery {
            details: format!("window out of range: {s}"),
        })
}

/// `end - window`, rejecting results outside the representable range.
pub fn window_start(end: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    end.checked_sub_signed(window)
        .ok_or_else(|| DlgError::InvalidQuery {
            details: format!("window of {}s reaches before the earliest instant", window.num_seconds()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_is_fixed_width_and_sortable() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).unwrap();
        let b = a + Duration::milliseconds(1);
        assert_eq!(format_ts(a), "2026-03-01T09:05:00.000Z");
        assert!(format_ts(a) < format_ts(b));
    }

    #[test]
    fn parse_accepts_offsets() {
        let ts = parse_ts("2026-03-01T10:05:00+01:00").unwrap();
        assert_eq!(format_ts(ts), "2026-03-01T09:05:00.000Z");
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = parse_ts("yesterday").unwrap_err();
        assert_eq!(err.code(), "DLG-2304");
    }

    #[test]
    fn inverted_range_rejected() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let err = check_range(start, start - Duration::minutes(1)).unwrap_err();
        assert!(matches!(err, DlgError::InvalidTimeRange { .. }));
        assert!(check_range(start, start).is_ok());
    }

    #[test]
    fn window_suffixes() {
        let cases = [
            ("90s", 90),
            ("15m", 900),
            ("15min", 900),
            ("2h", 7_200),
            ("1day", 86_400),
            ("2w", 1_209_600),
            ("60", 3_600),
        ];
        for (input, secs) in cases {
            assert_eq!(parse_window(input).unwrap().num_seconds(), secs, "{input}");
        }
        assert!(parse_window("").is_err());
        assert!(parse_window("5y").is_err());
    }

    #[test]
    fn oversized_window_is_rejected_not_panicking() {
        let err = parse_window("999999999999999999d").unwrap_err();
        assert_eq!(err.code(), "DLG-2304");
        assert!(parse_window("9223372036854775807s").is_err());

        let end = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let huge = parse_window("100000000w").unwrap();
        assert_eq!(window_start(end, huge).unwrap_err().code(), "DLG-2304");
        assert_eq!(
            window_start(end, Duration::hours(2)).unwrap(),
            end - Duration::hours(2)
        );
    }
}

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{CoreError, Result};

/// Current UTC time truncated to microseconds, the precision timestamps are
/// stored with. Truncating up front keeps an in-memory value equal to what a
/// reload from the database would produce.
pub fn utc_now() -> DateTime<Utc> {
    truncate(Utc::now())
}

pub fn truncate(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(dt.timestamp_micros()).unwrap_or(dt)
}

/// Fixed-width RFC 3339 (`2026-01-02T03:04:05.123456Z`). Lexical order of the
/// text equals chronological order, which the polling queries rely on.
pub fn to_db(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Timestamp(format!("{raw}: {e}")))
}

/// Seconds as a `Duration`. Negative and non-finite values collapse to zero
/// instead of panicking.
pub fn duration_from_secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Latest instant the fixed-width text encoding can hold,
/// `9999-12-31T23:59:59.999999Z`.
pub fn max_db_time() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(253_402_300_799_999_999).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Earliest instant the fixed-width text encoding can hold,
/// `0001-01-01T00:00:00.000000Z`.
pub fn min_db_time() -> DateTime<Utc> {
    DateTime::from_timestamp(-62_135_596_800, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Largest delay in seconds that keeps `from + delay` storable.
pub fn max_delay_secs(from: DateTime<Utc>) -> f64 {
    let remaining = max_db_time().signed_duration_since(from);
    remaining.num_milliseconds().max(0) as f64 / 1000.0
}

/// `base + delay`, saturating at [`max_db_time`].
pub fn add(base: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| base.checked_add_signed(d))
        .map_or_else(max_db_time, |dt| dt.min(max_db_time()))
}

/// `base - delay`, saturating at [`min_db_time`].
pub fn sub(base: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| base.checked_sub_signed(d))
        .map_or_else(min_db_time, |dt| dt.max(min_db_time()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_format_round_trips_exactly() {
        let now = utc_now();
        let raw = to_db(now);
        assert_eq!(raw.len(), "2026-01-02T03:04:05.123456Z".len());
        assert_eq!(from_db(&raw).expect("parse"), now);
    }

    #[test]
    fn db_format_sorts_chronologically() {
        let early = utc_now();
        let late = add(early, Duration::from_millis(1500));
        assert!(to_db(early) < to_db(late));
    }

    #[test]
    fn garbage_timestamp_is_an_error() {
        assert!(matches!(from_db("yesterday"), Err(CoreError::Timestamp(_))));
    }

    #[test]
    fn absurd_delays_saturate_at_a_storable_instant() {
        let now = utc_now();
        let far = add(now, duration_from_secs(1.0e12));
        assert_eq!(far, max_db_time());
        assert_eq!(to_db(far), "9999-12-31T23:59:59.999999Z");
        assert_eq!(from_db(&to_db(far)).expect("parse"), far);

        let early = sub(now, duration_from_secs(1.0e12));
        assert_eq!(to_db(early), "0001-01-01T00:00:00.000000Z");
        assert!(to_db(early) < to_db(now));
    }

    #[test]
    fn max_delay_reaches_the_last_storable_year() {
        let now = utc_now();
        let limit = max_delay_secs(now);
        assert!(limit > 1.0e9);
        assert!(to_db(add(now, duration_from_secs(limit))).starts_with("9999-"));
        assert_eq!(max_delay_secs(max_db_time()), 0.0);
    }
}

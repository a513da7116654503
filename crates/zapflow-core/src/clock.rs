//! Local wall-clock helpers. Business hours and the daily quota boundary are
//! both evaluated in the configured timezone, never in UTC.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

/// Current local time-of-day in `tz`.
pub fn local_time(now: DateTime<Utc>, tz: Tz) -> NaiveTime {
    now.with_timezone(&tz).time()
}

/// Current local calendar date in `tz`.
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_rolls_over_in_local_zone() {
        // 02:00 UTC is still the previous day in São Paulo (UTC-3).
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap();
        let tz: Tz = "America/Sao_Paulo".parse().unwrap();
        assert_eq!(local_date(now, tz), NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(local_time(now, tz), NaiveTime::from_hms_opt(23, 0, 0).unwrap());
    }
}

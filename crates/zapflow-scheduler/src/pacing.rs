//! Pacing: whether a send may start now, and how long to wait afterwards.
//!
//! Jitter keeps consecutive sends from forming a fixed, detectable rhythm.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use rand::Rng;
use std::time::Duration;
use zapflow_core::clock;

use crate::job::{BusinessHours, PacingConfig, SendQuota};

/// No window configured means sends are always allowed.
pub fn within_allowed_window(window: Option<&BusinessHours>, now: NaiveTime) -> bool {
    window.is_none_or(|w| w.contains(now))
}

/// Sends left today. A counter stamped with an older date counts as zero.
pub fn quota_remaining(quota: &SendQuota, today: NaiveDate) -> i64 {
    let sent = if quota.last_reset_date != today {
        0
    } else {
        quota.sent_today as i64
    };
    quota.daily_limit as i64 - sent
}

/// Uniform integer in `[min, max]`, both inclusive. Inverted bounds are swapped.
pub fn next_delay_with<R: Rng + ?Sized>(rng: &mut R, min_secs: u64, max_secs: u64) -> u64 {
    let (lo, hi) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    rng.gen_range(lo..=hi)
}

pub fn next_delay(min_secs: u64, max_secs: u64) -> u64 {
    next_delay_with(&mut rand::thread_rng(), min_secs, max_secs)
}

/// True every `pause_after` successful sends. `pause_after == 0` disables batching.
pub fn batch_pause_needed(sent_since_last_pause: u32, pause_after: u32) -> bool {
    pause_after > 0 && sent_since_last_pause >= pause_after
}

/// A job's pacing rules bound to the timezone its windows are expressed in.
#[derive(Debug, Clone)]
pub struct PacingPolicy {
    pacing: PacingConfig,
    window: Option<BusinessHours>,
    tz: Tz,
}

impl PacingPolicy {
    pub fn new(pacing: PacingConfig, window: Option<BusinessHours>, tz: Tz) -> Self {
        Self { pacing, window, tz }
    }

    pub fn window(&self) -> Option<&BusinessHours> {
        self.window.as_ref()
    }

    /// Gates starting a send only; a send in flight is never interrupted.
    pub fn sending_allowed(&self, now: DateTime<Utc>) -> bool {
        within_allowed_window(self.window.as_ref(), clock::local_time(now, self.tz))
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        clock::local_date(now, self.tz)
    }

    pub fn quota_remaining(&self, quota: &SendQuota, now: DateTime<Utc>) -> i64 {
        quota_remaining(quota, self.today(now))
    }

    pub fn next_delay(&self) -> Duration {
        Duration::from_secs(next_delay(self.pacing.min_delay_secs, self.pacing.max_delay_secs))
    }

    pub fn batch_pause_needed(&self, sent_since_last_pause: u32) -> bool {
        batch_pause_needed(sent_since_last_pause, self.pacing.pause_after)
    }

    pub fn batch_pause_duration(&self) -> Duration {
        Duration::from_secs(self.pacing.pause_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quota(sent: u32, limit: u32, date: NaiveDate) -> SendQuota {
        SendQuota {
            instance_id: "i1".into(),
            sent_today: sent,
            daily_limit: limit,
            last_reset_date: date,
        }
    }

    #[test]
    fn test_delay_within_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let d = next_delay_with(&mut rng, 3, 9);
            assert!((3..=9).contains(&d));
        }
    }

    #[test]
    fn test_fixed_delay() {
        for _ in 0..50 {
            assert_eq!(next_delay(5, 5), 5);
        }
    }

    #[test]
    fn test_inverted_bounds_are_swapped() {
        for _ in 0..50 {
            let d = next_delay(10, 2);
            assert!((2..=10).contains(&d));
        }
    }

    #[test]
    fn test_batch_pause() {
        assert!(!batch_pause_needed(1, 2));
        assert!(batch_pause_needed(2, 2));
        assert!(!batch_pause_needed(100, 0));
    }

    #[test]
    fn test_quota_same_day() {
        let today = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        assert_eq!(quota_remaining(&quota(7, 10, today), today), 3);
        assert_eq!(quota_remaining(&quota(10, 10, today), today), 0);
    }

    #[test]
    fn test_quota_resets_on_new_day() {
        let yesterday = NaiveDate::from_ymd_opt(2026, 5, 3).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        assert_eq!(quota_remaining(&quota(10, 10, yesterday), today), 10);
    }

    #[test]
    fn test_window_in_local_time() {
        let tz: Tz = "America/Sao_Paulo".parse().unwrap();
        let policy = PacingPolicy::new(
            PacingConfig::default(),
            BusinessHours::parse("08:00", "18:00"),
            tz,
        );
        // 12:00 UTC = 09:00 local.
        assert!(policy.sending_allowed(Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()));
        // 23:00 UTC = 20:00 local.
        assert!(!policy.sending_allowed(Utc.with_ymd_and_hms(2026, 5, 4, 23, 0, 0).unwrap()));
    }

    #[test]
    fn test_no_window_always_allowed() {
        assert!(within_allowed_window(None, NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
    }
}

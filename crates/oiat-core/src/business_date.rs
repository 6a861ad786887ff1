//! Business timezone and trading-day date arithmetic.
//!
//! Every raw POS row is assigned to exactly one business date. In calendar
//! mode that is the row's date in the business timezone. In trading-day
//! mode, rows timestamped strictly before the daily cutoff belong to the
//! previous date (a 04:59 sale counts toward yesterday's trading day when
//! the cutoff is 05:00; a 05:00 sale does not).

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Trading-day cutoff in the business timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoff {
    /// Cutoff hour (0-23).
    pub hour: u8,
    /// Cutoff minute (0-59).
    pub minute: u8,
}

impl Cutoff {
    /// Creates a cutoff, clamping out-of-range values to the defaults.
    #[must_use]
    pub fn new(hour: u8, minute: u8) -> Self {
        Self {
            hour: if hour > 23 { 5 } else { hour },
            minute: if minute > 59 { 0 } else { minute },
        }
    }

    fn as_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl Default for Cutoff {
    fn default() -> Self {
        Self { hour: 5, minute: 0 }
    }
}

/// Resolves the business timezone from `OIAT_BUSINESS_TIMEZONE`.
///
/// Falls back to `Africa/Lagos`, then UTC if the configured name does not
/// parse.
#[must_use]
pub fn business_timezone() -> Tz {
    let name =
        std::env::var("OIAT_BUSINESS_TIMEZONE").unwrap_or_else(|_| "Africa/Lagos".to_string());
    name.parse().unwrap_or(chrono_tz::UTC)
}

/// Resolves the business-day cutoff from `OIAT_BUSINESS_DAY_CUTOFF_HOUR`
/// and `OIAT_BUSINESS_DAY_CUTOFF_MINUTE` (defaults 05:00).
#[must_use]
pub fn business_day_cutoff() -> Cutoff {
    let hour = env_u8("OIAT_BUSINESS_DAY_CUTOFF_HOUR", 5, 23);
    let minute = env_u8("OIAT_BUSINESS_DAY_CUTOFF_MINUTE", 0, 59);
    Cutoff::new(hour, minute)
}

fn env_u8(key: &str, default: u8, max: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|v| *v <= max)
        .unwrap_or(default)
}

/// Trading date for a local timestamp: the calendar date, shifted back one
/// day when the time is strictly before the cutoff.
#[must_use]
pub fn trading_date_for(local: NaiveDateTime, cutoff: Cutoff) -> NaiveDate {
    if local.time() < cutoff.as_time() {
        local.date() - Duration::days(1)
    } else {
        local.date()
    }
}

/// The date a scheduled run should process right now.
///
/// Yesterday in business time; the day before that when the current local
/// time has not yet reached the cutoff (yesterday's trading day is still
/// open).
#[must_use]
pub fn target_trading_date(now: DateTime<Utc>, tz: Tz, cutoff: Cutoff) -> NaiveDate {
    let local = now.with_timezone(&tz);
    let days_back = if local.time() < cutoff.as_time() { 2 } else { 1 };
    local.date_naive() - Duration::days(days_back)
}

/// Converts a possibly-naive timestamp into the business timezone.
///
/// Naive timestamps are interpreted as already being in business local
/// time, which matches how the POS exports its clock.
#[must_use]
pub fn to_business_local(naive: NaiveDateTime, tz: Tz) -> NaiveDateTime {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.naive_local()
        }
        chrono::LocalResult::None => naive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn before_cutoff_shifts_to_previous_date() {
        let cutoff = Cutoff::new(5, 0);
        assert_eq!(
            trading_date_for(dt(2025, 1, 31, 4, 59), cutoff),
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap()
        );
    }

    #[test]
    fn at_cutoff_exactly_stays_on_current_date() {
        let cutoff = Cutoff::new(5, 0);
        assert_eq!(
            trading_date_for(dt(2025, 1, 31, 5, 0), cutoff),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()
        );
    }

    #[test]
    fn after_cutoff_stays_on_current_date() {
        let cutoff = Cutoff::new(5, 30);
        assert_eq!(
            trading_date_for(dt(2025, 1, 31, 23, 0), cutoff),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()
        );
    }

    #[test]
    fn target_date_is_yesterday_after_cutoff() {
        let tz: Tz = "Africa/Lagos".parse().unwrap();
        // 10:00 UTC = 11:00 WAT, past the 05:00 cutoff.
        let now = Utc.with_ymd_and_hms(2025, 12, 28, 10, 0, 0).unwrap();
        assert_eq!(
            target_trading_date(now, tz, Cutoff::default()),
            NaiveDate::from_ymd_opt(2025, 12, 27).unwrap()
        );
    }

    #[test]
    fn target_date_is_two_back_before_cutoff() {
        let tz: Tz = "Africa/Lagos".parse().unwrap();
        // 03:00 UTC = 04:00 WAT, before the 05:00 cutoff.
        let now = Utc.with_ymd_and_hms(2025, 12, 28, 3, 0, 0).unwrap();
        assert_eq!(
            target_trading_date(now, tz, Cutoff::default()),
            NaiveDate::from_ymd_opt(2025, 12, 26).unwrap()
        );
    }

    #[test]
    fn cutoff_clamps_out_of_range() {
        let cutoff = Cutoff::new(99, 99);
        assert_eq!(cutoff, Cutoff { hour: 5, minute: 0 });
    }
}

//! Civil-time arithmetic, all pinned to Europe/Madrid (SPEC_FULL.md §4.1).
//!
//! `chrono` alone has no IANA timezone database; `chrono-tz` supplies the
//! DST-aware conversions the original Python `zoneinfo`-based scheduler
//! relies on.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Europe::Madrid;
use chrono_tz::Tz;

/// A source of "now", injectable so tests can pin an instant.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    fn now_madrid(&self) -> NaiveDateTime {
        self.now_utc().with_timezone(&Madrid).naive_local()
    }

    fn today_madrid(&self) -> NaiveDate {
        self.now_madrid().date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock fixed at a given instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

/// The first date `>= base` whose weekday matches `dow` (0 = Monday).
pub fn next_date_for_weekday(base: NaiveDate, dow: u32) -> NaiveDate {
    let base_dow = base.weekday().num_days_from_monday();
    let delta = (dow + 7 - base_dow) % 7;
    base + Duration::days(delta as i64)
}

/// Target-date selection per SPEC_FULL.md §4.5:
///
/// - base = `last_booked_date + 1 day` if set, else today.
/// - candidate = first date ≥ base whose weekday equals `dow`.
/// - if `local_time` on candidate is already in the past, skip to the next
///   occurrence of `dow` starting tomorrow.
pub fn target_datetime(
    now_madrid: NaiveDateTime,
    last_booked_date: Option<NaiveDate>,
    dow: u32,
    local_time: NaiveTime,
) -> NaiveDateTime {
    let today = now_madrid.date();
    let base = last_booked_date.map(|d| d + Duration::days(1)).unwrap_or(today);
    let candidate = next_date_for_weekday(base, dow);
    let candidate_dt = candidate.and_time(local_time);

    if candidate_dt <= now_madrid {
        let next_base = candidate + Duration::days(1);
        let candidate = next_date_for_weekday(next_base, dow);
        candidate.and_time(local_time)
    } else {
        candidate_dt
    }
}

/// `windowOpen = (candidate − windowOpenOffsetDays) at windowOpenLocalTime`.
pub fn window_open_datetime(
    target: NaiveDateTime,
    window_open_offset_days: i64,
    window_open_local_time: NaiveTime,
) -> NaiveDateTime {
    (target.date() - Duration::days(window_open_offset_days)).and_time(window_open_local_time)
}

/// Convert a Madrid-local naive datetime to its UTC instant.
pub fn madrid_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Madrid
        .from_local_datetime(&naive)
        .single()
        .unwrap_or_else(|| Madrid.from_utc_datetime(&naive))
        .with_timezone(&Utc)
}

/// `epoch = floor(UTC midnight of localDate / 1s)` — the key the portal's
/// daily schedule is keyed by (SPEC_FULL.md §6).
pub fn utc_midnight_epoch(date: NaiveDate) -> i64 {
    let midnight = date.and_hms_opt(0, 0, 0).expect("valid midnight");
    madrid_to_utc(midnight).timestamp()
}

pub const MADRID: Tz = Madrid;

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, m: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn next_date_for_weekday_same_day() {
        // 2025-07-07 is a Monday (dow=0)
        let base = NaiveDate::from_ymd_opt(2025, 7, 7).unwrap();
        assert_eq!(next_date_for_weekday(base, 0), base);
    }

    #[test]
    fn next_date_for_weekday_wraps() {
        let monday = NaiveDate::from_ymd_opt(2025, 7, 7).unwrap();
        let sunday = next_date_for_weekday(monday, 6);
        assert_eq!(sunday, NaiveDate::from_ymd_opt(2025, 7, 13).unwrap());
    }

    #[test]
    fn target_datetime_future_time_same_week() {
        // Now = Sat 2025-07-05 06:00, reservation Mon 10:00, no last_booked_date.
        let now = dt(2025, 7, 5, 6, 0);
        let target = target_datetime(now, None, 0, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(target, dt(2025, 7, 7, 10, 0));
    }

    #[test]
    fn target_datetime_today_in_past_skips_to_next_week() {
        // dow == today, localTime already passed -> next week's occurrence.
        let monday = dt(2025, 7, 7, 12, 0); // Monday noon
        let target = target_datetime(
            monday,
            None,
            0, // Monday
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        );
        assert_eq!(target, dt(2025, 7, 14, 10, 0));
    }

    #[test]
    fn target_datetime_last_booked_today_advances() {
        // lastBookedDate == today with dow == today -> next weekday occurrence.
        let monday_morning = dt(2025, 7, 7, 6, 0);
        let last_booked = NaiveDate::from_ymd_opt(2025, 7, 7).unwrap();
        let target = target_datetime(
            monday_morning,
            Some(last_booked),
            0,
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        );
        assert_eq!(target, dt(2025, 7, 14, 10, 0));
    }

    #[test]
    fn window_open_offset_zero_same_day() {
        let target = dt(2025, 7, 7, 10, 0);
        let window = window_open_datetime(target, 0, NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        assert_eq!(window.date(), target.date());
        assert_eq!(window.time(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
    }

    #[test]
    fn window_open_offset_two_days_before() {
        let target = dt(2025, 7, 7, 10, 0); // Monday
        let window = window_open_datetime(target, 2, NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        assert_eq!(window.date(), NaiveDate::from_ymd_opt(2025, 7, 5).unwrap());
    }

    #[test]
    fn target_datetime_deterministic() {
        let now = dt(2025, 7, 5, 6, 0);
        let t1 = target_datetime(now, None, 0, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        let t2 = target_datetime(now, None, 0, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(t1, t2);
    }

    #[test]
    fn utc_midnight_epoch_roundtrips_date() {
        let date = NaiveDate::from_ymd_opt(2025, 7, 10).unwrap();
        let epoch = utc_midnight_epoch(date);
        let recovered = DateTime::<Utc>::from_timestamp(epoch, 0).unwrap();
        let madrid_date = recovered.with_timezone(&MADRID).date_naive();
        assert_eq!(madrid_date, date);
    }
}

//! Clock helpers
//!
//! The ledger stores timestamps as RFC 3339 TEXT with second precision;
//! truncating nanoseconds here keeps stored values lexicographically
//! comparable in SQL.

use time::{Date, Duration, Month, OffsetDateTime};

/// Current UTC time truncated to whole seconds.
pub fn utc_now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// One renewal interval from `from` (calendar month, day clamped to the
/// target month's length).
pub fn plus_one_month(from: OffsetDateTime) -> OffsetDateTime {
    let (mut year, month, day) = (from.year(), from.month(), from.day());
    let next_month = match month {
        Month::December => {
            year += 1;
            Month::January
        }
        m => m.next(),
    };
    clamp_date(from, year, next_month, day)
}

/// `years` calendar years from `from` (Feb 29 clamps to Feb 28).
pub fn plus_years(from: OffsetDateTime, years: i32) -> OffsetDateTime {
    clamp_date(from, from.year() + years, from.month(), from.day())
}

fn clamp_date(from: OffsetDateTime, year: i32, month: Month, day: u8) -> OffsetDateTime {
    let day = day.min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => from.replace_date(date),
        // Unreachable with a clamped day; fall back to a flat interval.
        Err(_) => from + Duration::days(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn now_has_no_subsecond_part() {
        assert_eq!(utc_now().nanosecond(), 0);
    }

    #[test]
    fn month_rollover_clamps_day() {
        let jan31 = datetime!(2026-01-31 12:00:00 UTC);
        assert_eq!(plus_one_month(jan31), datetime!(2026-02-28 12:00:00 UTC));

        let dec15 = datetime!(2026-12-15 00:00:00 UTC);
        assert_eq!(plus_one_month(dec15), datetime!(2027-01-15 00:00:00 UTC));
    }

    #[test]
    fn century_jump_handles_leap_day() {
        let leap = datetime!(2028-02-29 08:00:00 UTC);
        assert_eq!(plus_years(leap, 100), datetime!(2128-02-29 08:00:00 UTC));
        assert_eq!(plus_years(leap, 1), datetime!(2029-02-28 08:00:00 UTC));
    }
}

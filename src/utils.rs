use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::models::DateRange;

/// Market calendar for US equities: weekends plus the regular NYSE holidays.
///
/// Rule based so it works for any historical date without a network call.
/// One-off closures (national mourning, weather) are not modelled; a fetch
/// over such a day simply returns no bar for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketCalendar;

impl MarketCalendar {
    pub fn new() -> Self {
        Self
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    /// Get the next trading day on or after the given date
    pub fn next_trading_day_on_or_after(&self, date: NaiveDate) -> NaiveDate {
        let mut current = date;
        while !self.is_trading_day(current) {
            current += Duration::days(1);
        }
        current
    }

    pub fn has_trading_day(&self, range: DateRange) -> bool {
        !range.is_empty() && self.next_trading_day_on_or_after(range.start) <= range.end
    }

    /// Number of trading days in the half-open span `(after, through]`
    pub fn trading_days_after(&self, after: NaiveDate, through: NaiveDate) -> i64 {
        let mut count = 0;
        let mut current = after + Duration::days(1);
        while current <= through {
            if self.is_trading_day(current) {
                count += 1;
            }
            current += Duration::days(1);
        }
        count
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        let year = date.year();
        // New Year's Day falling on a Saturday is not observed on Dec 31
        let fixed = [
            observed(year, 1, 1).filter(|d| d.year() == year),
            observed(year, 7, 4),
            observed(year, 12, 25),
        ];
        if fixed.iter().flatten().any(|d| *d == date) {
            return true;
        }
        if year >= 2022 && observed(year, 6, 19) == Some(date) {
            return true;
        }

        let floating = [
            if year >= 1998 { nth_weekday(year, 1, Weekday::Mon, 3) } else { None },
            nth_weekday(year, 2, Weekday::Mon, 3),
            easter_sunday(year).map(|easter| easter - Duration::days(2)),
            last_weekday(year, 5, Weekday::Mon),
            nth_weekday(year, 9, Weekday::Mon, 1),
            nth_weekday(year, 11, Weekday::Thu, 4),
        ];
        floating.iter().flatten().any(|d| *d == date)
    }
}

/// Weekend holidays move to the adjacent weekday
fn observed(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    })
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let mut date = NaiveDate::from_ymd_opt(next_year, next_month, 1)? - Duration::days(1);
    while date.weekday() != weekday {
        date -= Duration::days(1);
    }
    Some(date)
}

/// Gregorian Easter Sunday (anonymous computus)
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

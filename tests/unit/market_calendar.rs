//! Trading calendar tests against known NYSE years

use chrono::Datelike;
use pretty_assertions::assert_eq;
use test_log::test;

use crate::common::date;
use stock_ingest::models::DateRange;
use stock_ingest::utils::MarketCalendar;

fn trading_days_in(year: i32) -> usize {
    let calendar = MarketCalendar::new();
    date(year, 1, 1)
        .iter_days()
        .take_while(|d| d.year() == year)
        .filter(|d| calendar.is_trading_day(*d))
        .count()
}

#[test]
fn test_full_year_trading_day_counts() {
    assert_eq!(trading_days_in(2023), 250);
    assert_eq!(trading_days_in(2024), 252);
}

#[test]
fn test_observed_holidays() {
    let calendar = MarketCalendar::new();

    // New Year's Day 2023 fell on a Sunday
    assert!(!calendar.is_trading_day(date(2023, 1, 2)));
    // New Year's Day 2022 fell on a Saturday; Dec 31 2021 stayed open
    assert!(calendar.is_trading_day(date(2021, 12, 31)));
    // Juneteenth 2021 predates the market holiday
    assert!(calendar.is_trading_day(date(2021, 6, 18)));
    assert!(!calendar.is_trading_day(date(2024, 6, 19)));
    // Good Friday
    assert!(!calendar.is_trading_day(date(2024, 3, 29)));
}

#[test]
fn test_staleness_counts_only_trading_days() {
    let calendar = MarketCalendar::new();

    // Friday's close is current through the weekend and Monday
    assert_eq!(calendar.trading_days_after(date(2024, 6, 7), date(2024, 6, 9)), 0);
    assert_eq!(calendar.trading_days_after(date(2024, 6, 7), date(2024, 6, 10)), 1);
    assert_eq!(calendar.trading_days_after(date(2024, 6, 7), date(2024, 6, 11)), 2);

    assert!(calendar.has_trading_day(DateRange::new(date(2024, 12, 24), date(2024, 12, 29))));
    assert!(!calendar.has_trading_day(DateRange::new(date(2024, 12, 28), date(2024, 12, 29))));
}

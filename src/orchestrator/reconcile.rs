//! Validation of fetched rows before they are allowed near the store

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{DateRange, PriceRow};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntegrityError {
    #[error("row for {found} returned while fetching {expected}")]
    WrongTicker { expected: String, found: String },

    #[error("duplicate trade date {0}")]
    DuplicateDate(NaiveDate),

    #[error("trade dates not increasing: {previous} followed by {date}")]
    NonMonotonic { previous: NaiveDate, date: NaiveDate },

    #[error("row dated {date} outside requested window {window}")]
    OutsideWindow { date: NaiveDate, window: DateRange },

    #[error("non-finite or non-positive {field} on {date}")]
    BadPrice { date: NaiveDate, field: &'static str },

    #[error("high {high} below low {low} on {date}")]
    InconsistentRange { date: NaiveDate, high: f64, low: f64 },

    #[error("negative volume {volume} on {date}")]
    NegativeVolume { date: NaiveDate, volume: i64 },
}

/// Check a fetched batch as a whole; one bad row rejects the batch
pub fn validate_rows(ticker: &str, window: DateRange, rows: &[PriceRow]) -> Result<(), IntegrityError> {
    let mut previous: Option<NaiveDate> = None;

    for row in rows {
        if row.ticker != ticker {
            return Err(IntegrityError::WrongTicker {
                expected: ticker.to_string(),
                found: row.ticker.clone(),
            });
        }

        let date = row.trade_date;
        if let Some(previous) = previous {
            if date == previous {
                return Err(IntegrityError::DuplicateDate(date));
            }
            if date < previous {
                return Err(IntegrityError::NonMonotonic { previous, date });
            }
        }
        previous = Some(date);

        if !window.contains(date) {
            return Err(IntegrityError::OutsideWindow { date, window });
        }

        for (field, value) in [
            ("open", row.open),
            ("high", row.high),
            ("low", row.low),
            ("close", row.close),
            ("adjusted_close", row.adjusted_close),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(IntegrityError::BadPrice { date, field });
            }
        }

        if row.high < row.low {
            return Err(IntegrityError::InconsistentRange {
                date,
                high: row.high,
                low: row.low,
            });
        }

        if row.volume < 0 {
            return Err(IntegrityError::NegativeVolume {
                date,
                volume: row.volume,
            });
        }
    }

    Ok(())
}

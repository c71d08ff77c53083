use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Database, StoreError};
use crate::models::{DateRange, FundamentalsRecord, PriceRow};

fn fundamentals_from_row(row: &SqliteRow) -> Result<FundamentalsRecord, sqlx::Error> {
    Ok(FundamentalsRecord {
        ticker: row.try_get("ticker")?,
        as_of_date: row.try_get("as_of_date")?,
        sector: row.try_get("sector")?,
        industry: row.try_get("industry")?,
        market_cap: row.try_get("market_cap")?,
        trailing_pe: row.try_get("trailing_pe")?,
        forward_pe: row.try_get("forward_pe")?,
        dividend_yield: row.try_get("dividend_yield")?,
        beta: row.try_get("beta")?,
    })
}

impl Database {
    /// Stored price rows for one ticker, or for all tickers when `None`
    pub async fn count_price_rows(&self, ticker: Option<&str>) -> Result<i64, StoreError> {
        let count = match ticker {
            Some(ticker) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM daily_prices WHERE ticker = ?")
                    .bind(ticker)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM daily_prices")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    /// First and last stored trade dates for a ticker
    pub async fn price_date_bounds(&self, ticker: &str) -> Result<Option<(NaiveDate, NaiveDate)>, StoreError> {
        let row = sqlx::query(
            "SELECT MIN(trade_date) AS first_date, MAX(trade_date) AS last_date FROM daily_prices WHERE ticker = ?",
        )
        .bind(ticker)
        .fetch_one(&self.pool)
        .await?;

        let first: Option<NaiveDate> = row.try_get("first_date")?;
        let last: Option<NaiveDate> = row.try_get("last_date")?;
        Ok(first.zip(last))
    }

    pub async fn get_prices(&self, ticker: &str, range: DateRange) -> Result<Vec<PriceRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ticker, trade_date, open, high, low, close, volume, adj_close
            FROM daily_prices
            WHERE ticker = ? AND trade_date >= ? AND trade_date <= ?
            ORDER BY trade_date
            "#,
        )
        .bind(ticker)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;

        let prices = rows
            .iter()
            .map(|row| -> Result<PriceRow, sqlx::Error> {
                Ok(PriceRow {
                    ticker: row.try_get("ticker")?,
                    trade_date: row.try_get("trade_date")?,
                    open: row.try_get("open")?,
                    high: row.try_get("high")?,
                    low: row.try_get("low")?,
                    close: row.try_get("close")?,
                    volume: row.try_get("volume")?,
                    adjusted_close: row.try_get("adj_close")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(prices)
    }

    /// The snapshot flagged current for a ticker, if any
    pub async fn current_fundamentals(&self, ticker: &str) -> Result<Option<FundamentalsRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM fundamentals WHERE ticker = ? AND is_current = 1")
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(fundamentals_from_row).transpose()?)
    }

    pub async fn count_fundamentals(&self, ticker: &str) -> Result<(i64, i64), StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(is_current), 0) AS current_count FROM fundamentals WHERE ticker = ?",
        )
        .bind(ticker)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("total")?, row.try_get("current_count")?))
    }
}

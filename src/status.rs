//! Read-only reporting over the progress store

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

use crate::database::{Database, ProgressStore, StoreError};
use crate::models::{
    ErrorKind, FundamentalsRecord, ProgressRecord, RunRecord, StateCounts, StateKind,
};
use crate::utils::MarketCalendar;

/// Aggregate view of the whole pipeline
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub as_of: NaiveDate,
    pub counts: StateCounts,
    pub total_tickers: i64,
    pub active_tickers: i64,
    pub price_rows: i64,
    pub failed_by_kind: Vec<(ErrorKind, i64)>,
    /// Most recently attempted failures first
    pub recent_failures: Vec<ProgressRecord>,
    /// `complete` tickers whose coverage lags the last trading day
    pub stale_complete: usize,
    pub last_run: Option<RunRecord>,
}

impl StatusReport {
    pub async fn collect(
        db: &Database,
        as_of: NaiveDate,
        error_samples: usize,
    ) -> Result<Self, StoreError> {
        let calendar = MarketCalendar::new();
        let counts = db.aggregate_counts().await?;
        let (total_tickers, active_tickers) = db.ticker_counts().await?;

        let stale_complete = db
            .list_by_state(StateKind::Complete)
            .await?
            .iter()
            .filter(|record| !record.is_current(as_of, &calendar))
            .count();

        Ok(Self {
            as_of,
            counts,
            total_tickers,
            active_tickers,
            price_rows: db.count_price_rows(None).await?,
            failed_by_kind: db.failed_counts_by_kind().await?,
            recent_failures: db.recent_failures(error_samples as i64).await?,
            stale_complete,
            last_run: db.latest_run().await?,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📊 Download status as of {}", self.as_of)?;
        writeln!(
            f,
            "   Tickers: {} known, {} active",
            self.total_tickers, self.active_tickers
        )?;
        writeln!(f, "   Price rows: {}", self.price_rows)?;
        writeln!(f, "   Progress records: {}", self.counts.total())?;
        for (kind, count) in self.counts.iter() {
            writeln!(f, "     {:<12} {}", kind, count)?;
        }
        if self.stale_complete > 0 {
            writeln!(
                f,
                "   ⏳ {} complete tickers need an incremental update",
                self.stale_complete
            )?;
        }

        if !self.failed_by_kind.is_empty() {
            writeln!(f, "   Failures by kind:")?;
            for (kind, count) in &self.failed_by_kind {
                writeln!(f, "     {:<14} {}", kind, count)?;
            }
        }

        if !self.recent_failures.is_empty() {
            writeln!(f, "   Recent failures:")?;
            for record in &self.recent_failures {
                let (kind, message) = record
                    .last_error()
                    .map(|info| (info.kind.as_str(), info.message.as_str()))
                    .unwrap_or(("unknown", ""));
                writeln!(
                    f,
                    "     ❌ {:<6} [{}] attempts={} {}",
                    record.ticker, kind, record.attempt_count, message
                )?;
            }
        }

        match &self.last_run {
            Some(run) => write!(
                f,
                "   Last run: {} {} started {} → {} ({} fetched, {} failed, {} rows)",
                run.mode,
                run.run_id,
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.status,
                run.fetched,
                run.failed,
                run.rows_written
            ),
            None => write!(f, "   Last run: none"),
        }
    }
}

/// Everything known about one ticker
#[derive(Debug, Clone, Serialize)]
pub struct TickerDetail {
    pub record: ProgressRecord,
    pub active: Option<bool>,
    pub row_count: i64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub fundamentals: Option<FundamentalsRecord>,
}

impl TickerDetail {
    /// `None` when the ticker has no progress record
    pub async fn collect(db: &Database, ticker: &str) -> Result<Option<Self>, StoreError> {
        let ticker = ticker.trim().to_uppercase();
        let Some(record) = db.get(&ticker).await? else {
            return Ok(None);
        };

        let bounds = db.price_date_bounds(&ticker).await?;
        Ok(Some(Self {
            active: db.get_ticker(&ticker).await?.map(|t| t.active),
            row_count: db.count_price_rows(Some(&ticker)).await?,
            first_date: bounds.map(|(first, _)| first),
            last_date: bounds.map(|(_, last)| last),
            fundamentals: db.current_fundamentals(&ticker).await?,
            record,
        }))
    }
}

fn or_dash<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

impl fmt::Display for TickerDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = &self.record;
        writeln!(f, "📈 {}", record.ticker)?;
        writeln!(
            f,
            "   Registry: {}",
            match self.active {
                Some(true) => "active",
                Some(false) => "inactive",
                None => "unknown",
            }
        )?;
        writeln!(f, "   State: {}", record.kind())?;
        writeln!(f, "   Covered range: {}", or_dash(record.covered_range))?;
        writeln!(
            f,
            "   Attempts: {} ({} in current retry window)",
            record.attempt_count,
            record.attempts_in_window()
        )?;
        if let Some(info) = record.last_error() {
            writeln!(f, "   Last error: [{}] {}", info.kind, info.message)?;
        }
        writeln!(
            f,
            "   Last attempted: {}",
            or_dash(record.last_attempted_at.map(|t| t.format("%Y-%m-%d %H:%M:%S")))
        )?;
        writeln!(
            f,
            "   Stored rows: {} ({} to {})",
            self.row_count,
            or_dash(self.first_date),
            or_dash(self.last_date)
        )?;

        match &self.fundamentals {
            Some(snapshot) => write!(
                f,
                "   Fundamentals ({}): sector {}, market cap {}, P/E {}",
                snapshot.as_of_date,
                snapshot.sector.as_deref().unwrap_or("-"),
                or_dash(snapshot.market_cap),
                or_dash(snapshot.trailing_pe)
            ),
            None => write!(f, "   Fundamentals: none"),
        }
    }
}

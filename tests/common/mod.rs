//! Common test utilities and helpers

pub mod database;
pub mod fetcher;

pub use database::{FailingCommitStore, TestDatabase};
pub use fetcher::{Script, ScriptedFetcher};

use chrono::NaiveDate;
use std::time::Duration;

use stock_ingest::models::BackoffKind;
use stock_ingest::orchestrator::{OrchestratorSettings, RetryPolicy};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Settings for fast, deterministic runs: no pacing, one worker
pub fn test_settings(backfill_start: NaiveDate) -> OrchestratorSettings {
    OrchestratorSettings {
        backfill_start,
        fetch_timeout: Duration::from_millis(200),
        pacing: Duration::ZERO,
        max_workers: 1,
        retry: RetryPolicy {
            backoff: BackoffKind::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_in_run_attempts: 2,
        },
        max_attempts: 3,
        fundamentals_max_age_days: 7,
    }
}

/// Test data utilities
pub mod test_data {
    use chrono::NaiveDate;
    use stock_ingest::models::{DateRange, FundamentalsRecord, PriceRow};
    use stock_ingest::utils::MarketCalendar;

    pub fn price_row(ticker: &str, trade_date: NaiveDate, close: f64) -> PriceRow {
        PriceRow {
            ticker: ticker.to_string(),
            trade_date,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000_000,
            adjusted_close: close,
        }
    }

    /// One row per trading day in `window`
    pub fn trading_day_rows(ticker: &str, window: DateRange) -> Vec<PriceRow> {
        let calendar = MarketCalendar::new();
        window
            .start
            .iter_days()
            .take_while(|d| *d <= window.end)
            .filter(|d| calendar.is_trading_day(*d))
            .enumerate()
            .map(|(i, d)| price_row(ticker, d, 100.0 + i as f64 * 0.1))
            .collect()
    }

    pub fn fundamentals(ticker: &str, as_of_date: NaiveDate) -> FundamentalsRecord {
        FundamentalsRecord {
            sector: Some("Technology".to_string()),
            industry: Some("Consumer Electronics".to_string()),
            market_cap: Some(3.0e12),
            trailing_pe: Some(29.5),
            forward_pe: Some(27.1),
            dividend_yield: Some(0.005),
            beta: Some(1.2),
            ..FundamentalsRecord::empty(ticker, as_of_date)
        }
    }
}

/// Logging utilities for tests
pub mod logging {
    use std::sync::Once;
    use tracing::info;

    static INIT: Once = Once::new();

    pub fn init_test_logging() {
        INIT.call_once(|| {
            let _ = tracing::subscriber::set_global_default(
                tracing_subscriber::fmt()
                    .with_env_filter("stock_ingest=debug,main=debug")
                    .with_test_writer()
                    .finish(),
            );
        });
    }

    pub fn log_test_step(step: &str) {
        info!("🧪 Test Step: {}", step);
    }
}

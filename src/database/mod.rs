use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{
    FundamentalsRecord, PriceRow, ProgressRecord, RunRecord, StateCounts, StateKind, Ticker,
};

mod prices;
mod progress;
mod runs;
mod tickers;

pub use tickers::SyncPlan;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn corrupt(key: &str, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// What crash recovery found and repaired at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset_in_progress: u64,
    pub interrupted_runs: u64,
}

/// Persistent per-ticker progress plus the atomic data commits that advance it
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, ticker: &str) -> Result<Option<ProgressRecord>, StoreError>;

    async fn upsert(&self, record: &ProgressRecord) -> Result<(), StoreError>;

    async fn list_by_state(&self, state: StateKind) -> Result<Vec<ProgressRecord>, StoreError>;

    async fn list_all(&self) -> Result<Vec<ProgressRecord>, StoreError>;

    async fn aggregate_counts(&self) -> Result<StateCounts, StoreError>;

    /// Reset leftover `in_progress` rows to `pending` and close dangling runs
    async fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError>;

    /// Upsert `rows` and `record` in one transaction; returns rows written
    async fn commit_prices(&self, record: &ProgressRecord, rows: &[PriceRow]) -> Result<u64, StoreError>;

    /// Store `snapshot` as the current one and `record` in one transaction
    async fn commit_fundamentals(
        &self,
        record: &ProgressRecord,
        snapshot: &FundamentalsRecord,
    ) -> Result<(), StoreError>;

    async fn begin_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError>;
}

/// Read access to the authoritative ticker universe
#[async_trait]
pub trait TickerRegistry: Send + Sync {
    async fn list_active_tickers(&self) -> Result<Vec<Ticker>, StoreError>;
}

/// SQLite-backed store for tickers, prices, fundamentals and progress
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `database_path` and ensure the schema
    pub async fn new(database_path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        debug!("Connecting to database: {}", database_path);

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        info!("📊 Database ready at {}", database_path);

        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tickers (
                ticker TEXT PRIMARY KEY,
                name TEXT,
                exchange TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                first_seen_at DATETIME NOT NULL,
                last_seen_at DATETIME NOT NULL,
                delisted_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_prices (
                ticker TEXT NOT NULL,
                trade_date DATE NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                adj_close REAL NOT NULL,
                PRIMARY KEY (ticker, trade_date)
            ) WITHOUT ROWID
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fundamentals (
                ticker TEXT NOT NULL,
                as_of_date DATE NOT NULL,
                sector TEXT,
                industry TEXT,
                market_cap REAL,
                trailing_pe REAL,
                forward_pe REAL,
                dividend_yield REAL,
                beta REAL,
                is_current INTEGER NOT NULL DEFAULT 0,
                fetched_at DATETIME NOT NULL,
                PRIMARY KEY (ticker, as_of_date)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS download_progress (
                ticker TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'pending'
                    CHECK (state IN ('pending', 'in_progress', 'complete', 'failed')),
                covered_start DATE,
                covered_end DATE,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                retry_window_base INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                error_message TEXT,
                last_attempted_at DATETIME,
                fundamentals_fetched_at DATETIME,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS download_runs (
                run_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                finished_at DATETIME,
                fetched INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                empty INTEGER NOT NULL DEFAULT 0,
                rows_written INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_daily_prices_date ON daily_prices(trade_date)",
            "CREATE INDEX IF NOT EXISTS idx_download_progress_state ON download_progress(state)",
            "CREATE INDEX IF NOT EXISTS idx_fundamentals_current ON fundamentals(ticker, is_current)",
            "CREATE INDEX IF NOT EXISTS idx_tickers_active ON tickers(active)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        debug!("Database schema verified");
        Ok(())
    }
}

//! Per-test SQLite databases and a store wrapper that fails on demand

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use stock_ingest::database::{Database, ProgressStore, RecoveryReport, StoreError};
use stock_ingest::models::{
    FundamentalsRecord, PriceRow, ProgressRecord, RunRecord, StateCounts, StateKind, Ticker,
};

/// A fresh database in its own temp directory, removed on drop
pub struct TestDatabase {
    _dir: TempDir,
    pub db: Arc<Database>,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("stock_ingest_test.db");
        let db = Database::new(path.to_str().expect("temp path is utf-8"))
            .await
            .expect("Failed to create test database");
        Self {
            _dir: dir,
            db: Arc::new(db),
        }
    }

    /// Database with `symbols` registered as active NASDAQ tickers
    pub async fn with_tickers(symbols: &[&str]) -> Self {
        let test_db = Self::new().await;
        for symbol in symbols {
            test_db
                .db
                .upsert_ticker(&Ticker::new(symbol, "NASDAQ"))
                .await
                .expect("Failed to insert ticker");
        }
        test_db
    }

    pub async fn record(&self, ticker: &str) -> ProgressRecord {
        self.db
            .get(ticker)
            .await
            .expect("Failed to read progress")
            .unwrap_or_else(|| panic!("no progress record for {}", ticker))
    }
}

/// Delegates to a real database but fails `commit_prices` for one ticker,
/// standing in for a crash between fetch and commit
pub struct FailingCommitStore {
    inner: Arc<Database>,
    fail_ticker: String,
}

impl FailingCommitStore {
    pub fn new(inner: Arc<Database>, fail_ticker: &str) -> Self {
        Self {
            inner,
            fail_ticker: fail_ticker.to_string(),
        }
    }
}

#[async_trait]
impl ProgressStore for FailingCommitStore {
    async fn get(&self, ticker: &str) -> Result<Option<ProgressRecord>, StoreError> {
        self.inner.get(ticker).await
    }

    async fn upsert(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        self.inner.upsert(record).await
    }

    async fn list_by_state(&self, state: StateKind) -> Result<Vec<ProgressRecord>, StoreError> {
        self.inner.list_by_state(state).await
    }

    async fn list_all(&self) -> Result<Vec<ProgressRecord>, StoreError> {
        self.inner.list_all().await
    }

    async fn aggregate_counts(&self) -> Result<StateCounts, StoreError> {
        self.inner.aggregate_counts().await
    }

    async fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError> {
        self.inner.recover_interrupted().await
    }

    async fn commit_prices(&self, record: &ProgressRecord, rows: &[PriceRow]) -> Result<u64, StoreError> {
        if record.ticker == self.fail_ticker {
            return Err(StoreError::Sqlx(sqlx::Error::PoolClosed));
        }
        self.inner.commit_prices(record, rows).await
    }

    async fn commit_fundamentals(
        &self,
        record: &ProgressRecord,
        snapshot: &FundamentalsRecord,
    ) -> Result<(), StoreError> {
        self.inner.commit_fundamentals(record, snapshot).await
    }

    async fn begin_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.inner.begin_run(run).await
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.inner.finish_run(run).await
    }
}

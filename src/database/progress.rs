use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use tracing::{debug, warn};

use super::{Database, ProgressStore, RecoveryReport, StoreError};
use crate::models::{
    CoveredRange, DownloadState, ErrorKind, FailureInfo, FundamentalsRecord, PriceRow,
    ProgressRecord, RunRecord, StateCounts, StateKind, TransitionError,
};

const PROGRESS_COLUMNS: &str = "ticker, state, covered_start, covered_end, attempt_count, \
     retry_window_base, error_kind, error_message, last_attempted_at, fundamentals_fetched_at";

fn record_from_row(row: &SqliteRow) -> Result<ProgressRecord, StoreError> {
    let ticker: String = row.try_get("ticker")?;
    let corrupt = |reason: String| StoreError::corrupt(&ticker, reason);

    let kind: StateKind = row
        .try_get::<String, _>("state")?
        .parse()
        .map_err(|e: TransitionError| corrupt(e.to_string()))?;

    let state = match kind {
        StateKind::Pending => DownloadState::Pending,
        StateKind::InProgress => DownloadState::InProgress,
        StateKind::Complete => DownloadState::Complete,
        StateKind::Failed => {
            let error_kind: ErrorKind = row
                .try_get::<Option<String>, _>("error_kind")?
                .ok_or_else(|| corrupt(TransitionError::MissingFailure(ticker.clone()).to_string()))?
                .parse()
                .map_err(|e: TransitionError| corrupt(e.to_string()))?;
            let message: Option<String> = row.try_get("error_message")?;
            DownloadState::Failed(FailureInfo::new(error_kind, message.unwrap_or_default()))
        }
    };

    let covered_start: Option<NaiveDate> = row.try_get("covered_start")?;
    let covered_end: Option<NaiveDate> = row.try_get("covered_end")?;
    let covered_range = match (covered_start, covered_end) {
        (Some(start), Some(end)) if start <= end => Some(CoveredRange::new(start, end)),
        (None, None) => None,
        (start, end) => return Err(corrupt(format!("invalid covered range {:?}..{:?}", start, end))),
    };

    let attempt_count = u32::try_from(row.try_get::<i64, _>("attempt_count")?)
        .map_err(|e| corrupt(e.to_string()))?;
    let retry_window_base = u32::try_from(row.try_get::<i64, _>("retry_window_base")?)
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(ProgressRecord {
        ticker: ticker.clone(),
        state,
        covered_range,
        attempt_count,
        retry_window_base,
        last_attempted_at: row.try_get("last_attempted_at")?,
        fundamentals_fetched_at: row.try_get("fundamentals_fetched_at")?,
    })
}

/// Upsert one progress row through any executor (pool or open transaction)
pub(super) async fn write_progress<'e, E>(executor: E, record: &ProgressRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let failure = record.last_error();

    sqlx::query(
        r#"
        INSERT INTO download_progress (
            ticker, state, covered_start, covered_end, attempt_count, retry_window_base,
            error_kind, error_message, last_attempted_at, fundamentals_fetched_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ticker) DO UPDATE SET
            state = excluded.state,
            covered_start = excluded.covered_start,
            covered_end = excluded.covered_end,
            attempt_count = excluded.attempt_count,
            retry_window_base = excluded.retry_window_base,
            error_kind = excluded.error_kind,
            error_message = excluded.error_message,
            last_attempted_at = excluded.last_attempted_at,
            fundamentals_fetched_at = excluded.fundamentals_fetched_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.ticker)
    .bind(record.kind().as_str())
    .bind(record.covered_range.map(|c| c.earliest))
    .bind(record.covered_range.map(|c| c.latest))
    .bind(i64::from(record.attempt_count))
    .bind(i64::from(record.retry_window_base))
    .bind(failure.map(|f| f.kind.as_str()))
    .bind(failure.map(|f| f.message.as_str()))
    .bind(record.last_attempted_at)
    .bind(record.fundamentals_fetched_at)
    .bind(Utc::now())
    .execute(executor)
    .await?;

    Ok(())
}

impl Database {
    async fn query_progress(&self, filter: &str, bind: Option<&str>) -> Result<Vec<ProgressRecord>, StoreError> {
        let sql = format!("SELECT {} FROM download_progress {} ORDER BY ticker", PROGRESS_COLUMNS, filter);
        let mut query = sqlx::query(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Number of failed tickers per error kind
    pub async fn failed_counts_by_kind(&self) -> Result<Vec<(ErrorKind, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT error_kind, COUNT(*) AS count
            FROM download_progress
            WHERE state = 'failed'
            GROUP BY error_kind
            ORDER BY count DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(ErrorKind, i64), StoreError> {
                let kind: Option<String> = row.try_get("error_kind")?;
                let kind = kind
                    .unwrap_or_default()
                    .parse::<ErrorKind>()
                    .map_err(|e| StoreError::corrupt("download_progress", e))?;
                Ok((kind, row.try_get::<i64, _>("count")?))
            })
            .collect()
    }

    /// Most recently attempted failures first
    pub async fn recent_failures(&self, limit: i64) -> Result<Vec<ProgressRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM download_progress WHERE state = 'failed' \
             ORDER BY last_attempted_at DESC, ticker LIMIT ?",
            PROGRESS_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl ProgressStore for Database {
    async fn get(&self, ticker: &str) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self
            .query_progress("WHERE ticker = ?", Some(ticker))
            .await?
            .into_iter()
            .next())
    }

    async fn upsert(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        write_progress(&self.pool, record).await?;
        Ok(())
    }

    async fn list_by_state(&self, state: StateKind) -> Result<Vec<ProgressRecord>, StoreError> {
        self.query_progress("WHERE state = ?", Some(state.as_str())).await
    }

    async fn list_all(&self) -> Result<Vec<ProgressRecord>, StoreError> {
        self.query_progress("", None).await
    }

    async fn aggregate_counts(&self) -> Result<StateCounts, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM download_progress GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let kind: StateKind = state
                .parse()
                .map_err(|e| StoreError::corrupt("download_progress", e))?;
            counts.add(kind, row.try_get("count")?);
        }
        Ok(counts)
    }

    async fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Same effect as the Recover transition, applied in bulk
        let progress = sqlx::query(
            "UPDATE download_progress SET state = 'pending', updated_at = ? WHERE state = 'in_progress'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let runs = sqlx::query(
            "UPDATE download_runs SET status = 'interrupted', finished_at = ? WHERE status = 'running'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let report = RecoveryReport {
            reset_in_progress: progress.rows_affected(),
            interrupted_runs: runs.rows_affected(),
        };
        if report.reset_in_progress > 0 || report.interrupted_runs > 0 {
            warn!(
                "🔄 Recovered from interrupted run: {} ticker(s) reset to pending, {} run(s) marked interrupted",
                report.reset_in_progress, report.interrupted_runs
            );
        }
        Ok(report)
    }

    async fn commit_prices(&self, record: &ProgressRecord, rows: &[PriceRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO daily_prices (ticker, trade_date, open, high, low, close, volume, adj_close)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(ticker, trade_date) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    adj_close = excluded.adj_close
                "#,
            )
            .bind(&row.ticker)
            .bind(row.trade_date)
            .bind(row.open)
            .bind(row.high)
            .bind(row.low)
            .bind(row.close)
            .bind(row.volume)
            .bind(row.adjusted_close)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        write_progress(&mut *tx, record).await?;
        tx.commit().await?;

        debug!("Committed {} price rows and progress for {}", written, record.ticker);
        Ok(written)
    }

    async fn commit_fundamentals(
        &self,
        record: &ProgressRecord,
        snapshot: &FundamentalsRecord,
    ) -> Result<(), StoreError> {
        let fetched_at: DateTime<Utc> = record.fundamentals_fetched_at.unwrap_or_else(Utc::now);
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE fundamentals SET is_current = 0 WHERE ticker = ? AND as_of_date != ?")
            .bind(&snapshot.ticker)
            .bind(snapshot.as_of_date)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO fundamentals (
                ticker, as_of_date, sector, industry, market_cap, trailing_pe,
                forward_pe, dividend_yield, beta, is_current, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(ticker, as_of_date) DO UPDATE SET
                sector = excluded.sector,
                industry = excluded.industry,
                market_cap = excluded.market_cap,
                trailing_pe = excluded.trailing_pe,
                forward_pe = excluded.forward_pe,
                dividend_yield = excluded.dividend_yield,
                beta = excluded.beta,
                is_current = 1,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&snapshot.ticker)
        .bind(snapshot.as_of_date)
        .bind(&snapshot.sector)
        .bind(&snapshot.industry)
        .bind(snapshot.market_cap)
        .bind(snapshot.trailing_pe)
        .bind(snapshot.forward_pe)
        .bind(snapshot.dividend_yield)
        .bind(snapshot.beta)
        .bind(fetched_at)
        .execute(&mut *tx)
        .await?;

        write_progress(&mut *tx, record).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn begin_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.insert_run(run).await
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.update_run(run).await
    }
}

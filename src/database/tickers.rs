use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::progress::write_progress;
use super::{Database, StoreError, TickerRegistry};
use crate::models::{ProgressRecord, Ticker};

/// Changes computed by a registry sync, applied in one transaction
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Tickers never seen before; each gets a `pending` progress row
    pub inserts: Vec<Ticker>,
    /// Inactive tickers that reappeared in the listing; metadata recorded on
    /// first sight is never rewritten
    pub updates: Vec<Ticker>,
    /// Listed tickers with nothing to change except `last_seen_at`
    pub unchanged: Vec<String>,
    /// Active tickers absent from the listing
    pub deactivations: Vec<String>,
    /// Progress of deactivated tickers after the registry-removal reset
    pub progress_resets: Vec<ProgressRecord>,
}

fn ticker_from_row(row: &SqliteRow) -> Result<Ticker, sqlx::Error> {
    Ok(Ticker {
        symbol: row.try_get("ticker")?,
        name: row.try_get("name")?,
        exchange: row.try_get("exchange")?,
        active: row.try_get::<i64, _>("active")? != 0,
    })
}

impl Database {
    /// Every ticker ever recorded, active or not
    pub async fn list_tickers(&self) -> Result<Vec<Ticker>, StoreError> {
        let rows = sqlx::query("SELECT ticker, name, exchange, active FROM tickers ORDER BY ticker")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(ticker_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>, StoreError> {
        let row = sqlx::query("SELECT ticker, name, exchange, active FROM tickers WHERE ticker = ?")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(ticker_from_row).transpose()?)
    }

    /// (total, active) ticker counts
    pub async fn ticker_counts(&self) -> Result<(i64, i64), StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(active), 0) AS active FROM tickers",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("total")?, row.try_get("active")?))
    }

    /// Insert a single ticker, creating its progress row when missing. A known
    /// ticker only has its active flag and `last_seen_at` refreshed.
    pub async fn upsert_ticker(&self, ticker: &Ticker) -> Result<(), StoreError> {
        let plan = SyncPlan {
            inserts: vec![ticker.clone()],
            ..SyncPlan::default()
        };
        self.apply_sync_plan(&plan, Utc::now()).await
    }

    pub async fn apply_sync_plan(&self, plan: &SyncPlan, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for ticker in &plan.inserts {
            sqlx::query(
                r#"
                INSERT INTO tickers (ticker, name, exchange, active, first_seen_at, last_seen_at, delisted_at)
                VALUES (?, ?, ?, ?, ?, ?, NULL)
                ON CONFLICT(ticker) DO UPDATE SET
                    active = excluded.active,
                    last_seen_at = excluded.last_seen_at
                "#,
            )
            .bind(&ticker.symbol)
            .bind(&ticker.name)
            .bind(&ticker.exchange)
            .bind(ticker.active)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO download_progress (ticker, state, updated_at)
                VALUES (?, 'pending', ?)
                ON CONFLICT(ticker) DO NOTHING
                "#,
            )
            .bind(&ticker.symbol)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for ticker in &plan.updates {
            sqlx::query(
                r#"
                UPDATE tickers
                SET active = 1, delisted_at = NULL, last_seen_at = ?
                WHERE ticker = ?
                "#,
            )
            .bind(now)
            .bind(&ticker.symbol)
            .execute(&mut *tx)
            .await?;
        }

        for symbol in &plan.unchanged {
            sqlx::query("UPDATE tickers SET last_seen_at = ? WHERE ticker = ?")
                .bind(now)
                .bind(symbol)
                .execute(&mut *tx)
                .await?;
        }

        for symbol in &plan.deactivations {
            sqlx::query("UPDATE tickers SET active = 0, delisted_at = ? WHERE ticker = ?")
                .bind(now)
                .bind(symbol)
                .execute(&mut *tx)
                .await?;
        }

        for record in &plan.progress_resets {
            write_progress(&mut *tx, record).await?;
        }

        tx.commit().await?;
        debug!(
            "Applied sync plan: {} new, {} updated, {} deactivated",
            plan.inserts.len(),
            plan.updates.len(),
            plan.deactivations.len()
        );
        Ok(())
    }
}

#[async_trait]
impl TickerRegistry for Database {
    async fn list_active_tickers(&self) -> Result<Vec<Ticker>, StoreError> {
        let rows = sqlx::query(
            "SELECT ticker, name, exchange, active FROM tickers WHERE active = 1 ORDER BY ticker",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(ticker_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Database, StoreError};
use crate::models::{RunRecord, RunStatus};

fn run_from_row(row: &SqliteRow) -> Result<RunRecord, StoreError> {
    let run_id: String = row.try_get("run_id")?;
    let status: RunStatus = row
        .try_get::<String, _>("status")?
        .parse()
        .map_err(|e: anyhow::Error| StoreError::corrupt(&run_id, e))?;

    Ok(RunRecord {
        run_id,
        mode: row.try_get("mode")?,
        status,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        fetched: row.try_get("fetched")?,
        skipped: row.try_get("skipped")?,
        failed: row.try_get("failed")?,
        empty: row.try_get("empty")?,
        rows_written: row.try_get("rows_written")?,
    })
}

impl Database {
    pub(super) async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO download_runs (
                run_id, mode, status, started_at, finished_at,
                fetched, skipped, failed, empty, rows_written
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.mode)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.fetched)
        .bind(run.skipped)
        .bind(run.failed)
        .bind(run.empty)
        .bind(run.rows_written)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(super) async fn update_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE download_runs
            SET status = ?, finished_at = ?, fetched = ?, skipped = ?, failed = ?,
                empty = ?, rows_written = ?
            WHERE run_id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(run.fetched)
        .bind(run.skipped)
        .bind(run.failed)
        .bind(run.empty)
        .bind(run.rows_written)
        .bind(&run.run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM download_runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    pub async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM download_runs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }
}

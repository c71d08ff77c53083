//! End-to-end runs against a real SQLite store and a scripted fetcher

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use test_log::test;

use crate::common::{
    date, logging, test_data, test_settings, FailingCommitStore, Script, ScriptedFetcher,
    TestDatabase,
};
use stock_ingest::api::FetchError;
use stock_ingest::database::ProgressStore;
use stock_ingest::models::{CoveredRange, DateRange, DownloadState, ErrorKind, ProgressRecord, RunRecord, RunStatus, StateKind};
use stock_ingest::orchestrator::{
    NoDelay, Orchestrator, OrchestratorError, OutcomeKind, RunMode, RunRequest,
};
use stock_ingest::status::StatusReport;

fn orchestrator(fetcher: &Arc<ScriptedFetcher>, test_db: &TestDatabase) -> Orchestrator {
    Orchestrator::new(
        fetcher.clone(),
        test_db.db.clone(),
        test_db.db.clone(),
        test_settings(date(2020, 1, 1)),
    )
    .with_delay_policy(Arc::new(NoDelay))
}

#[test(tokio::test)]
async fn test_aapl_backfill_then_incremental_update() {
    logging::log_test_step("AAPL backfill then incremental update");
    let test_db = TestDatabase::with_tickers(&["AAPL"]).await;

    let fetcher = Arc::new(ScriptedFetcher::new());
    let summary = orchestrator(&fetcher, &test_db)
        .run(RunRequest::new(RunMode::FullBackfill, date(2024, 1, 1)))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.fetched, 1);
    assert_eq!(
        fetcher.windows_for("AAPL"),
        vec![DateRange::new(date(2020, 1, 1), date(2024, 1, 1))]
    );

    let record = test_db.record("AAPL").await;
    assert_eq!(record.kind(), StateKind::Complete);
    assert_eq!(
        record.covered_range,
        Some(CoveredRange::new(date(2020, 1, 1), date(2024, 1, 1)))
    );
    assert_eq!(record.attempt_count, 0);
    assert_eq!(
        test_db.db.count_price_rows(Some("AAPL")).await.unwrap(),
        summary.rows_written as i64
    );

    let new_rows = vec![
        test_data::price_row("AAPL", date(2024, 1, 2), 185.6),
        test_data::price_row("AAPL", date(2024, 1, 3), 184.2),
        test_data::price_row("AAPL", date(2024, 1, 4), 181.9),
    ];
    let fetcher = Arc::new(ScriptedFetcher::new().queue("AAPL", vec![Script::Rows(new_rows)]));
    let summary = orchestrator(&fetcher, &test_db)
        .run(RunRequest::new(RunMode::IncrementalUpdate, date(2024, 1, 4)))
        .await
        .unwrap();

    assert_eq!(summary.rows_written, 3);
    assert_eq!(
        fetcher.windows_for("AAPL"),
        vec![DateRange::new(date(2024, 1, 2), date(2024, 1, 4))]
    );
    let record = test_db.record("AAPL").await;
    assert_eq!(record.kind(), StateKind::Complete);
    assert_eq!(record.covered_range.unwrap().latest, date(2024, 1, 4));
    assert_eq!(record.attempt_count, 0);
}

#[test(tokio::test)]
async fn test_xyz_timeouts_accumulate_one_attempt_per_run() {
    logging::log_test_step("XYZ times out on every call");
    let test_db = TestDatabase::with_tickers(&["XYZ"]).await;
    let fetcher = Arc::new(ScriptedFetcher::new().always("XYZ", Script::Hang));
    let orchestrator = orchestrator(&fetcher, &test_db);

    let first = orchestrator
        .run(RunRequest::new(RunMode::FullBackfill, date(2024, 1, 5)))
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::CompletedWithFailures);
    assert_eq!(first.exit_code(), 2);

    for _ in 0..2 {
        let summary = orchestrator
            .run(RunRequest::new(RunMode::RetryFailed, date(2024, 1, 5)))
            .await
            .unwrap();
        assert_eq!(summary.failed_tickers(), vec!["XYZ"]);
    }

    let record = test_db.record("XYZ").await;
    assert_eq!(record.kind(), StateKind::Failed);
    assert_eq!(record.attempt_count, 3);
    assert_matches!(record.last_error(), Some(info) if info.kind == ErrorKind::Transient && info.message.contains("timed out"));
    // Two in-run attempts per run
    assert_eq!(fetcher.price_calls_for("XYZ"), 6);
    assert!(record.covered_range.is_none());
}

#[test(tokio::test)]
async fn test_persistence_failure_aborts_and_keeps_prior_state() {
    logging::log_test_step("Commit failure mid-run");
    let test_db = TestDatabase::with_tickers(&["AAA", "BBB", "CCC"]).await;
    let fetcher = Arc::new(ScriptedFetcher::new());
    let store = Arc::new(FailingCommitStore::new(test_db.db.clone(), "BBB"));

    let orchestrator = Orchestrator::new(
        fetcher.clone(),
        store,
        test_db.db.clone(),
        test_settings(date(2024, 1, 1)),
    )
    .with_delay_policy(Arc::new(NoDelay));

    let result = orchestrator
        .run(RunRequest::new(RunMode::FullBackfill, date(2024, 1, 5)))
        .await;
    assert_matches!(result, Err(OrchestratorError::Store(_)));

    assert_eq!(test_db.record("AAA").await.kind(), StateKind::Complete);
    assert_eq!(test_db.record("BBB").await, ProgressRecord::pending("BBB"));
    assert_eq!(test_db.db.count_price_rows(Some("BBB")).await.unwrap(), 0);
    // The run stops dispatching after the fatal error
    assert_eq!(fetcher.price_calls_for("CCC"), 0);

    let run = test_db.db.latest_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.finished_at.is_some());
}

#[test(tokio::test)]
async fn test_cancelled_run_leaves_candidates_untouched() {
    let test_db = TestDatabase::with_tickers(&["AAA", "BBB"]).await;
    let fetcher = Arc::new(ScriptedFetcher::new());
    let orchestrator = orchestrator(&fetcher, &test_db);

    orchestrator.cancel_handle().store(true, Ordering::SeqCst);
    let summary = orchestrator
        .run(RunRequest::new(RunMode::FullBackfill, date(2024, 1, 5)))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.remaining, 2);
    assert_eq!(fetcher.total_price_calls(), 0);
    assert_eq!(test_db.record("AAA").await.kind(), StateKind::Pending);
}

#[test(tokio::test)]
async fn test_startup_recovers_interrupted_state() {
    let test_db = TestDatabase::with_tickers(&["AAPL"]).await;

    let mut stuck = ProgressRecord::pending("AAPL");
    stuck.state = DownloadState::InProgress;
    test_db.db.upsert(&stuck).await.unwrap();
    let dangling = RunRecord {
        run_id: "crashed-run".to_string(),
        mode: "full_backfill".to_string(),
        status: RunStatus::Running,
        started_at: chrono::Utc::now(),
        finished_at: None,
        fetched: 0,
        skipped: 0,
        failed: 0,
        empty: 0,
        rows_written: 0,
    };
    test_db.db.begin_run(&dangling).await.unwrap();

    let fetcher = Arc::new(ScriptedFetcher::new());
    let summary = orchestrator(&fetcher, &test_db)
        .run(RunRequest::new(RunMode::FullBackfill, date(2024, 1, 5)))
        .await
        .unwrap();

    assert_eq!(summary.fetched, 1);
    assert_eq!(test_db.record("AAPL").await.kind(), StateKind::Complete);
    let crashed = test_db.db.get_run("crashed-run").await.unwrap().unwrap();
    assert_eq!(crashed.status, RunStatus::Interrupted);
    assert_eq!(
        test_db.db.list_by_state(StateKind::InProgress).await.unwrap(),
        Vec::<ProgressRecord>::new()
    );
}

#[test(tokio::test)]
async fn test_concurrent_workers_process_every_ticker_once() {
    let symbols = ["AAA", "BBB", "CCC", "DDD", "EEE", "FFF", "GGG", "HHH"];
    let test_db = TestDatabase::with_tickers(&symbols).await;
    let fetcher = Arc::new(
        ScriptedFetcher::new().always("EEE", Script::Fail(FetchError::RateLimited("HTTP 429".to_string()))),
    );

    let mut settings = test_settings(date(2024, 1, 1));
    settings.max_workers = 4;
    let orchestrator = Orchestrator::new(fetcher.clone(), test_db.db.clone(), test_db.db.clone(), settings)
        .with_delay_policy(Arc::new(NoDelay));

    let summary = orchestrator
        .run(RunRequest::new(RunMode::FullBackfill, date(2024, 1, 31)))
        .await
        .unwrap();

    assert_eq!(summary.fetched, 7);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.outcomes.len(), symbols.len());
    for symbol in symbols.iter().filter(|s| **s != "EEE") {
        assert_eq!(fetcher.price_calls_for(symbol), 1);
    }
    assert_matches!(
        summary.outcome("EEE").map(|o| &o.kind),
        Some(OutcomeKind::Failed(ErrorKind::RateLimited))
    );

    let report = StatusReport::collect(&test_db.db, date(2024, 1, 31), 5).await.unwrap();
    assert_eq!(report.counts.get(StateKind::Complete), 7);
    assert_eq!(report.failed_by_kind, vec![(ErrorKind::RateLimited, 1)]);
    assert_eq!(
        report.last_run.map(|run| run.status),
        Some(RunStatus::CompletedWithFailures)
    );
}

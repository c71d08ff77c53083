//! Download orchestration
//!
//! Walks the candidate tickers of a run with a bounded pool of workers,
//! drives each ticker through the download state machine and commits the
//! fetched rows together with the advanced progress record.

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{DataFetcher, FetchError};
use crate::database::{ProgressStore, StoreError, TickerRegistry};
use crate::models::{Config, ErrorKind, FailureInfo, RunRecord, RunStatus, TransitionError};
use crate::utils::MarketCalendar;

pub mod candidates;
pub mod context;
pub mod mode;
pub mod reconcile;
pub mod retry;
pub mod summary;

use candidates::{select_candidates, Candidate, Selection, SelectionPolicy};
use context::RunContext;
use reconcile::validate_rows;

pub use mode::{RunMode, RunRequest};
pub use retry::{DelayPolicy, NoDelay, Pacer, RecordingDelay, RetryPolicy, TokioDelay};
pub use summary::{OutcomeKind, RunSummary, TickerOutcome};

/// Tickers between two progress log lines
const PROGRESS_LOG_INTERVAL: usize = 25;

/// Run-level failures. Per-ticker fetch failures never end up here; they are
/// recorded on the ticker and the run carries on.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("progress store failure: {0}")]
    Store(#[from] StoreError),

    #[error("ticker registry unavailable: {0}")]
    Registry(#[source] StoreError),

    #[error("illegal state transition for {ticker}: {source}")]
    Transition {
        ticker: String,
        #[source]
        source: TransitionError,
    },

    #[error("invalid run request: {0}")]
    InvalidRequest(String),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn transition_error(ticker: &str) -> impl Fn(TransitionError) -> OrchestratorError + '_ {
    move |source| OrchestratorError::Transition {
        ticker: ticker.to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub backfill_start: NaiveDate,
    pub fetch_timeout: Duration,
    /// Minimum spacing between consecutive fetcher calls
    pub pacing: Duration,
    pub max_workers: usize,
    pub retry: RetryPolicy,
    /// Attempts allowed in an eligibility window before automatic selection stops
    pub max_attempts: u32,
    pub fundamentals_max_age_days: i64,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backfill_start: config.backfill_start,
            fetch_timeout: config.fetch_timeout,
            pacing: config.pacing,
            max_workers: config.max_workers.max(1),
            retry: RetryPolicy::from_config(config),
            max_attempts: config.max_attempts.max(1),
            fundamentals_max_age_days: config.fundamentals_max_age_days,
        }
    }

    fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            backfill_start: self.backfill_start,
            max_attempts: self.max_attempts,
            fundamentals_max_age_days: self.fundamentals_max_age_days,
        }
    }
}

/// The download engine. Cheap to clone; every worker holds its own copy.
#[derive(Clone)]
pub struct Orchestrator {
    fetcher: Arc<dyn DataFetcher>,
    store: Arc<dyn ProgressStore>,
    registry: Arc<dyn TickerRegistry>,
    delay: Arc<dyn DelayPolicy>,
    settings: OrchestratorSettings,
    calendar: MarketCalendar,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn DataFetcher>,
        store: Arc<dyn ProgressStore>,
        registry: Arc<dyn TickerRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            fetcher,
            store,
            registry,
            delay: Arc::new(TokioDelay),
            settings,
            calendar: MarketCalendar::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace how backoff and pacing waits are performed
    pub fn with_delay_policy(mut self, delay: Arc<dyn DelayPolicy>) -> Self {
        self.delay = delay;
        self
    }

    /// Flag checked before each ticker; setting it stops the run between tickers
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn validate(&self, request: &RunRequest) -> Result<(), OrchestratorError> {
        if request.limit == Some(0) {
            return Err(OrchestratorError::InvalidRequest(
                "limit must be at least 1".to_string(),
            ));
        }
        if matches!(&request.tickers, Some(tickers) if tickers.is_empty()) {
            return Err(OrchestratorError::InvalidRequest(
                "ticker filter is empty".to_string(),
            ));
        }
        if request.mode.is_price_mode() && request.as_of < self.settings.backfill_start {
            return Err(OrchestratorError::InvalidRequest(format!(
                "as-of date {} is before the backfill start {}",
                request.as_of, self.settings.backfill_start
            )));
        }
        Ok(())
    }

    /// Execute one run to completion, cancellation or a fatal error.
    ///
    /// Fetch failures are recorded per ticker and reflected in the summary.
    /// Store failures abort the run: the run row is marked `aborted` and the
    /// error is returned. Tickers committed before the failure stay committed.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, OrchestratorError> {
        self.validate(&request)?;
        let started = Instant::now();

        let recovery = self.store.recover_interrupted().await?;
        if recovery.reset_in_progress > 0 || recovery.interrupted_runs > 0 {
            warn!(
                "🔄 Recovered from an interrupted run: {} tickers reset to pending, {} runs marked interrupted",
                recovery.reset_in_progress, recovery.interrupted_runs
            );
        }

        let active = self
            .registry
            .list_active_tickers()
            .await
            .map_err(OrchestratorError::Registry)?;
        let records: HashMap<_, _> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|record| (record.ticker.clone(), record))
            .collect();

        let Selection {
            mut candidates,
            skipped,
        } = select_candidates(&request, &active, &records, &self.settings.selection_policy());

        let mut deferred = 0;
        if let Some(limit) = request.limit {
            if candidates.len() > limit {
                deferred = candidates.len() - limit;
                candidates.truncate(limit);
                info!("🔢 Limiting to {} tickers ({} left for a later run)", limit, deferred);
            }
        }

        let run_id = Uuid::new_v4().to_string();
        info!(
            "🚀 Starting {} run {} as of {}: {} candidates, {} skipped",
            request.mode,
            run_id,
            request.as_of,
            candidates.len(),
            skipped.len()
        );

        let mut run_record = RunRecord {
            run_id: run_id.clone(),
            mode: request.mode.as_str().to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            fetched: 0,
            skipped: 0,
            failed: 0,
            empty: 0,
            rows_written: 0,
        };
        self.store.begin_run(&run_record).await?;

        let ctx = Arc::new(RunContext::new(
            run_id,
            request,
            candidates,
            skipped,
            self.settings.pacing,
            Arc::clone(&self.cancel),
        ));

        let workers = self.settings.max_workers.min(ctx.total()).max(1);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let orchestrator = self.clone();
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                orchestrator.worker(worker_id, ctx).await
            }));
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!("❌ Worker task failed: {}", e);
                ctx.abort(OrchestratorError::Join(e));
            }
        }

        let fatal = ctx.take_fatal();
        let counters = ctx.counters();
        let status = if fatal.is_some() {
            RunStatus::Aborted
        } else if ctx.was_interrupted_by_user() {
            RunStatus::Cancelled
        } else if counters.failed > 0 {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };
        let summary = ctx.summary(status, deferred, started.elapsed());

        run_record.status = status;
        run_record.finished_at = Some(Utc::now());
        run_record.fetched = summary.fetched as i64;
        run_record.skipped = summary.skipped as i64;
        run_record.failed = summary.failed as i64;
        run_record.empty = summary.empty as i64;
        run_record.rows_written = summary.rows_written as i64;

        if let Err(e) = self.store.finish_run(&run_record).await {
            match fatal {
                Some(_) => warn!("⚠️ Could not mark run {} as aborted: {}", summary.run_id, e),
                None => return Err(e.into()),
            }
        }

        if let Some(e) = fatal {
            error!("❌ Run {} aborted: {}", summary.run_id, e);
            return Err(e);
        }

        info!(
            "✅ Run {} {}: {} fetched, {} empty, {} skipped, {} failed, {} rows written, {} remaining ({:.1?})",
            summary.run_id,
            summary.status,
            summary.fetched,
            summary.empty,
            summary.skipped,
            summary.failed,
            summary.rows_written,
            summary.remaining,
            summary.elapsed
        );

        Ok(summary)
    }

    async fn worker(self, worker_id: usize, ctx: Arc<RunContext>) {
        while let Some(candidate) = ctx.next_candidate() {
            debug!("🔄 Worker {}: starting {}", worker_id, candidate.ticker);

            let result = if ctx.request.mode.is_price_mode() {
                self.process_prices(&ctx, &candidate).await
            } else {
                self.process_fundamentals(&ctx, &candidate).await
            };
            ctx.release(&candidate.ticker);

            match result {
                Ok(outcome) => {
                    match &outcome.kind {
                        OutcomeKind::Fetched => info!(
                            "✅ {}: {} rows written",
                            outcome.ticker, outcome.rows_written
                        ),
                        OutcomeKind::Empty => info!("✅ {}: no new data", outcome.ticker),
                        OutcomeKind::Skipped => debug!("⏭️ {}: skipped", outcome.ticker),
                        OutcomeKind::Failed(kind) => warn!(
                            "❌ {}: {} ({})",
                            outcome.ticker,
                            outcome.message.as_deref().unwrap_or("failed"),
                            kind
                        ),
                    }
                    let processed = ctx.record(outcome);
                    if processed % PROGRESS_LOG_INTERVAL == 0 {
                        ctx.log_progress(processed);
                    }
                }
                Err(e) => {
                    error!("❌ Worker {}: fatal error on {}: {}", worker_id, candidate.ticker, e);
                    ctx.abort(e);
                    break;
                }
            }
        }

        debug!("Worker {} finished", worker_id);
    }

    /// One price candidate through the transition protocol. The record is
    /// only persisted with its final state; `in_progress` stays in memory.
    async fn process_prices(
        &self,
        ctx: &RunContext,
        candidate: &Candidate,
    ) -> Result<TickerOutcome, OrchestratorError> {
        let ticker = candidate.ticker.as_str();
        let Some(window) = candidate.window else {
            return Ok(TickerOutcome::skipped(ticker, "no fetch window"));
        };

        let mut record = candidate.record.clone();
        record.begin().map_err(transition_error(ticker))?;

        if !self.calendar.has_trading_day(window) {
            debug!("{}: no trading days in {}, advancing coverage", ticker, window);
            record
                .complete(window, candidate.reset_attempts_on_success, Utc::now())
                .map_err(transition_error(ticker))?;
            self.store.commit_prices(&record, &[]).await?;
            return Ok(TickerOutcome::empty(ticker, 0));
        }

        let (result, calls) = self
            .call_with_retry(ctx, ticker, || {
                self.fetcher.fetch_prices(ticker, window.start, window.end)
            })
            .await;

        let failure = match result {
            Ok(rows) => match validate_rows(ticker, window, &rows) {
                Ok(()) => match record.complete(window, candidate.reset_attempts_on_success, Utc::now()) {
                    Ok(()) => {
                        let written = self.store.commit_prices(&record, &rows).await?;
                        return Ok(if rows.is_empty() {
                            TickerOutcome::empty(ticker, calls)
                        } else {
                            TickerOutcome::fetched(ticker, written, calls)
                        });
                    }
                    // Coverage stays untouched; the batch is dropped like any other bad batch
                    Err(e @ TransitionError::NonContiguous { .. }) => {
                        FailureInfo::new(ErrorKind::DataIntegrity, e.to_string())
                    }
                    Err(e) => return Err(transition_error(ticker)(e)),
                },
                Err(e) => FailureInfo::new(ErrorKind::DataIntegrity, e.to_string()),
            },
            Err(e) => FailureInfo::new(e.kind(), e.to_string()),
        };

        let outcome = TickerOutcome::failed(ticker, failure.kind, failure.message.clone(), calls);
        record
            .fail(failure, Utc::now())
            .map_err(transition_error(ticker))?;
        self.store.upsert(&record).await?;
        Ok(outcome)
    }

    /// Fundamentals leave the price state machine alone; a failure is only
    /// reported in the outcome.
    async fn process_fundamentals(
        &self,
        ctx: &RunContext,
        candidate: &Candidate,
    ) -> Result<TickerOutcome, OrchestratorError> {
        let ticker = candidate.ticker.as_str();

        let (result, calls) = self
            .call_with_retry(ctx, ticker, || self.fetcher.fetch_fundamentals(ticker))
            .await;

        let mut snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => return Ok(TickerOutcome::failed(ticker, e.kind(), e.to_string(), calls)),
        };
        snapshot.ticker = ticker.to_string();
        snapshot.as_of_date = ctx.request.as_of;

        let mut record = match self.store.get(ticker).await? {
            Some(record) => record,
            None => candidate.record.clone(),
        };
        record.fundamentals_fetched_at = Some(Utc::now());

        if snapshot.is_empty() {
            self.store.upsert(&record).await?;
            return Ok(TickerOutcome::empty(ticker, calls));
        }

        self.store.commit_fundamentals(&record, &snapshot).await?;
        Ok(TickerOutcome::fetched(ticker, 1, calls))
    }

    /// Invoke the fetcher with pacing and a timeout, retrying retryable
    /// errors up to the in-run attempt ceiling. Returns the final result and
    /// the number of calls made.
    async fn call_with_retry<T, F, Fut>(
        &self,
        ctx: &RunContext,
        ticker: &str,
        mut call: F,
    ) -> (Result<T, FetchError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let policy = self.settings.retry;
        let mut calls = 0;

        loop {
            ctx.pacer.wait(self.delay.as_ref()).await;
            calls += 1;

            let result = match tokio::time::timeout(self.settings.fetch_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(self.settings.fetch_timeout)),
            };

            match result {
                Err(e)
                    if e.is_retryable()
                        && calls < policy.max_in_run_attempts
                        && !ctx.is_cancelled() =>
                {
                    let delay = policy.delay_for(calls);
                    warn!(
                        "⚠️ Attempt {} for {} failed: {}. Retrying in {:?}",
                        calls, ticker, e, delay
                    );
                    self.delay.wait(delay).await;
                }
                other => return (other, calls),
            }
        }
    }
}

/// Flip the cancellation flag on Ctrl-C
pub fn install_ctrl_c_handler(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, finishing in-flight tickers and stopping");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

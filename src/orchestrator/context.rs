use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use super::candidates::Candidate;
use super::retry::Pacer;
use super::{OrchestratorError, OutcomeKind, RunRequest, RunSummary, TickerOutcome};
use crate::models::RunStatus;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts derived from the outcome list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub empty: usize,
    pub rows_written: u64,
}

impl RunCounters {
    fn from_outcomes(outcomes: &[TickerOutcome]) -> Self {
        let mut counters = Self::default();
        for outcome in outcomes {
            match outcome.kind {
                OutcomeKind::Fetched => counters.fetched += 1,
                OutcomeKind::Empty => counters.empty += 1,
                OutcomeKind::Skipped => counters.skipped += 1,
                OutcomeKind::Failed(_) => counters.failed += 1,
            }
            counters.rows_written += outcome.rows_written;
        }
        counters
    }
}

/// Shared state of one run, handed to every worker
pub struct RunContext {
    pub run_id: String,
    pub request: RunRequest,
    pub pacer: Pacer,
    total: usize,
    queue: Mutex<VecDeque<Candidate>>,
    /// Tickers currently held by a worker
    claims: Mutex<HashSet<String>>,
    outcomes: Mutex<Vec<TickerOutcome>>,
    processed: AtomicUsize,
    /// Set by Ctrl-C
    cancel: Arc<AtomicBool>,
    aborted: AtomicBool,
    fatal: Mutex<Option<OrchestratorError>>,
}

impl RunContext {
    pub fn new(
        run_id: String,
        request: RunRequest,
        candidates: Vec<Candidate>,
        skipped: Vec<TickerOutcome>,
        pacing: Duration,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            run_id,
            request,
            pacer: Pacer::new(pacing),
            total: candidates.len(),
            queue: Mutex::new(candidates.into()),
            claims: Mutex::new(HashSet::new()),
            outcomes: Mutex::new(skipped),
            processed: AtomicUsize::new(0),
            cancel,
            aborted: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst)
    }

    pub fn was_interrupted_by_user(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Claim the next queued ticker; `None` once drained or cancelled
    pub fn next_candidate(&self) -> Option<Candidate> {
        if self.is_cancelled() {
            return None;
        }

        let mut queue = lock(&self.queue);
        while let Some(candidate) = queue.pop_front() {
            if lock(&self.claims).insert(candidate.ticker.clone()) {
                return Some(candidate);
            }
            warn!("⏭️ {} is already claimed by another worker, dropping duplicate", candidate.ticker);
        }
        None
    }

    pub fn release(&self, ticker: &str) {
        lock(&self.claims).remove(ticker);
    }

    /// Store an outcome; returns how many candidates have been processed
    pub fn record(&self, outcome: TickerOutcome) -> usize {
        lock(&self.outcomes).push(outcome);
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters::from_outcomes(&lock(&self.outcomes))
    }

    pub fn log_progress(&self, processed: usize) {
        let counters = self.counters();
        info!(
            "📊 Progress: {}/{} tickers ({} fetched, {} empty, {} failed, {} rows)",
            processed, self.total, counters.fetched, counters.empty, counters.failed, counters.rows_written
        );
    }

    /// Stop handing out work and keep the first fatal error
    pub fn abort(&self, error: OrchestratorError) {
        self.aborted.store(true, Ordering::SeqCst);
        let mut fatal = lock(&self.fatal);
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }

    pub fn take_fatal(&self) -> Option<OrchestratorError> {
        lock(&self.fatal).take()
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn summary(&self, status: RunStatus, deferred: usize, elapsed: Duration) -> RunSummary {
        let outcomes = lock(&self.outcomes).clone();
        let counters = RunCounters::from_outcomes(&outcomes);

        RunSummary {
            run_id: self.run_id.clone(),
            mode: self.request.mode,
            status,
            fetched: counters.fetched,
            skipped: counters.skipped,
            failed: counters.failed,
            empty: counters.empty,
            rows_written: counters.rows_written,
            remaining: deferred + self.queued(),
            elapsed,
            outcomes,
        }
    }
}

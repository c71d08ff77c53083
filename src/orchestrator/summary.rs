use serde::Serialize;
use std::time::Duration;

use super::RunMode;
use crate::models::{ErrorKind, RunStatus};

/// What happened to one ticker during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutcomeKind {
    /// Data fetched and committed
    Fetched,
    /// Fetch succeeded with no data, or the window had no trading days
    Empty,
    /// Not fetched: already complete, current, fresh, or not eligible
    Skipped,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerOutcome {
    pub ticker: String,
    pub kind: OutcomeKind,
    pub rows_written: u64,
    /// Fetcher invocations spent on this ticker
    pub fetch_calls: u32,
    pub message: Option<String>,
}

impl TickerOutcome {
    pub fn skipped(ticker: &str, reason: impl Into<String>) -> Self {
        Self {
            ticker: ticker.to_string(),
            kind: OutcomeKind::Skipped,
            rows_written: 0,
            fetch_calls: 0,
            message: Some(reason.into()),
        }
    }

    pub fn fetched(ticker: &str, rows_written: u64, fetch_calls: u32) -> Self {
        Self {
            ticker: ticker.to_string(),
            kind: OutcomeKind::Fetched,
            rows_written,
            fetch_calls,
            message: None,
        }
    }

    pub fn empty(ticker: &str, fetch_calls: u32) -> Self {
        Self {
            ticker: ticker.to_string(),
            kind: OutcomeKind::Empty,
            rows_written: 0,
            fetch_calls,
            message: None,
        }
    }

    pub fn failed(ticker: &str, kind: ErrorKind, message: impl Into<String>, fetch_calls: u32) -> Self {
        Self {
            ticker: ticker.to_string(),
            kind: OutcomeKind::Failed(kind),
            rows_written: 0,
            fetch_calls,
            message: Some(message.into()),
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Fetched => f.write_str("fetched"),
            OutcomeKind::Empty => f.write_str("empty"),
            OutcomeKind::Skipped => f.write_str("skipped"),
            OutcomeKind::Failed(kind) => write!(f, "failed [{}]", kind),
        }
    }
}

/// One line per ticker, e.g. `AAPL fetched 42 rows (1 call)`
impl std::fmt::Display for TickerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ticker, self.kind)?;
        if self.kind == OutcomeKind::Fetched {
            write!(f, " {} rows", self.rows_written)?;
        }
        if self.fetch_calls > 0 {
            let plural = if self.fetch_calls == 1 { "" } else { "s" };
            write!(f, " ({} call{})", self.fetch_calls, plural)?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

/// Result of a finished (or cancelled) run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub empty: usize,
    pub rows_written: u64,
    /// Candidates left unprocessed because of the limit or cancellation
    pub remaining: usize,
    pub elapsed: Duration,
    pub outcomes: Vec<TickerOutcome>,
}

impl RunSummary {
    pub fn outcome(&self, ticker: &str) -> Option<&TickerOutcome> {
        self.outcomes.iter().find(|o| o.ticker == ticker)
    }

    pub fn failed_tickers(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.kind, OutcomeKind::Failed(_)))
            .map(|o| o.ticker.as_str())
            .collect()
    }

    pub fn total_fetch_calls(&self) -> u32 {
        self.outcomes.iter().map(|o| o.fetch_calls).sum()
    }

    /// 0 clean, 2 finished with failed tickers, 1 when the run did not finish
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::CompletedWithFailures => 2,
            RunStatus::Running | RunStatus::Aborted | RunStatus::Cancelled | RunStatus::Interrupted => 1,
        }
    }
}

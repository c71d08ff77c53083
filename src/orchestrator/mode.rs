use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// What a run is trying to achieve; drives candidate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    FullBackfill,
    IncrementalUpdate,
    RetryFailed,
    Fundamentals,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::FullBackfill => "full_backfill",
            RunMode::IncrementalUpdate => "incremental_update",
            RunMode::RetryFailed => "retry_failed",
            RunMode::Fundamentals => "fundamentals",
        }
    }

    /// Price modes drive the download state machine; fundamentals does not
    pub fn is_price_mode(&self) -> bool {
        !matches!(self, RunMode::Fundamentals)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one orchestrator run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub mode: RunMode,
    /// Explicit tickers, or every active ticker when `None`
    pub tickers: Option<Vec<String>>,
    /// Skip work already done (complete tickers, fresh fundamentals)
    pub resume: bool,
    /// Ceiling on tickers processed this run
    pub limit: Option<usize>,
    /// The "today" of the run
    pub as_of: NaiveDate,
}

impl RunRequest {
    pub fn new(mode: RunMode, as_of: NaiveDate) -> Self {
        Self {
            mode,
            tickers: None,
            resume: true,
            limit: None,
            as_of,
        }
    }

    pub fn with_tickers<I, S>(mut self, tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tickers = Some(
            tickers
                .into_iter()
                .map(|t| t.as_ref().trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .collect(),
        );
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Whether `ticker` was named explicitly in the request
    pub fn names(&self, ticker: &str) -> bool {
        self.tickers
            .as_ref()
            .map_or(false, |tickers| tickers.iter().any(|t| t == ticker))
    }
}

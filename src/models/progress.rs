//! Per-ticker download progress and its state machine
//!
//! A `ProgressRecord` is the single source of truth for resumability. Its
//! `DownloadState` is a tagged variant: the failure classification lives
//! inside `Failed`, so a completed record can never carry a stale error.
//! Every state change goes through `DownloadState::apply`, which rejects
//! transitions the protocol does not allow.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::DateRange;
use crate::utils::MarketCalendar;

/// Fieldless discriminant of `DownloadState`, as stored in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateKind {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl StateKind {
    pub const ALL: [StateKind; 4] = [
        StateKind::Pending,
        StateKind::InProgress,
        StateKind::Complete,
        StateKind::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Pending => "pending",
            StateKind::InProgress => "in_progress",
            StateKind::Complete => "complete",
            StateKind::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StateKind {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StateKind::Pending),
            "in_progress" => Ok(StateKind::InProgress),
            "complete" => Ok(StateKind::Complete),
            "failed" => Ok(StateKind::Failed),
            other => Err(TransitionError::UnknownState(other.to_string())),
        }
    }
}

/// Classification of a failed fetch, persisted alongside the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Ticker unknown or delisted at the provider
    NotFound,
    RateLimited,
    /// Timeouts, network errors, malformed or partial responses
    Transient,
    /// Rows were fetched but failed validation and were discarded
    DataIntegrity,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::DataIntegrity => "data_integrity",
        }
    }

    /// Whether repeating the same request later can plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(ErrorKind::NotFound),
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "transient" => Ok(ErrorKind::Transient),
            "data_integrity" => Ok(ErrorKind::DataIntegrity),
            other => Err(TransitionError::UnknownErrorKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Pending,
    /// Only ever held in memory by a running orchestrator
    InProgress,
    Complete,
    Failed(FailureInfo),
}

/// Events that move a record through the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Succeed,
    Fail(FailureInfo),
    /// Crash recovery: a leftover `in_progress` becomes `pending`
    Recover,
    /// Explicit reset, e.g. the ticker was removed from the registry
    Reset,
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Succeed => "succeed",
            Transition::Fail(_) => "fail",
            Transition::Recover => "recover",
            Transition::Reset => "reset",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition '{event}' from state '{from}'")]
    Illegal { from: StateKind, event: &'static str },

    #[error("window {window} is not contiguous with covered range {covered}")]
    NonContiguous { covered: CoveredRange, window: DateRange },

    #[error("unknown download state: {0}")]
    UnknownState(String),

    #[error("unknown error kind: {0}")]
    UnknownErrorKind(String),

    #[error("failed record for {0} has no error classification")]
    MissingFailure(String),
}

impl DownloadState {
    pub fn kind(&self) -> StateKind {
        match self {
            DownloadState::Pending => StateKind::Pending,
            DownloadState::InProgress => StateKind::InProgress,
            DownloadState::Complete => StateKind::Complete,
            DownloadState::Failed(_) => StateKind::Failed,
        }
    }

    /// Compute the state reached by applying `event`, or reject it
    pub fn apply(&self, event: &Transition) -> Result<DownloadState, TransitionError> {
        use DownloadState::*;

        let illegal = || TransitionError::Illegal {
            from: self.kind(),
            event: event.name(),
        };

        match (self, event) {
            // Starting is idempotent and allowed from every resting state:
            // complete tickers are re-fetched by incremental runs and by
            // non-resuming backfills.
            (Pending | Complete | Failed(_) | InProgress, Transition::Start) => Ok(InProgress),

            (InProgress, Transition::Succeed) => Ok(Complete),
            (Pending | Complete | Failed(_), Transition::Succeed) => Err(illegal()),

            (InProgress, Transition::Fail(info)) => Ok(Failed(info.clone())),
            (Pending | Complete | Failed(_), Transition::Fail(_)) => Err(illegal()),

            (InProgress, Transition::Recover) => Ok(Pending),
            (Pending | Complete | Failed(_), Transition::Recover) => Err(illegal()),

            (Pending | InProgress | Complete | Failed(_), Transition::Reset) => Ok(Pending),
        }
    }
}

/// Contiguous span of trading dates known to be persisted and validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredRange {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
}

impl std::fmt::Display for CoveredRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.earliest, self.latest)
    }
}

impl CoveredRange {
    pub fn new(earliest: NaiveDate, latest: NaiveDate) -> Self {
        Self { earliest, latest }
    }

    /// Union of an existing coverage with a newly fetched window.
    ///
    /// The two must overlap or touch, otherwise the union would claim
    /// coverage over dates that were never fetched.
    pub fn merge(existing: Option<CoveredRange>, window: DateRange) -> Result<CoveredRange, TransitionError> {
        let Some(covered) = existing else {
            return Ok(CoveredRange::new(window.start, window.end));
        };

        let touches_after = covered.latest.succ_opt().map_or(true, |next| window.start <= next);
        let touches_before = covered.earliest.pred_opt().map_or(true, |prev| window.end >= prev);
        if !(touches_after && touches_before) {
            return Err(TransitionError::NonContiguous { covered, window });
        }

        Ok(CoveredRange {
            earliest: covered.earliest.min(window.start),
            latest: covered.latest.max(window.end),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub ticker: String,
    pub state: DownloadState,
    pub covered_range: Option<CoveredRange>,
    pub attempt_count: u32,
    /// `attempt_count` value when the retry eligibility window was last opened
    pub retry_window_base: u32,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub fundamentals_fetched_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn pending(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            state: DownloadState::Pending,
            covered_range: None,
            attempt_count: 0,
            retry_window_base: 0,
            last_attempted_at: None,
            fundamentals_fetched_at: None,
        }
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn last_error(&self) -> Option<&FailureInfo> {
        match &self.state {
            DownloadState::Failed(info) => Some(info),
            _ => None,
        }
    }

    fn transition(&mut self, event: Transition) -> Result<(), TransitionError> {
        self.state = self.state.apply(&event)?;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(Transition::Start)
    }

    /// Record a successful fetch of `window` (with or without rows).
    ///
    /// `reset_attempts` is set when an explicit retry brought the ticker out
    /// of `failed`; every other success leaves the counter alone.
    pub fn complete(
        &mut self,
        window: DateRange,
        reset_attempts: bool,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let covered = CoveredRange::merge(self.covered_range, window)?;
        self.transition(Transition::Succeed)?;
        self.covered_range = Some(covered);
        self.last_attempted_at = Some(at);
        if reset_attempts {
            self.attempt_count = 0;
            self.retry_window_base = 0;
        }
        Ok(())
    }

    pub fn fail(&mut self, failure: FailureInfo, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(Transition::Fail(failure))?;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempted_at = Some(at);
        Ok(())
    }

    pub fn recover(&mut self) -> Result<(), TransitionError> {
        self.transition(Transition::Recover)
    }

    /// Registry removal: a failed ticker goes back to `pending` and its
    /// attempt history is cleared. Other states keep their history, and
    /// coverage is always kept for audit.
    pub fn reset_for_registry_removal(&mut self) -> Result<(), TransitionError> {
        if let DownloadState::Failed(_) = self.state {
            self.transition(Transition::Reset)?;
            self.attempt_count = 0;
            self.retry_window_base = 0;
        }
        Ok(())
    }

    /// Attempts counted since the last manual retry opened the window
    pub fn attempts_in_window(&self) -> u32 {
        self.attempt_count.saturating_sub(self.retry_window_base)
    }

    pub fn open_retry_window(&mut self) {
        self.retry_window_base = self.attempt_count;
    }

    /// Whether automatic selection (backfill) may pick this ticker up.
    /// Permanent failures and exhausted retry windows wait for a manual retry.
    pub fn is_auto_eligible(&self, max_attempts: u32) -> bool {
        match &self.state {
            DownloadState::Failed(info) => {
                info.kind != ErrorKind::NotFound && self.attempts_in_window() < max_attempts
            }
            _ => true,
        }
    }

    /// `complete` and covering up to within one trading day of `as_of`
    pub fn is_current(&self, as_of: NaiveDate, calendar: &MarketCalendar) -> bool {
        match (&self.state, self.covered_range) {
            (DownloadState::Complete, Some(covered)) => {
                calendar.trading_days_after(covered.latest, as_of) <= 1
            }
            _ => false,
        }
    }
}

/// Number of progress records per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub complete: i64,
    pub failed: i64,
}

impl StateCounts {
    pub fn get(&self, kind: StateKind) -> i64 {
        match kind {
            StateKind::Pending => self.pending,
            StateKind::InProgress => self.in_progress,
            StateKind::Complete => self.complete,
            StateKind::Failed => self.failed,
        }
    }

    pub fn add(&mut self, kind: StateKind, count: i64) {
        match kind {
            StateKind::Pending => self.pending += count,
            StateKind::InProgress => self.in_progress += count,
            StateKind::Complete => self.complete += count,
            StateKind::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> i64 {
        StateKind::ALL.iter().map(|kind| self.get(*kind)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StateKind, i64)> + '_ {
        StateKind::ALL.iter().map(move |kind| (*kind, self.get(*kind)))
    }
}

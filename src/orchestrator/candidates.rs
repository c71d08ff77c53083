//! Per-mode candidate selection and fetch windows

use chrono::{Duration, NaiveDate};
use std::collections::{BTreeSet, HashMap};

use super::{RunMode, RunRequest, TickerOutcome};
use crate::models::{DateRange, DownloadState, ErrorKind, ProgressRecord, StateKind, Ticker};

/// A ticker selected for processing, with the snapshot it was selected from
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub ticker: String,
    pub record: ProgressRecord,
    /// Price window to fetch; `None` for fundamentals
    pub window: Option<DateRange>,
    /// Explicit retry: success clears the attempt counter
    pub reset_attempts_on_success: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub backfill_start: NaiveDate,
    pub max_attempts: u32,
    pub fundamentals_max_age_days: i64,
}

#[derive(Debug, Default)]
pub struct Selection {
    pub candidates: Vec<Candidate>,
    pub skipped: Vec<TickerOutcome>,
}

/// Backfill window for a record: resumes after existing coverage, and never
/// leaves a gap between the coverage and the new window.
///
/// A non-resuming backfill that starts before the coverage always runs up to
/// the day before it, even when `as_of` is earlier.
pub fn backfill_window(
    record: &ProgressRecord,
    backfill_start: NaiveDate,
    as_of: NaiveDate,
    resume: bool,
) -> Option<DateRange> {
    let (start, end) = match record.covered_range {
        Some(covered) => {
            let next = covered.latest.succ_opt()?;
            if resume {
                (next, as_of)
            } else if backfill_start < covered.earliest {
                let before = covered.earliest.pred_opt()?;
                (backfill_start, as_of.max(before))
            } else {
                (backfill_start.min(next), as_of)
            }
        }
        None => (backfill_start, as_of),
    };

    let window = DateRange::new(start, end);
    (!window.is_empty()).then_some(window)
}

/// Day after the covered range through `as_of`; `None` when already current
pub fn incremental_window(record: &ProgressRecord, as_of: NaiveDate) -> Option<DateRange> {
    let covered = record.covered_range?;
    let window = DateRange::new(covered.latest.succ_opt()?, as_of);
    (!window.is_empty()).then_some(window)
}

fn fundamentals_fresh(record: &ProgressRecord, as_of: NaiveDate, max_age_days: i64) -> bool {
    record
        .fundamentals_fetched_at
        .map_or(false, |fetched| fetched.date_naive() + Duration::days(max_age_days) > as_of)
}

fn ineligible_reason(record: &ProgressRecord) -> String {
    match &record.state {
        DownloadState::Failed(info) if info.kind == ErrorKind::NotFound => {
            "permanent failure (not_found); name it explicitly to retry".to_string()
        }
        _ => format!(
            "retry window exhausted after {} attempts; run retry-failed",
            record.attempts_in_window()
        ),
    }
}

/// Pick the tickers a run will process and the ones it deliberately skips
pub fn select_candidates(
    request: &RunRequest,
    active: &[Ticker],
    records: &HashMap<String, ProgressRecord>,
    policy: &SelectionPolicy,
) -> Selection {
    let mut selection = Selection::default();

    let active_symbols: BTreeSet<&str> = active.iter().map(|t| t.symbol.as_str()).collect();
    let universe: Vec<&str> = match &request.tickers {
        Some(named) => {
            let named: BTreeSet<&str> = named.iter().map(String::as_str).collect();
            for symbol in named.iter().filter(|s| !active_symbols.contains(*s)) {
                selection
                    .skipped
                    .push(TickerOutcome::skipped(symbol, "not an active ticker in the registry"));
            }
            named.into_iter().filter(|s| active_symbols.contains(s)).collect()
        }
        None => active_symbols.into_iter().collect(),
    };

    for symbol in universe {
        let named = request.names(symbol);
        let record = records
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| ProgressRecord::pending(symbol));

        let candidate = match request.mode {
            RunMode::FullBackfill => {
                if request.resume && record.kind() == StateKind::Complete {
                    selection.skipped.push(TickerOutcome::skipped(symbol, "already complete"));
                    continue;
                }
                if !named && !record.is_auto_eligible(policy.max_attempts) {
                    selection
                        .skipped
                        .push(TickerOutcome::skipped(symbol, ineligible_reason(&record)));
                    continue;
                }
                let Some(window) =
                    backfill_window(&record, policy.backfill_start, request.as_of, request.resume)
                else {
                    selection.skipped.push(TickerOutcome::skipped(symbol, "already covered"));
                    continue;
                };
                Candidate {
                    ticker: symbol.to_string(),
                    record,
                    window: Some(window),
                    reset_attempts_on_success: false,
                }
            }

            RunMode::IncrementalUpdate => {
                if record.kind() != StateKind::Complete {
                    if named {
                        selection
                            .skipped
                            .push(TickerOutcome::skipped(symbol, "not complete; run download first"));
                    }
                    continue;
                }
                let Some(window) = incremental_window(&record, request.as_of) else {
                    selection.skipped.push(TickerOutcome::skipped(symbol, "already current"));
                    continue;
                };
                Candidate {
                    ticker: symbol.to_string(),
                    record,
                    window: Some(window),
                    reset_attempts_on_success: false,
                }
            }

            RunMode::RetryFailed => {
                let DownloadState::Failed(info) = &record.state else {
                    if named {
                        selection.skipped.push(TickerOutcome::skipped(symbol, "not failed"));
                    }
                    continue;
                };
                if info.kind == ErrorKind::NotFound && !named {
                    selection
                        .skipped
                        .push(TickerOutcome::skipped(symbol, ineligible_reason(&record)));
                    continue;
                }
                let Some(window) = backfill_window(&record, policy.backfill_start, request.as_of, true)
                else {
                    selection.skipped.push(TickerOutcome::skipped(symbol, "already covered"));
                    continue;
                };
                let mut record = record;
                record.open_retry_window();
                Candidate {
                    ticker: symbol.to_string(),
                    record,
                    window: Some(window),
                    reset_attempts_on_success: true,
                }
            }

            RunMode::Fundamentals => {
                if request.resume
                    && fundamentals_fresh(&record, request.as_of, policy.fundamentals_max_age_days)
                {
                    selection.skipped.push(TickerOutcome::skipped(symbol, "fundamentals fresh"));
                    continue;
                }
                Candidate {
                    ticker: symbol.to_string(),
                    record,
                    window: None,
                    reset_attempts_on_success: false,
                }
            }
        };

        selection.candidates.push(candidate);
    }

    if request.mode == RunMode::RetryFailed {
        // Oldest failure first; never-attempted rows lead
        selection.candidates.sort_by(|a, b| {
            a.record
                .last_attempted_at
                .cmp(&b.record.last_attempted_at)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
    }

    selection
}

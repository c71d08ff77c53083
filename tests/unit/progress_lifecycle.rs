//! Progress record lifecycle through the public API

use assert_matches::assert_matches;
use chrono::Utc;
use pretty_assertions::assert_eq;
use test_log::test;

use crate::common::date;
use stock_ingest::models::{
    CoveredRange, DateRange, ErrorKind, FailureInfo, ProgressRecord, StateKind, TransitionError,
};

fn timeout() -> FailureInfo {
    FailureInfo::new(ErrorKind::Transient, "fetch timed out after 30s")
}

#[test]
fn test_eligibility_window_survives_manual_retry() {
    let mut record = ProgressRecord::pending("XYZ");

    for _ in 0..3 {
        record.begin().unwrap();
        record.fail(timeout(), Utc::now()).unwrap();
    }
    assert_eq!(record.attempt_count, 3);
    assert!(!record.is_auto_eligible(3));

    // A manual retry reopens the window without touching the counter
    record.open_retry_window();
    assert_eq!(record.attempt_count, 3);
    assert!(record.is_auto_eligible(3));

    record.begin().unwrap();
    record
        .complete(DateRange::new(date(2024, 1, 2), date(2024, 1, 5)), true, Utc::now())
        .unwrap();
    assert_eq!(record.kind(), StateKind::Complete);
    assert_eq!(record.attempt_count, 0);
    assert!(record.last_error().is_none());
}

#[test]
fn test_success_keeps_attempts_outside_explicit_retry() {
    let mut record = ProgressRecord::pending("AAPL");
    record.begin().unwrap();
    record.fail(timeout(), Utc::now()).unwrap();

    record.begin().unwrap();
    record
        .complete(DateRange::new(date(2024, 1, 2), date(2024, 1, 5)), false, Utc::now())
        .unwrap();
    assert_eq!(record.attempt_count, 1);
}

#[test]
fn test_illegal_transitions_are_rejected() {
    let mut record = ProgressRecord::pending("AAPL");
    let window = DateRange::new(date(2024, 1, 2), date(2024, 1, 5));

    assert_matches!(
        record.complete(window, false, Utc::now()),
        Err(TransitionError::Illegal { from: StateKind::Pending, .. })
    );
    assert_matches!(record.recover(), Err(TransitionError::Illegal { .. }));
    assert_eq!(record, ProgressRecord::pending("AAPL"));
}

#[test]
fn test_coverage_stays_contiguous() {
    let mut record = ProgressRecord::pending("AAPL");
    record.begin().unwrap();
    record
        .complete(DateRange::new(date(2024, 1, 2), date(2024, 1, 5)), false, Utc::now())
        .unwrap();

    // A gap after the covered range is refused and leaves the record untouched
    record.begin().unwrap();
    let before = record.covered_range;
    assert_matches!(
        record.complete(DateRange::new(date(2024, 2, 1), date(2024, 2, 5)), false, Utc::now()),
        Err(TransitionError::NonContiguous { .. })
    );
    assert_eq!(record.covered_range, before);

    record
        .complete(DateRange::new(date(2024, 1, 6), date(2024, 1, 10)), false, Utc::now())
        .unwrap();
    assert_eq!(
        record.covered_range,
        Some(CoveredRange::new(date(2024, 1, 2), date(2024, 1, 10)))
    );
}

#[test]
fn test_registry_removal_clears_failure_history() {
    let mut record = ProgressRecord::pending("GONE");
    record.begin().unwrap();
    record
        .fail(FailureInfo::new(ErrorKind::NotFound, "GONE not found at provider"), Utc::now())
        .unwrap();

    record.reset_for_registry_removal().unwrap();
    assert_eq!(record.kind(), StateKind::Pending);
    assert_eq!(record.attempt_count, 0);
}

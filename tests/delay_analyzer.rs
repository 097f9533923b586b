use finbench_driver::{
    compute_summary, compute_summary_from_log, validate, CsvResultsLog, LatencyRecord,
    OperationCounts, OperationType, TolerancePolicy, ValidationError, ValidationPolicy,
};
use std::collections::BTreeMap;
use tempfile::tempdir;

fn delayed(op_type: &str, scheduled_ms: u64, delay_ms: u64) -> LatencyRecord {
    LatencyRecord::new(
        OperationType::new(op_type),
        scheduled_ms,
        scheduled_ms + delay_ms,
        1_000_000,
        0,
    )
}

fn counts(entries: &[(&str, u64)]) -> OperationCounts {
    OperationCounts::new(
        entries
            .iter()
            .map(|(op_type, count)| (OperationType::new(op_type), *count))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// `late` of `total` operations of type A start 2 s late; the rest on time.
fn run_with_late(total: u64, late: u64) -> Vec<LatencyRecord> {
    (0..total)
        .map(|i| delayed("A", i * 10, if i < late { 2_000 } else { 5 }))
        .collect()
}

#[test]
fn summary_rounds_the_aggregate_mean_and_ceils_per_type_means() {
    let records = vec![delayed("A", 100, 50), delayed("A", 200, 301), delayed("B", 0, 7)];
    let summary = compute_summary(&records, 1_000).unwrap();

    let a = &summary.per_type[&OperationType::new("A")];
    assert_eq!(a.count, 2);
    assert_eq!(a.min_ms, 50);
    assert_eq!(a.max_ms, 301);
    // 175.5 rounded up
    assert_eq!(a.mean_ms, 176);

    assert_eq!(summary.aggregate.count, 3);
    assert_eq!(summary.aggregate.min_ms, 7);
    // (50 + 301 + 7) / 3 = 119.33, rounded to nearest
    assert_eq!(summary.aggregate.mean_ms, 119);
    assert_eq!(summary.excessive_delay_count, 0);
    assert_eq!(summary.operation_count(), 3);
}

#[test]
fn excessive_means_strictly_above_the_threshold() {
    let records = vec![delayed("A", 0, 100), delayed("A", 10, 101), delayed("B", 0, 500)];
    let summary = compute_summary(&records, 100).unwrap();
    assert_eq!(summary.excessive_delay_count, 2);
    assert_eq!(summary.excessive_for(&OperationType::new("A")), 1);
    assert_eq!(summary.excessive_for(&OperationType::new("B")), 1);
    assert_eq!(summary.excessive_for(&OperationType::new("C")), 0);
}

#[test]
fn negative_delay_aborts_the_analysis() {
    let records = vec![
        delayed("A", 0, 5),
        LatencyRecord::new(OperationType::new("A"), 500, 499, 0, 0),
    ];
    match compute_summary(&records, 1_000) {
        Err(ValidationError::NegativeDelay {
            scheduled_ms,
            actual_ms,
            ..
        }) => {
            assert_eq!(scheduled_ms, 500);
            assert_eq!(actual_ms, 499);
        }
        other => panic!("expected a negative delay error, got {other:?}"),
    }
}

#[test]
fn tolerance_boundary_passes_at_the_limit_and_fails_beyond_it() {
    let tolerance = TolerancePolicy::new(1_000, 0.01);
    let policy = ValidationPolicy::Execution {
        record_delayed_operations: true,
    };

    let at_limit = compute_summary(&run_with_late(1_000, 10), 1_000).unwrap();
    let result = validate(&at_limit, &tolerance, &counts(&[("A", 1_000)]), policy);
    assert!(result.passed(), "{}", result.audit_message());

    let beyond = compute_summary(&run_with_late(1_000, 11), 1_000).unwrap();
    let result = validate(&beyond, &tolerance, &counts(&[("A", 1_000)]), policy);
    assert!(!result.passed());
    assert!(result.above_threshold);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].late, 11);
    assert_eq!(result.errors[0].allowed, 10);
    assert!(result.audit_message().contains("FAILED"));
}

#[test]
fn per_type_fractions_override_the_default() {
    let tolerance = TolerancePolicy::new(1_000, 0.01).with_type_fraction("A", 0.05);
    let summary = compute_summary(&run_with_late(1_000, 40), 1_000).unwrap();
    let result = validate(
        &summary,
        &tolerance,
        &counts(&[("A", 1_000)]),
        ValidationPolicy::Execution {
            record_delayed_operations: true,
        },
    );
    assert!(result.passed());
}

#[test]
fn execution_policy_ignores_types_when_delays_are_not_recorded() {
    let tolerance = TolerancePolicy::new(1_000, 0.01);
    let summary = compute_summary(&run_with_late(100, 50), 1_000).unwrap();
    let result = validate(
        &summary,
        &tolerance,
        &counts(&[("A", 100)]),
        ValidationPolicy::Execution {
            record_delayed_operations: false,
        },
    );
    assert!(result.passed());
    assert!(result.errors.is_empty());
    assert_eq!(result.throughput_ops_per_sec, None);
}

#[test]
fn automatic_policy_judges_the_aggregate_late_count() {
    let summary = compute_summary(&run_with_late(1_000, 5), 1_000).unwrap();
    let counts = counts(&[("A", 1_000)]).with_throughput(250.0);

    // Per-type violations are listed; above_threshold follows the aggregate
    // allowance alone.
    let lenient = TolerancePolicy::new(1_000, 0.0).with_tolerated_count(5);
    let result = validate(&summary, &lenient, &counts, ValidationPolicy::Automatic);
    assert!(!result.above_threshold);
    assert_eq!(result.errors.len(), 1);
    assert!(!result.passed());

    let strict = TolerancePolicy::new(1_000, 0.01).with_tolerated_count(4);
    let result = validate(&summary, &strict, &counts, ValidationPolicy::Automatic);
    assert!(result.above_threshold);
    assert!(result.errors.is_empty());
    assert_eq!(result.throughput_ops_per_sec, Some(250.0));
    assert!((result.on_time_ratio.unwrap() - 0.995).abs() < 1e-12);
}

#[test]
fn summary_can_be_computed_from_a_persisted_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run-results_log.csv");
    let mut log = CsvResultsLog::create(&path, true).unwrap();
    for record in [delayed("A", 100, 50), delayed("A", 200, 300)] {
        log.write(&record).unwrap();
    }
    log.flush().unwrap();
    assert_eq!(log.rows(), 2);

    let summary = compute_summary_from_log(&path, 100).unwrap();
    let a = &summary.per_type[&OperationType::new("A")];
    assert_eq!((a.min_ms, a.max_ms, a.mean_ms), (50, 300, 175));
    assert_eq!(summary.excessive_delay_count, 1);
}

#[test]
fn malformed_log_rows_abort_the_summary() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run-results_log.csv");
    let mut log = CsvResultsLog::create(&path, true).unwrap();
    log.write(&delayed("A", 100, 50)).unwrap();
    log.flush().unwrap();
    drop(log);
    let mut text = std::fs::read_to_string(&path).unwrap();
    text.push_str("A|oops|1|0.5|0\n");
    std::fs::write(&path, text).unwrap();

    match compute_summary_from_log(&path, 100) {
        Err(ValidationError::ResultsLog(err)) => assert!(err.to_string().contains("line 3")),
        other => panic!("unexpected result {other:?}"),
    }
}

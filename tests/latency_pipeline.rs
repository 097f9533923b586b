use finbench_driver::{
    read_results_log, results_log_rows, BackpressureError, BackpressureQueue, DriverLog,
    FailureCell, Histogram, LatencyPipeline, LatencyRecord, OperationType, ResultsLogError,
    ResultsLogSink, RESULTS_LOG_HEADER,
};
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn record(op_type: &str, scheduled_ms: u64, actual_ms: u64, duration_ns: u64) -> LatencyRecord {
    LatencyRecord::new(OperationType::new(op_type), scheduled_ms, actual_ms, duration_ns, 0)
}

#[test]
fn histogram_reports_exact_small_percentiles() {
    let mut histogram = Histogram::new();
    for value in 1..=100 {
        histogram.record(value);
    }
    assert_eq!(histogram.count(), 100);
    assert_eq!(histogram.min(), 1);
    assert_eq!(histogram.max(), 100);
    assert_eq!(histogram.mean(), 50.5);
    assert_eq!(histogram.mean_ceil(), 51);
    assert_eq!(histogram.mean_round(), 51);
    assert_eq!(histogram.percentile(0.50), 50);
    assert_eq!(histogram.percentile(0.99), 99);
    assert_eq!(histogram.percentile(1.0), 100);
}

#[test]
fn histogram_percentiles_stay_within_bucket_precision() {
    let mut histogram = Histogram::new();
    for value in 0..10_000u64 {
        histogram.record(value * 1_000);
    }
    let p90 = histogram.percentile(0.90) as f64;
    let exact = 9_000_000.0;
    assert!((p90 - exact).abs() / exact < 0.04, "p90 {p90}");

    let mut merged = Histogram::new();
    merged.merge(&histogram);
    merged.record(u64::MAX);
    assert_eq!(merged.count(), 10_001);
    assert_eq!(merged.max(), u64::MAX);
    assert_eq!(merged.percentile(1.0), u64::MAX);
}

#[test]
fn concurrent_workers_lose_no_records() {
    let failure = Arc::new(FailureCell::new());
    let pipeline = Arc::new(LatencyPipeline::start(
        ResultsLogSink::Null,
        64,
        failure.clone(),
        DriverLog::capture("pipeline-test"),
    ));
    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                let op_type = if worker % 2 == 0 { "read" } else { "write" };
                for i in 0..1_000u64 {
                    pipeline
                        .record(record(op_type, i, i + 1, 50_000))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pipeline.submitted(), 8_000);

    let snapshot = pipeline.snapshot().unwrap();
    assert_eq!(snapshot.total_count, 8_000);
    assert_eq!(snapshot.count_for(&OperationType::new("read")), 4_000);
    assert_eq!(snapshot.count_for(&OperationType::new("write")), 4_000);
    assert_eq!(snapshot.operations[0].latency_us.max, 50);
    assert!(!failure.is_set());

    // Intake is closed after the snapshot.
    assert!(pipeline.record(record("read", 0, 0, 0)).is_err());
    assert_eq!(pipeline.snapshot().unwrap().total_count, 8_000);
}

#[test]
fn throughput_spans_first_start_to_last_finish() {
    let pipeline = LatencyPipeline::start(
        ResultsLogSink::Null,
        16,
        Arc::new(FailureCell::new()),
        DriverLog::capture("pipeline-test"),
    );
    for i in 0..10u64 {
        // 10 operations between t=1000 and t=2000.
        pipeline
            .record(record("read", 1_000 + i * 100, 1_000 + i * 100, 100_000_000))
            .unwrap();
    }
    let snapshot = pipeline.snapshot().unwrap();
    assert_eq!(snapshot.start_time_ms, Some(1_000));
    assert_eq!(snapshot.finish_time_ms, Some(2_000));
    assert_eq!(snapshot.throughput_ops_per_sec, 10.0);
}

#[test]
fn results_log_is_written_and_read_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bench-results_log.csv");
    let pipeline = LatencyPipeline::start(
        ResultsLogSink::create(Some(&path), false).unwrap(),
        16,
        Arc::new(FailureCell::new()),
        DriverLog::capture("pipeline-test"),
    );
    assert_eq!(pipeline.results_log_path(), Some(&path));
    pipeline.record(record("deposit", 10, 60, 2_500_000)).unwrap();
    pipeline
        .record(LatencyRecord::new(OperationType::new("audit"), 20, 320, 1_000, -1))
        .unwrap();
    pipeline.shutdown().unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next().unwrap(), RESULTS_LOG_HEADER.join("|"));
    assert_eq!(lines.next().unwrap(), "deposit|10|60|2.500|0");
    assert_eq!(lines.next().unwrap(), "audit|20|320|0.001|-1");

    let records = read_results_log(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], record("deposit", 10, 60, 2_500_000));
    assert_eq!(records[1].outcome, -1);
    assert_eq!(records[1].duration_ns, 1_000);
}

#[test]
fn malformed_results_log_rows_are_reported_with_their_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.csv");
    fs::write(
        &path,
        format!("{}\nread|1|2|0.5|0\nread|x|2|0.5|0\n", RESULTS_LOG_HEADER.join("|")),
    )
    .unwrap();
    match read_results_log(&path) {
        Err(ResultsLogError::Malformed { line, .. }) => assert_eq!(line, 3),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn results_log_rows_are_read_lazily() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.csv");
    fs::write(
        &path,
        format!("{}\nread|1|2|0.5|0\nread|x|2|0.5|0\n", RESULTS_LOG_HEADER.join("|")),
    )
    .unwrap();
    let mut rows = results_log_rows(&path).unwrap();
    let first = rows.next().unwrap().unwrap();
    assert_eq!((first.scheduled_ms, first.actual_ms), (1, 2));
    assert!(matches!(
        rows.next(),
        Some(Err(ResultsLogError::Malformed { line: 3, .. }))
    ));
    assert!(rows.next().is_none());
}

#[test]
fn histogram_mean_round_breaks_halves_upwards() {
    let mut thirds = Histogram::new();
    for value in [1, 1, 2] {
        thirds.record(value);
    }
    assert_eq!(thirds.mean_round(), 1);
    assert_eq!(thirds.mean_ceil(), 2);

    let mut halves = Histogram::new();
    for value in [1, 2] {
        halves.record(value);
    }
    assert_eq!(halves.mean_round(), 2);
}

#[test]
fn saturated_queue_hands_the_item_back() {
    let queue = BackpressureQueue::new(2);
    queue.enqueue(1).unwrap();
    queue.enqueue(2).unwrap();
    match queue.enqueue(3) {
        Err(err @ BackpressureError::Saturated(_)) => assert_eq!(err.into_inner(), 3),
        other => panic!("unexpected result {other:?}"),
    }
    let telemetry = queue.telemetry();
    assert_eq!(telemetry.depth, 2);
    assert_eq!(telemetry.utilization(), 1.0);

    queue.close();
    assert!(matches!(queue.enqueue(4), Err(BackpressureError::Closed(4))));
    assert_eq!(queue.try_dequeue(), Some(1));
}

use finbench_driver::{
    stream_from_vec, system_clock, worker_queue, CompletionTimeService, ConnectorError,
    DbConnector, DbSession, DispatchReport, Dispatcher, DispatcherConfig, DriverLog, DummyConfig,
    DummyConnector, FailureCell, FailureKind, LatencyPipeline, ManualTimeSource, Operation,
    OperationOutcome, ResultsLogSink, RunContext, StatusReporter, StatusSample,
    ThroughputEstimator, TimeSource, WorkerMetrics, WorkerSendError, WriterHandle,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

struct Harness {
    ctx: RunContext,
    pipeline: Arc<LatencyPipeline>,
    failure: Arc<FailureCell>,
}

fn harness(connector: Arc<dyn DbConnector>, completion: Arc<CompletionTimeService>) -> Harness {
    let failure = Arc::new(FailureCell::new());
    let log = DriverLog::capture("dispatcher-test");
    let pipeline = Arc::new(LatencyPipeline::start(
        ResultsLogSink::Null,
        1_024,
        failure.clone(),
        log.clone(),
    ));
    Harness {
        ctx: RunContext {
            failure: failure.clone(),
            completion,
            pipeline: pipeline.clone(),
            connector,
            clock: system_clock(),
            log,
        },
        pipeline,
        failure,
    }
}

fn without_dependencies() -> Arc<CompletionTimeService> {
    let completion = Arc::new(CompletionTimeService::with_poll_interval(Duration::from_millis(1)));
    completion.seed_if_no_writers().unwrap();
    completion
}

fn operations(count: u64, op_type: &str) -> Vec<Operation> {
    (0..count)
        .map(|t| Operation::new(op_type, t, json!({ "seq": t })))
        .collect()
}

fn config(worker_count: usize) -> DispatcherConfig {
    DispatcherConfig {
        worker_count,
        spinner_sleep: Duration::from_millis(2),
        ..DispatcherConfig::default()
    }
}

fn run(
    config: DispatcherConfig,
    harness: &Harness,
    ops: Vec<Operation>,
    writers: Vec<WriterHandle>,
) -> DispatchReport {
    Dispatcher::new(config, harness.ctx.clone(), stream_from_vec(ops), writers).run()
}

/// Connector that journals session events so tests can check ordering.
#[derive(Default)]
struct JournalConnector {
    journal: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicU64>,
    slow_types: BTreeSet<String>,
    fail_at: Option<u64>,
}

impl DbConnector for JournalConnector {
    fn name(&self) -> &str {
        "journal"
    }

    fn init(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn open_session(&self, _worker: usize) -> Result<Box<dyn DbSession>, ConnectorError> {
        Ok(Box::new(JournalSession {
            journal: self.journal.clone(),
            attempts: self.attempts.clone(),
            slow_types: self.slow_types.clone(),
            fail_at: self.fail_at,
        }))
    }

    fn reset(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

struct JournalSession {
    journal: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicU64>,
    slow_types: BTreeSet<String>,
    fail_at: Option<u64>,
}

impl DbSession for JournalSession {
    fn execute(&mut self, operation: &Operation) -> Result<OperationOutcome, ConnectorError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if Some(attempt) == self.fail_at {
            return Err(ConnectorError::Connection("socket closed".into()));
        }
        let name = format!("{}@{}", operation.op_type(), operation.original_ms());
        self.journal.lock().unwrap().push(format!("start {name}"));
        if self.slow_types.contains(operation.op_type().as_str()) {
            thread::sleep(Duration::from_millis(50));
        }
        self.journal.lock().unwrap().push(format!("end {name}"));
        Ok(OperationOutcome::ok(Value::Null))
    }
}

#[test]
fn every_operation_is_executed_and_recorded() {
    let connector = Arc::new(DummyConnector::new(DummyConfig::default()));
    let harness = harness(connector.clone(), without_dependencies());
    let report = run(config(4), &harness, operations(200, "read"), Vec::new());

    assert!(!report.is_failed(), "{:?}", report.error_state);
    assert_eq!(report.dispatched, 200);
    assert_eq!(report.executed, 200);
    assert_eq!(report.skipped, 0);
    assert_eq!(connector.executed(), 200);
    assert_eq!(connector.sessions_opened(), 4);

    let snapshot = harness.pipeline.snapshot().unwrap();
    assert_eq!(snapshot.total_count, 200);
    assert_eq!(snapshot.error_count, 0);
}

#[test]
fn a_single_worker_executes_in_stream_order() {
    let connector = Arc::new(JournalConnector::default());
    let journal = connector.journal.clone();
    let harness = harness(connector, without_dependencies());
    run(config(1), &harness, operations(20, "read"), Vec::new());

    let starts: Vec<String> = journal
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.starts_with("start"))
        .cloned()
        .collect();
    let expected: Vec<String> = (0..20).map(|t| format!("start read@{t}")).collect();
    assert_eq!(starts, expected);
}

/// Connector whose sessions hold their first operation until the test
/// releases the barrier.
struct GatedConnector {
    gate: Arc<Barrier>,
}

struct GatedSession {
    gate: Arc<Barrier>,
    released: bool,
}

impl DbConnector for GatedConnector {
    fn name(&self) -> &str {
        "gated"
    }

    fn init(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn open_session(&self, _worker: usize) -> Result<Box<dyn DbSession>, ConnectorError> {
        Ok(Box::new(GatedSession {
            gate: self.gate.clone(),
            released: false,
        }))
    }

    fn reset(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

impl DbSession for GatedSession {
    fn execute(&mut self, _operation: &Operation) -> Result<OperationOutcome, ConnectorError> {
        if !self.released {
            self.gate.wait();
            self.released = true;
        }
        Ok(OperationOutcome::ok(Value::Null))
    }
}

#[test]
fn full_worker_queues_block_the_producer() {
    const CAPACITY: usize = 2;
    let gate = Arc::new(Barrier::new(2));
    let harness = harness(
        Arc::new(GatedConnector { gate: gate.clone() }),
        without_dependencies(),
    );
    let log = harness.ctx.log.clone();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        let paused = log.captured_lines();
        gate.wait();
        paused
    });

    let report = run(
        DispatcherConfig {
            queue_capacity: CAPACITY,
            status_interval: Duration::from_millis(5),
            ..config(1)
        },
        &harness,
        operations(10, "read"),
        Vec::new(),
    );
    let paused: Vec<Value> = releaser
        .join()
        .unwrap()
        .iter()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .filter(|line| line["message"] == "status")
        .map(|line| line["fields"]["sample"].clone())
        .collect();

    assert!(!paused.is_empty());
    for sample in &paused {
        assert!(sample["backlog"].as_u64().unwrap() <= CAPACITY as u64);
        // One operation held by the worker plus a full queue.
        assert!(sample["dispatched"].as_u64().unwrap() <= CAPACITY as u64 + 1);
        assert_eq!(sample["executed"], 0);
        assert_eq!(sample["latency_queue"]["capacity"], 1_024);
        assert_eq!(sample["completion"]["seeded"], true);
        assert_eq!(sample["failure_reports"], 0);
    }
    assert_eq!(paused.last().unwrap()["dispatched"], CAPACITY as u64 + 1);
    assert_eq!(report.executed, 10);
    assert!(report.producer_blocked > 0);
}

#[test]
fn dropping_the_receiver_unblocks_the_sender() {
    let (sender, receiver) = worker_queue::<u64>(1, WorkerMetrics::default());
    sender.send(1).unwrap();
    let blocked = sender.clone();
    let producer = thread::spawn(move || blocked.send(2));
    thread::sleep(Duration::from_millis(20));
    drop(receiver);
    assert_eq!(producer.join().unwrap(), Err(WorkerSendError::Closed(2)));
    assert_eq!(sender.send(3), Err(WorkerSendError::Closed(3)));
}

#[test]
fn execution_errors_are_counted_without_failing_the_run() {
    let connector = Arc::new(DummyConnector::new(DummyConfig {
        failing_types: ["write".to_string()].into_iter().collect(),
        ..DummyConfig::default()
    }));
    let harness = harness(connector, without_dependencies());
    let ops: Vec<Operation> = (0..30)
        .map(|t| {
            let op_type = if t % 3 == 0 { "write" } else { "read" };
            Operation::new(op_type, t, Value::Null)
        })
        .collect();
    let report = run(config(2), &harness, ops, Vec::new());

    assert!(!report.is_failed());
    assert_eq!(report.executed, 30);
    assert_eq!(report.failed, 10);
    let snapshot = harness.pipeline.snapshot().unwrap();
    assert_eq!(snapshot.error_count, 10);
    assert_eq!(snapshot.total_count, 30);
}

#[test]
fn fatal_connector_errors_stop_further_execution() {
    let connector = Arc::new(JournalConnector {
        fail_at: Some(3),
        ..JournalConnector::default()
    });
    let attempts = connector.attempts.clone();
    let harness = harness(connector, without_dependencies());
    let report = run(config(1), &harness, operations(50, "read"), Vec::new());

    let failure = report.error_state.clone().expect("run should fail");
    assert_eq!(failure.kind, FailureKind::Resource);
    assert!(failure.message.contains("socket closed"));
    assert!(harness.failure.is_set());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(report.executed + report.skipped, report.dispatched);
    assert_eq!(report.executed, 4);
}

#[test]
fn dependent_operations_wait_for_their_dependency() {
    let connector = Arc::new(JournalConnector {
        slow_types: ["deposit".to_string()].into_iter().collect(),
        ..JournalConnector::default()
    });
    let journal = connector.journal.clone();
    let completion = Arc::new(CompletionTimeService::with_poll_interval(Duration::from_millis(1)));
    let writers = vec![
        completion.register_writer().unwrap(),
        completion.register_writer().unwrap(),
    ];
    completion.seed_all(9).unwrap();
    let harness = harness(connector, completion.clone());

    let ops = vec![
        Operation::new("deposit", 10, Value::Null),
        Operation::new("transfer", 11, Value::Null).with_dependency(10),
    ];
    let report = run(config(2), &harness, ops, writers);
    assert!(!report.is_failed(), "{:?}", report.error_state);
    assert_eq!(report.executed, 2);

    let journal = journal.lock().unwrap();
    let deposit_end = journal
        .iter()
        .position(|entry| entry == "end deposit@10")
        .unwrap();
    let transfer_start = journal
        .iter()
        .position(|entry| entry == "start transfer@11")
        .unwrap();
    assert!(deposit_end < transfer_start, "{journal:?}");
}

#[test]
fn run_for_drains_without_failing() {
    let connector = Arc::new(DummyConnector::new(DummyConfig::default()));
    let harness = harness(connector.clone(), without_dependencies());
    let far_future = system_clock().now_ms() + 60_000;
    let ops: Vec<Operation> = (0..5)
        .map(|i| Operation::new("read", far_future + i, Value::Null))
        .collect();
    let report = Dispatcher::new(config(1), harness.ctx.clone(), stream_from_vec(ops), Vec::new())
        .run_for(Duration::from_millis(50));

    assert!(report.drained);
    assert!(!report.is_failed());
    assert_eq!(report.executed, 0);
    assert_eq!(report.skipped, report.dispatched);
    assert_eq!(connector.executed(), 0);
}

#[test]
fn manual_clock_replays_a_long_schedule_instantly() {
    let clock = ManualTimeSource::new(1_000_000);
    let mut harness = harness(
        Arc::new(DummyConnector::new(DummyConfig::default())),
        without_dependencies(),
    );
    harness.ctx.clock = Arc::new(clock.clone());
    // Ten seconds of virtual schedule.
    let ops: Vec<Operation> = (0..10u64)
        .map(|i| Operation::new("read", 1_000_000 + i * 1_000, Value::Null))
        .collect();
    let report = run(config(1), &harness, ops, Vec::new());

    assert_eq!(report.executed, 10);
    assert!(clock.now_ms() >= 1_009_000);
    let snapshot = harness.pipeline.snapshot().unwrap();
    assert_eq!(snapshot.start_time_ms, Some(1_000_000));
    assert!(snapshot.finish_time_ms.unwrap() >= 1_009_000);
}

#[test]
fn throughput_estimator_smooths_rates() {
    let mut estimator = ThroughputEstimator::with_alpha(0.5);
    assert_eq!(estimator.record(0, 0), 0.0);
    assert_eq!(estimator.record(1_000, 100), 100.0);
    // 300 ops/s observed, blended half and half with the previous 100.
    assert_eq!(estimator.record(2_000, 400), 200.0);
    assert_eq!(estimator.sample_count(), 2);
}

#[test]
fn status_reporter_logs_until_stopped() {
    let log = DriverLog::capture("status-test");
    let mut reporter = StatusReporter::start(
        Duration::from_millis(5),
        Arc::new(|| StatusSample {
            executed: 7,
            ..StatusSample::default()
        }),
        log.clone(),
    );
    thread::sleep(Duration::from_millis(60));
    reporter.stop();
    let lines = log.captured_lines();
    assert!(!lines.is_empty());
    let first: Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["message"], "status");
    assert_eq!(first["fields"]["sample"]["executed"], 7);

    let count = log.captured_lines().len();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(log.captured_lines().len(), count);
}

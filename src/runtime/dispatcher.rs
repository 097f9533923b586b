//! Time-compressed dispatcher: feeds the merged operation stream round-robin
//! into bounded per-worker queues and runs each operation at its scheduled
//! wall-clock time.
//!
//! Workers advance their completion-time writer on the original timeline:
//! on pop they certify everything strictly before the popped operation,
//! after execution they certify the operation itself, and while idle they
//! certify everything before the dispatch frontier. A worker that retires
//! stops holding the watermark back.

use super::status::{StatusReporter, StatusSample, StatusSource};
use super::threading::{
    worker_queue, PoolTotals, WorkerMetrics, WorkerPoll, WorkerReceiver, WorkerSender,
};
use crate::clock::{duration_ns, SharedTimeSource};
use crate::connector::{DbConnector, DbSession};
use crate::coordination::{
    CompletionTimeService, CoordinationError, FailureCell, FailureKind, FailureRecord, WriterHandle,
};
use crate::metrics::{LatencyPipeline, LatencyRecord};
use crate::observability::{DriverLog, LogLevel};
use crate::workload::{Operation, OperationStream, StreamError};
use serde::Serialize;
use serde_json::json;
use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
pub const DEFAULT_SPINNER_SLEEP: Duration = Duration::from_millis(100);
pub const DEFAULT_DEPENDENCY_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_POLL_CEILING: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Zero disables the status reporter.
    pub status_interval: Duration,
    pub ignore_scheduled_start_times: bool,
    /// Upper bound of a single sleep while waiting for a scheduled time.
    pub spinner_sleep: Duration,
    pub dependency_wait_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            status_interval: Duration::ZERO,
            ignore_scheduled_start_times: false,
            spinner_sleep: DEFAULT_SPINNER_SLEEP,
            dependency_wait_timeout: DEFAULT_DEPENDENCY_WAIT_TIMEOUT,
        }
    }
}

/// Shared collaborators of one run phase.
#[derive(Clone)]
pub struct RunContext {
    pub failure: Arc<FailureCell>,
    pub completion: Arc<CompletionTimeService>,
    pub pipeline: Arc<LatencyPipeline>,
    pub connector: Arc<dyn DbConnector>,
    pub clock: SharedTimeSource,
    pub log: DriverLog,
}

/// Summary of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub dispatched: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub producer_blocked: u64,
    pub drained: bool,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub error_state: Option<FailureRecord>,
}

impl DispatchReport {
    pub fn is_failed(&self) -> bool {
        self.error_state.is_some()
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    ctx: RunContext,
    stream: OperationStream,
    writers: Vec<WriterHandle>,
}

impl Dispatcher {
    /// `writers` is either empty (no dependency tracking) or holds one
    /// handle per worker.
    pub fn new(
        config: DispatcherConfig,
        ctx: RunContext,
        stream: OperationStream,
        writers: Vec<WriterHandle>,
    ) -> Self {
        Self {
            config,
            ctx,
            stream,
            writers,
        }
    }

    /// Dispatches the whole stream and blocks until every worker finished.
    pub fn run(self) -> DispatchReport {
        self.run_inner(None)
    }

    /// Like [`Dispatcher::run`], but requests a graceful drain once
    /// `timeout` elapses.
    pub fn run_for(self, timeout: Duration) -> DispatchReport {
        self.run_inner(Some(timeout))
    }

    fn run_inner(self, timeout: Option<Duration>) -> DispatchReport {
        let Dispatcher {
            config,
            ctx,
            stream,
            writers,
        } = self;
        let log = ctx.log.for_module("dispatcher");
        let started_at_ms = ctx.clock.now_ms();
        let worker_count = config.worker_count.max(1);
        let frontier = Arc::new(AtomicU64::new(0));
        let mut deadline = timeout.map(|timeout| DeadlineTimer::start(timeout, ctx.failure.clone()));

        let mut senders = Vec::with_capacity(worker_count);
        let mut metrics = Vec::with_capacity(worker_count);
        let mut joins: Vec<(usize, JoinHandle<()>)> = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let session = match ctx.connector.open_session(index) {
                Ok(session) => session,
                Err(err) => {
                    ctx.failure.report(
                        FailureKind::Resource,
                        format!("worker-{index}"),
                        format!("failed to open session: {err}"),
                    );
                    break;
                }
            };
            let worker_metrics = WorkerMetrics::default();
            let (sender, receiver) = worker_queue(config.queue_capacity, worker_metrics.clone());
            let worker = Worker {
                index,
                receiver,
                session,
                writer: writers.get(index).copied(),
                metrics: worker_metrics.clone(),
                frontier: frontier.clone(),
                config: config.clone(),
                ctx: ctx.clone(),
            };
            match thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker.run())
            {
                Ok(join) => joins.push((index, join)),
                Err(err) => {
                    ctx.failure.report(
                        FailureKind::Internal,
                        format!("worker-{index}"),
                        format!("failed to spawn worker: {err}"),
                    );
                    break;
                }
            }
            senders.push(sender);
            metrics.push(worker_metrics);
        }

        let dispatched = Arc::new(AtomicU64::new(0));
        let mut reporter = StatusReporter::start(
            config.status_interval,
            status_source(&senders, &metrics, &dispatched, &ctx),
            log.clone(),
        );

        if !ctx.failure.should_stop() {
            feed(stream, &senders, &frontier, &dispatched, &ctx.failure, &log);
        }
        for sender in &senders {
            sender.signal_shutdown();
        }
        for (index, join) in joins {
            if join.join().is_err() {
                ctx.failure.report(
                    FailureKind::Internal,
                    format!("worker-{index}"),
                    "worker thread panicked",
                );
            }
        }
        reporter.stop();
        if let Some(timer) = deadline.as_mut() {
            timer.cancel();
        }

        let totals = PoolTotals::collect(&metrics);
        let report = DispatchReport {
            dispatched: dispatched.load(Ordering::Relaxed),
            executed: totals.executed,
            failed: totals.failed,
            skipped: totals.skipped,
            producer_blocked: totals.producer_blocked,
            drained: ctx.failure.drain_requested(),
            started_at_ms,
            finished_at_ms: ctx.clock.now_ms(),
            error_state: ctx.failure.first(),
        };
        log.event(
            if report.is_failed() {
                LogLevel::Error
            } else {
                LogLevel::Info
            },
            "dispatch finished",
            json!(report),
        );
        report
    }
}

fn feed(
    stream: OperationStream,
    senders: &[WorkerSender<Operation>],
    frontier: &AtomicU64,
    dispatched: &AtomicU64,
    failure: &FailureCell,
    log: &DriverLog,
) {
    if senders.is_empty() {
        return;
    }
    let mut next = 0usize;
    for item in stream {
        if failure.should_stop() {
            break;
        }
        let operation = match item {
            Ok(operation) => operation,
            Err(err) => {
                let kind = match err {
                    StreamError::Source(_) => FailureKind::Resource,
                    _ => FailureKind::Coordination,
                };
                failure.report(kind, "operation_stream", err.to_string());
                log.error(&format!("operation stream failed: {err}"));
                break;
            }
        };
        // Published before the push so idle workers never certify past an
        // operation still on its way to them.
        frontier.fetch_max(operation.original_ms(), Ordering::SeqCst);
        if senders[next].send(operation).is_err() {
            break;
        }
        dispatched.fetch_add(1, Ordering::Relaxed);
        next = (next + 1) % senders.len();
    }
}

fn status_source(
    senders: &[WorkerSender<Operation>],
    metrics: &[WorkerMetrics],
    dispatched: &Arc<AtomicU64>,
    ctx: &RunContext,
) -> StatusSource {
    let senders = senders.to_vec();
    let metrics = metrics.to_vec();
    let dispatched = dispatched.clone();
    let pipeline = ctx.pipeline.clone();
    let completion = ctx.completion.clone();
    let failure = ctx.failure.clone();
    Arc::new(move || {
        let totals = PoolTotals::collect(&metrics);
        StatusSample {
            dispatched: dispatched.load(Ordering::Relaxed),
            executed: totals.executed,
            failed: totals.failed,
            skipped: totals.skipped,
            backlog: senders.iter().map(WorkerSender::len).sum(),
            recorded: pipeline.submitted(),
            latency_queue: pipeline.queue_telemetry(),
            completion: completion.snapshot(),
            failure_reports: failure.report_count(),
        }
    })
}

enum Step {
    Continue,
    Skip,
}

struct Worker {
    index: usize,
    receiver: WorkerReceiver<Operation>,
    session: Box<dyn DbSession>,
    writer: Option<WriterHandle>,
    metrics: WorkerMetrics,
    frontier: Arc<AtomicU64>,
    config: DispatcherConfig,
    ctx: RunContext,
}

impl Worker {
    fn run(mut self) {
        let idle_poll = cmp::min(self.config.spinner_sleep, IDLE_POLL_CEILING).max(Duration::from_millis(1));
        loop {
            match self.receiver.recv_timeout(idle_poll) {
                WorkerPoll::Work(operation) => self.handle(operation),
                WorkerPoll::Idle => self.certify_idle(),
                WorkerPoll::Shutdown => break,
            }
        }
        if let Some(writer) = self.writer {
            if let Err(err) = self.ctx.completion.retire(&writer) {
                if !matches!(err, CoordinationError::ShutDown) {
                    self.fail_coordination(err);
                }
            }
        }
        if let Err(err) = self.session.cleanup() {
            self.ctx
                .log
                .warn(&format!("worker-{} session cleanup failed: {err}", self.index));
        }
    }

    fn source(&self) -> String {
        format!("worker-{}", self.index)
    }

    fn fail_coordination(&self, err: CoordinationError) {
        self.ctx
            .failure
            .report(FailureKind::Coordination, self.source(), err.to_string());
    }

    fn certify_idle(&self) {
        let Some(writer) = self.writer else {
            return;
        };
        let frontier = self.frontier.load(Ordering::SeqCst);
        if frontier == 0 || !self.receiver.is_empty() {
            return;
        }
        if let Err(err) = self.ctx.completion.advance_idle(&writer, frontier - 1) {
            self.fail_coordination(err);
        }
    }

    fn handle(&mut self, operation: Operation) {
        let original = operation.original_ms();
        if let Some(writer) = self.writer {
            let begun = self
                .ctx
                .completion
                .submit_initiated(&writer, original)
                .and_then(|_| match original.checked_sub(1) {
                    Some(before) => self.ctx.completion.certify_up_to(&writer, before),
                    None => Ok(()),
                });
            if let Err(err) = begun {
                self.fail_coordination(err);
            }
        }

        let step = match self.wait_for_start(&operation) {
            Step::Continue => self.wait_for_dependency(&operation),
            Step::Skip => Step::Skip,
        };
        match step {
            Step::Continue if !self.ctx.failure.should_stop() => self.execute(&operation),
            _ => self.metrics.record_skipped(),
        }

        if let Some(writer) = self.writer {
            if let Err(err) = self.ctx.completion.submit_completed(&writer, original) {
                if !self.ctx.failure.is_set() {
                    self.fail_coordination(err);
                }
            }
        }
    }

    fn wait_for_start(&self, operation: &Operation) -> Step {
        if self.config.ignore_scheduled_start_times {
            return Step::Continue;
        }
        let scheduled = operation.scheduled_ms();
        loop {
            if self.ctx.failure.should_stop() {
                return Step::Skip;
            }
            let now = self.ctx.clock.now_ms();
            if now >= scheduled {
                return Step::Continue;
            }
            let remaining = Duration::from_millis(scheduled - now);
            self.ctx
                .clock
                .sleep(cmp::min(remaining, self.config.spinner_sleep));
        }
    }

    fn wait_for_dependency(&self, operation: &Operation) -> Step {
        let Some(dependency) = operation.dependency_ms() else {
            return Step::Continue;
        };
        if self.ctx.failure.should_stop() {
            return Step::Skip;
        }
        match self.ctx.completion.await_watermark(
            dependency,
            self.config.dependency_wait_timeout,
            &self.ctx.failure,
        ) {
            Ok(true) => Step::Continue,
            Ok(false) => {
                self.fail_coordination(CoordinationError::WaitTimeout {
                    target: dependency,
                    current: self.ctx.completion.watermark(),
                    timeout_ms: self.config.dependency_wait_timeout.as_millis() as u64,
                });
                Step::Skip
            }
            Err(CoordinationError::Aborted { .. }) => Step::Skip,
            Err(err) => {
                self.fail_coordination(err);
                Step::Skip
            }
        }
    }

    fn execute(&mut self, operation: &Operation) {
        let actual_ms = self.ctx.clock.now_ms();
        let started = Instant::now();
        let result = self.session.execute(operation);
        let duration = duration_ns(started.elapsed());
        self.metrics.record_executed();
        let outcome = match result {
            Ok(outcome) => outcome.code,
            Err(err) if err.is_fatal() => {
                self.ctx
                    .failure
                    .report(FailureKind::Resource, self.source(), err.to_string());
                return;
            }
            Err(err) => {
                self.metrics.record_failed();
                self.ctx.log.event(
                    LogLevel::Debug,
                    "operation failed",
                    json!({ "worker": self.index, "error": err.to_string() }),
                );
                err.result_code()
            }
        };
        let record = LatencyRecord::new(
            operation.op_type().clone(),
            operation.scheduled_ms(),
            actual_ms,
            duration,
            outcome,
        );
        if let Err(err) = self.ctx.pipeline.record(record) {
            self.ctx
                .failure
                .report(FailureKind::Internal, self.source(), err.to_string());
        }
    }
}

/// Requests a graceful drain once the timeout elapses unless cancelled.
struct DeadlineTimer {
    state: Arc<(Mutex<bool>, Condvar)>,
    join: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    fn start(timeout: Duration, failure: Arc<FailureCell>) -> Self {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_state = state.clone();
        let join = thread::Builder::new()
            .name("dispatch-deadline".to_string())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                let (lock, cv) = &*thread_state;
                let mut cancelled = lock.lock().unwrap();
                while !*cancelled {
                    let now = Instant::now();
                    if now >= deadline {
                        failure.request_drain();
                        return;
                    }
                    let (guard, _) = cv.wait_timeout(cancelled, deadline - now).unwrap();
                    cancelled = guard;
                }
            })
            .ok();
        Self { state, join }
    }

    fn cancel(&mut self) {
        {
            let (lock, cv) = &*self.state;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

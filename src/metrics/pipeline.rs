//! Latency recording: workers push records into a lock-free queue and a
//! single aggregator thread folds them into per-type histograms and the
//! results log.

use super::histogram::{Histogram, HistogramSummary};
use super::results_log::{ResultsLogError, ResultsLogSink};
use super::LatencyRecord;
use crate::clock::duration_ms;
use crate::coordination::{FailureCell, FailureKind};
use crate::observability::{DriverLog, LogLevel};
use crate::runtime::backpressure::{BackpressureQueue, QueueDepthTelemetry};
use crate::workload::OperationType;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const AGGREGATOR_IDLE_SLEEP: Duration = Duration::from_millis(1);
const AGGREGATOR_BATCH: usize = 1_024;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("latency pipeline is closed")]
    Closed,
    #[error("latency aggregator thread panicked")]
    AggregatorPanicked,
    #[error("results log failed: {0}")]
    ResultsLog(String),
}

#[derive(Debug, Clone)]
enum AggregatorOutcome {
    Finished,
    LogFailed(String),
    Panicked,
}

#[derive(Debug, Default)]
struct TypeAggregate {
    latency_us: Histogram,
    errors: u64,
}

#[derive(Debug, Default)]
struct AggregateState {
    per_type: BTreeMap<OperationType, TypeAggregate>,
    first_start_ms: Option<u64>,
    last_finish_ms: Option<u64>,
    total: u64,
    errors: u64,
}

impl AggregateState {
    fn fold(&mut self, record: &LatencyRecord) {
        let entry = self.per_type.entry(record.op_type.clone()).or_default();
        entry.latency_us.record(record.duration_ns / 1_000);
        if record.outcome != 0 {
            entry.errors += 1;
            self.errors += 1;
        }
        self.total += 1;
        let finish = record
            .actual_ms
            .saturating_add(duration_ms(Duration::from_nanos(record.duration_ns)));
        self.first_start_ms = Some(
            self.first_start_ms
                .map_or(record.actual_ms, |start| start.min(record.actual_ms)),
        );
        self.last_finish_ms = Some(self.last_finish_ms.map_or(finish, |last| last.max(finish)));
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let start = self.first_start_ms.unwrap_or(0);
        let finish = self.last_finish_ms.unwrap_or(start);
        let elapsed_ms = finish.saturating_sub(start);
        let throughput = if elapsed_ms == 0 {
            0.0
        } else {
            self.total as f64 * 1_000.0 / elapsed_ms as f64
        };
        MetricsSnapshot {
            start_time_ms: self.first_start_ms,
            finish_time_ms: self.last_finish_ms,
            total_count: self.total,
            error_count: self.errors,
            throughput_ops_per_sec: throughput,
            operations: self
                .per_type
                .iter()
                .map(|(op_type, aggregate)| OperationMetrics {
                    name: op_type.clone(),
                    count: aggregate.latency_us.count(),
                    error_count: aggregate.errors,
                    latency_us: aggregate.latency_us.summary(),
                })
                .collect(),
        }
    }
}

/// Per-type results of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub name: OperationType,
    pub count: u64,
    pub error_count: u64,
    pub latency_us: HistogramSummary,
}

/// Consistent view of everything the aggregator folded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub start_time_ms: Option<u64>,
    pub finish_time_ms: Option<u64>,
    pub total_count: u64,
    pub error_count: u64,
    pub throughput_ops_per_sec: f64,
    pub operations: Vec<OperationMetrics>,
}

impl MetricsSnapshot {
    pub fn count_for(&self, op_type: &OperationType) -> u64 {
        self.operations
            .iter()
            .find(|metrics| &metrics.name == op_type)
            .map_or(0, |metrics| metrics.count)
    }

    pub fn per_type_counts(&self) -> BTreeMap<OperationType, u64> {
        self.operations
            .iter()
            .map(|metrics| (metrics.name.clone(), metrics.count))
            .collect()
    }
}

type AggregatorJoin = JoinHandle<Result<(), ResultsLogError>>;

/// Bounded MPSC latency pipeline with one aggregator thread.
pub struct LatencyPipeline {
    queue: BackpressureQueue<LatencyRecord>,
    state: Arc<Mutex<AggregateState>>,
    stop: Arc<AtomicBool>,
    submitted: Arc<AtomicU64>,
    results_log: Option<PathBuf>,
    join: Mutex<Option<AggregatorJoin>>,
    outcome: Mutex<Option<AggregatorOutcome>>,
}

impl LatencyPipeline {
    /// Starts the aggregator. Results-log write failures are reported to
    /// `failure` as resource failures.
    pub fn start(
        sink: ResultsLogSink,
        capacity: usize,
        failure: Arc<FailureCell>,
        log: DriverLog,
    ) -> Self {
        let queue = BackpressureQueue::new(capacity.max(1));
        let state = Arc::new(Mutex::new(AggregateState::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let results_log = sink.path().map(PathBuf::from);
        let join = spawn_aggregator(
            queue.clone(),
            state.clone(),
            stop.clone(),
            sink,
            failure,
            log,
        );
        Self {
            queue,
            state,
            stop,
            submitted: Arc::new(AtomicU64::new(0)),
            results_log,
            join: Mutex::new(join),
            outcome: Mutex::new(None),
        }
    }

    /// Records one executed operation. Safe to call from any worker.
    pub fn record(&self, record: LatencyRecord) -> Result<(), PipelineError> {
        self.queue
            .enqueue_with_backoff(record)
            .map_err(|_| PipelineError::Closed)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records accepted so far, including ones not yet aggregated.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn queue_telemetry(&self) -> QueueDepthTelemetry {
        self.queue.telemetry()
    }

    pub fn results_log_path(&self) -> Option<&PathBuf> {
        self.results_log.as_ref()
    }

    /// Stops intake, waits for the aggregator to drain and returns the
    /// final view. Further calls return the same data.
    pub fn snapshot(&self) -> Result<MetricsSnapshot, PipelineError> {
        self.shutdown()?;
        Ok(self.state.lock().unwrap().snapshot())
    }

    /// Whatever has been folded so far, without stopping intake.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.lock().unwrap().snapshot()
    }

    /// Stops the aggregator and finalizes the results log. Idempotent.
    pub fn shutdown(&self) -> Result<(), PipelineError> {
        self.queue.close();
        self.stop.store(true, Ordering::Release);
        let join = self.join.lock().unwrap().take();
        let mut outcome = self.outcome.lock().unwrap();
        if let Some(join) = join {
            *outcome = Some(match join.join() {
                Ok(Ok(())) => AggregatorOutcome::Finished,
                Ok(Err(err)) => AggregatorOutcome::LogFailed(err.to_string()),
                Err(_) => AggregatorOutcome::Panicked,
            });
        }
        match outcome.as_ref() {
            None | Some(AggregatorOutcome::Finished) => Ok(()),
            Some(AggregatorOutcome::LogFailed(message)) => {
                Err(PipelineError::ResultsLog(message.clone()))
            }
            Some(AggregatorOutcome::Panicked) => Err(PipelineError::AggregatorPanicked),
        }
    }
}

impl Drop for LatencyPipeline {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn spawn_aggregator(
    queue: BackpressureQueue<LatencyRecord>,
    state: Arc<Mutex<AggregateState>>,
    stop: Arc<AtomicBool>,
    mut sink: ResultsLogSink,
    failure: Arc<FailureCell>,
    log: DriverLog,
) -> Option<AggregatorJoin> {
    let thread_failure = failure.clone();
    let spawned = thread::Builder::new()
        .name("latency-aggregator".to_string())
        .spawn(move || {
            let mut batch = Vec::with_capacity(AGGREGATOR_BATCH);
            let mut write_error: Option<ResultsLogError> = None;
            loop {
                // Read the stop flag before draining so records enqueued
                // before the stop are never left behind.
                let stopping = stop.load(Ordering::Acquire);
                while batch.len() < AGGREGATOR_BATCH {
                    match queue.try_dequeue() {
                        Some(record) => batch.push(record),
                        None => break,
                    }
                }
                if batch.is_empty() {
                    if stopping {
                        break;
                    }
                    thread::sleep(AGGREGATOR_IDLE_SLEEP);
                    continue;
                }
                {
                    let mut guard = state.lock().unwrap();
                    for record in &batch {
                        guard.fold(record);
                    }
                }
                if write_error.is_none() {
                    for record in &batch {
                        if let Err(err) = sink.write(record) {
                            thread_failure.report(
                                FailureKind::Resource,
                                "results_log",
                                err.to_string(),
                            );
                            log.event(
                                LogLevel::Error,
                                "results log write failed",
                                json!({ "error": err.to_string() }),
                            );
                            write_error = Some(err);
                            break;
                        }
                    }
                }
                batch.clear();
            }
            match write_error {
                Some(err) => Err(err),
                None => sink.finish(),
            }
        });
    match spawned {
        Ok(join) => Some(join),
        Err(err) => {
            failure.report(
                FailureKind::Internal,
                "latency_aggregator",
                format!("failed to spawn aggregator: {err}"),
            );
            None
        }
    }
}

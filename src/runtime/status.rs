use super::backpressure::QueueDepthTelemetry;
use crate::coordination::CompletionTimeSnapshot;
use crate::observability::{DriverLog, LogLevel};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEFAULT_ALPHA: f64 = 0.2;
const MS_PER_SECOND: f64 = 1_000.0;

/// EWMA throughput estimator fed with cumulative operation counts.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    alpha: f64,
    ewma_rate_per_sec: f64,
    last_tick_ms: Option<u64>,
    last_count: u64,
    sample_count: u64,
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::with_alpha(DEFAULT_ALPHA)
    }
}

impl ThroughputEstimator {
    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            alpha,
            ewma_rate_per_sec: 0.0,
            last_tick_ms: None,
            last_count: 0,
            sample_count: 0,
        }
    }

    /// Folds the cumulative `count` observed at `tick_ms`; returns the EWMA.
    pub fn record(&mut self, tick_ms: u64, count: u64) -> f64 {
        if let Some(last_tick) = self.last_tick_ms {
            let delta_ms = tick_ms.saturating_sub(last_tick).max(1);
            let delta = count.saturating_sub(self.last_count);
            let ops_per_sec = delta as f64 * MS_PER_SECOND / delta_ms as f64;
            self.ewma_rate_per_sec = if self.sample_count == 0 {
                ops_per_sec
            } else {
                self.alpha * ops_per_sec + (1.0 - self.alpha) * self.ewma_rate_per_sec
            };
            self.sample_count += 1;
        }
        self.last_tick_ms = Some(tick_ms);
        self.last_count = count;
        self.ewma_rate_per_sec
    }

    pub fn ewma_rate_per_sec(&self) -> f64 {
        self.ewma_rate_per_sec
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

/// Progress figures sampled by the reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSample {
    pub dispatched: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub backlog: usize,
    pub recorded: u64,
    pub latency_queue: QueueDepthTelemetry,
    pub completion: CompletionTimeSnapshot,
    /// Fatal reports so far, including ones after the first.
    pub failure_reports: u64,
}

pub type StatusSource = Arc<dyn Fn() -> StatusSample + Send + Sync>;

/// Background thread that logs a status line at a fixed interval.
pub struct StatusReporter {
    stop: Arc<(Mutex<bool>, Condvar)>,
    join: Option<JoinHandle<()>>,
}

impl StatusReporter {
    /// Starts reporting; a zero interval disables the reporter.
    pub fn start(interval: Duration, source: StatusSource, log: DriverLog) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        if interval.is_zero() {
            return Self { stop, join: None };
        }
        let thread_stop = stop.clone();
        let thread_log = log.clone();
        let join = thread::Builder::new()
            .name("status-reporter".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut estimator = ThroughputEstimator::default();
                let (lock, cv) = &*thread_stop;
                let mut stopped = lock.lock().unwrap();
                loop {
                    let (guard, _) = cv.wait_timeout(stopped, interval).unwrap();
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    let sample = source();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let rate = estimator.record(elapsed_ms, sample.executed);
                    thread_log.event(
                        LogLevel::Info,
                        "status",
                        json!({
                            "elapsed_ms": elapsed_ms,
                            "ops_per_sec": rate,
                            "sample": sample,
                        }),
                    );
                }
            });
        match join {
            Ok(join) => Self {
                stop,
                join: Some(join),
            },
            Err(err) => {
                log.warn(&format!("status reporter disabled: {err}"));
                Self { stop, join: None }
            }
        }
    }

    pub fn stop(&mut self) {
        {
            let (lock, cv) = &*self.stop;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

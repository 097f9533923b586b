use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const LATENCY_QUEUE_CAPACITY: usize = 65_536;
/// Pause between enqueue retries once the queue is saturated.
pub const SATURATED_BACKOFF: Duration = Duration::from_micros(50);
const SPIN_ATTEMPTS: u32 = 16;

#[derive(Debug, Default)]
struct QueueCounters {
    saturations: AtomicU64,
    high_water: AtomicU64,
}

/// Lock-free bounded MPSC buffer between hot-path producers and a single
/// consumer thread.
#[derive(Debug, Clone)]
pub struct BackpressureQueue<T> {
    queue: Arc<ArrayQueue<T>>,
    closed: Arc<AtomicBool>,
    counters: Arc<QueueCounters>,
    capacity: usize,
}

impl<T> BackpressureQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "backpressure queue capacity must be > 0");
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(QueueCounters::default()),
            capacity,
        }
    }

    /// Attempts to enqueue an item, returning a backpressure error when saturated.
    pub fn enqueue(&self, item: T) -> Result<(), BackpressureError<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackpressureError::Closed(item));
        }
        match self.queue.push(item) {
            Ok(()) => {
                self.counters
                    .high_water
                    .fetch_max(self.queue.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(item) => Err(BackpressureError::Saturated(item)),
        }
    }

    /// Enqueues, spinning briefly and then backing off while the consumer
    /// catches up. Fails only once the queue is closed.
    pub fn enqueue_with_backoff(&self, item: T) -> Result<(), BackpressureError<T>> {
        let mut item = item;
        let mut attempts = 0u32;
        loop {
            match self.enqueue(item) {
                Ok(()) => return Ok(()),
                Err(BackpressureError::Saturated(rejected)) => {
                    if attempts == 0 {
                        self.counters.saturations.fetch_add(1, Ordering::Relaxed);
                    }
                    item = rejected;
                    attempts = attempts.saturating_add(1);
                    if attempts < SPIN_ATTEMPTS {
                        thread::yield_now();
                    } else {
                        thread::sleep(SATURATED_BACKOFF);
                    }
                }
                Err(closed) => return Err(closed),
            }
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Rejects further producers; queued items can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn telemetry(&self) -> QueueDepthTelemetry {
        QueueDepthTelemetry {
            depth: self.queue.len(),
            capacity: self.capacity,
            high_water: self.counters.high_water.load(Ordering::Relaxed) as usize,
            saturations: self.counters.saturations.load(Ordering::Relaxed),
        }
    }
}

/// Error returned when pushing onto a saturated or closed queue; the item
/// is handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackpressureError<T> {
    Saturated(T),
    Closed(T),
}

impl<T> BackpressureError<T> {
    pub fn into_inner(self) -> T {
        match self {
            BackpressureError::Saturated(item) | BackpressureError::Closed(item) => item,
        }
    }
}

/// Depth snapshot reported by the status reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepthTelemetry {
    pub depth: usize,
    pub capacity: usize,
    pub high_water: usize,
    pub saturations: u64,
}

impl QueueDepthTelemetry {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.depth as f64 / self.capacity as f64).clamp(0.0, 1.0)
    }
}

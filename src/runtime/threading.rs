use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Signals stored in the queue shared between the dispatcher and one worker.
#[derive(Debug)]
pub enum WorkerSignal<T> {
    Work(T),
    Shutdown,
}

/// What a worker observed when polling its queue.
#[derive(Debug)]
pub enum WorkerPoll<T> {
    Work(T),
    Shutdown,
    /// Nothing arrived within the poll timeout.
    Idle,
}

struct QueueState<T> {
    buffer: VecDeque<WorkerSignal<T>>,
    closed: bool,
}

/// Bounded blocking queue backing one worker.
struct WorkerQueueShared<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> WorkerQueueShared<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }
}

/// Error returned when enqueuing onto a closed queue; the command is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerSendError<T> {
    Closed(T),
}

pub struct WorkerSender<T> {
    shared: Arc<WorkerQueueShared<T>>,
    metrics: WorkerMetrics,
}

impl<T> Clone for WorkerSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> WorkerSender<T> {
    /// Enqueues a command, blocking while the queue is at capacity.
    pub fn send(&self, command: T) -> Result<(), WorkerSendError<T>> {
        let mut guard = self.shared.state.lock().unwrap();
        let mut blocked = false;
        while !guard.closed && guard.buffer.len() >= self.shared.capacity {
            blocked = true;
            guard = self.shared.not_full.wait(guard).unwrap();
        }
        if guard.closed {
            return Err(WorkerSendError::Closed(command));
        }
        if blocked {
            self.metrics.producer_blocked.fetch_add(1, Ordering::Relaxed);
        }
        guard.buffer.push_back(WorkerSignal::Work(command));
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues a shutdown marker behind any queued work.
    pub fn signal_shutdown(&self) {
        let mut guard = self.shared.state.lock().unwrap();
        if guard.closed {
            return;
        }
        guard.buffer.push_back(WorkerSignal::Shutdown);
        self.shared.not_empty.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

pub struct WorkerReceiver<T> {
    shared: Arc<WorkerQueueShared<T>>,
}

impl<T> WorkerReceiver<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> WorkerPoll<T> {
        let mut guard = self.shared.state.lock().unwrap();
        loop {
            if let Some(signal) = guard.buffer.pop_front() {
                self.shared.not_full.notify_one();
                return match signal {
                    WorkerSignal::Work(command) => WorkerPoll::Work(command),
                    WorkerSignal::Shutdown => WorkerPoll::Shutdown,
                };
            }
            let (next_guard, wait) = self.shared.not_empty.wait_timeout(guard, timeout).unwrap();
            guard = next_guard;
            if wait.timed_out() && guard.buffer.is_empty() {
                return WorkerPoll::Idle;
            }
        }
    }

    /// True when no work is queued. Checked under the queue lock.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().unwrap().buffer.is_empty()
    }
}

// A worker that exits early, even by panicking, must not leave the
// dispatcher blocked on its full queue.
impl<T> Drop for WorkerReceiver<T> {
    fn drop(&mut self) {
        let mut guard = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.closed = true;
        guard.buffer.clear();
        self.shared.not_full.notify_all();
    }
}

/// Creates the bounded queue feeding one worker.
pub fn worker_queue<T>(capacity: usize, metrics: WorkerMetrics) -> (WorkerSender<T>, WorkerReceiver<T>) {
    let shared = Arc::new(WorkerQueueShared::new(capacity.max(1)));
    (
        WorkerSender {
            shared: shared.clone(),
            metrics,
        },
        WorkerReceiver { shared },
    )
}

/// Counters exported for each worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    executed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    producer_blocked: Arc<AtomicU64>,
}

impl WorkerMetrics {
    pub fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Operations handed to the connector, including failed ones.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Operations the connector answered with a non-fatal error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Operations dropped during a drain or after a fatal failure.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Times the dispatcher found this worker's queue full.
    pub fn producer_blocked(&self) -> u64 {
        self.producer_blocked.load(Ordering::Relaxed)
    }
}

/// Sum of every worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolTotals {
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub producer_blocked: u64,
}

impl PoolTotals {
    pub fn collect<'a>(metrics: impl IntoIterator<Item = &'a WorkerMetrics>) -> Self {
        metrics
            .into_iter()
            .fold(PoolTotals::default(), |acc, metrics| PoolTotals {
                executed: acc.executed + metrics.executed(),
                failed: acc.failed + metrics.failed(),
                skipped: acc.skipped + metrics.skipped(),
                producer_blocked: acc.producer_blocked + metrics.producer_blocked(),
            })
    }
}

//! Threaded execution runtime: bounded worker queues, the lock-free latency
//! buffer, the dispatcher and its status reporter.

pub mod backpressure;
pub mod dispatcher;
pub mod status;
pub mod threading;

pub use backpressure::{
    BackpressureError, BackpressureQueue, QueueDepthTelemetry, LATENCY_QUEUE_CAPACITY,
};
pub use dispatcher::{
    DispatchReport, Dispatcher, DispatcherConfig, RunContext, DEFAULT_DEPENDENCY_WAIT_TIMEOUT,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SPINNER_SLEEP,
};
pub use status::{StatusReporter, StatusSample, StatusSource, ThroughputEstimator};
pub use threading::{
    worker_queue, PoolTotals, WorkerMetrics, WorkerPoll, WorkerReceiver, WorkerSendError,
    WorkerSender, WorkerSignal,
};

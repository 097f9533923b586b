//! Benchmark driver that replays time-stamped financial workloads against a
//! database connector under a compressed schedule and audits how late each
//! operation started.

pub mod app;
pub mod clock;
pub mod config;
pub mod connector;
pub mod coordination;
pub mod driver;
pub mod metrics;
pub mod observability;
pub mod runtime;
pub mod tuning;
pub mod validation;
pub mod workload;

pub use clock::{
    duration_ms, duration_ns, system_clock, ManualTimeSource, SharedTimeSource, SystemTimeSource,
    TimeSource,
};
pub use config::{ComponentSpec, ConfigError, DriverConfig, DriverMode, TuningConfig};
pub use connector::{
    ConnectorError, ConnectorFactory, ConnectorRegistry, DbConnector, DbSession, DummyConfig,
    DummyConnector, OperationOutcome, DUMMY_CONNECTOR, RESULT_CODE_EXECUTION_ERROR,
    RESULT_CODE_OK, RESULT_CODE_UNSUPPORTED,
};
pub use coordination::{
    CompletionTimeService, CompletionTimeSnapshot, CoordinationError, FailureCell, FailureKind,
    FailureRecord, ProgressKind, WriterHandle, WriterId, MAX_TIME_MS, NEARLY_MAX_TIME_MS,
};
pub use driver::{
    run_once, tune, Driver, DriverError, PhaseOutcome, ResultsAudit, ResultsDir, RunOutcome,
    RunPhase, WATERMARK_INIT_TIMEOUT,
};
pub use metrics::{
    read_results_log, results_log_rows, CsvResultsLog, Histogram, HistogramSummary,
    LatencyPipeline, LatencyRecord, MetricsSnapshot, OperationMetrics, PipelineError,
    ResultsLogError, ResultsLogRows, ResultsLogSink, RESULTS_LOG_HEADER, RESULTS_LOG_SEPARATOR,
};
pub use observability::{
    DriverLog, JsonLineLogger, LogFile, LogLevel, LogRecord, LogRotationPolicy, LogSink,
    LoggingError,
};
pub use runtime::{
    worker_queue, BackpressureError, BackpressureQueue, DispatchReport,
    Dispatcher, DispatcherConfig, PoolTotals, QueueDepthTelemetry, RunContext, StatusReporter,
    StatusSample, StatusSource, ThroughputEstimator, WorkerMetrics, WorkerPoll, WorkerReceiver,
    WorkerSendError, WorkerSender, WorkerSignal, LATENCY_QUEUE_CAPACITY,
};
pub use tuning::{
    AutoTuner, ProbeOutcome, ProbeRecord, ThroughputProbe, TuningError, TuningPhase, TuningReport,
    TuningState,
};
pub use validation::{
    compute_summary, compute_summary_from_log, read_validation_cases, validate,
    write_validation_cases, CrashedOperation, DbValidationReport, DbValidator, DelayStats,
    DelaySummary, IncorrectResult, OperationCounts, TolerancePolicy, ToleranceViolation,
    ValidationCase, ValidationError, ValidationParamsCreator, ValidationParamsReport,
    ValidationPolicy, ValidationResult,
};
pub use workload::{
    prepare_schedule, stream_from_vec, MergedStream, Operation, OperationStream, OperationType,
    ScheduleTransform, ScheduledStream, StreamError, StreamWindow, SyntheticConfig,
    SyntheticWorkload, TypeQuotaFilter, ValidationFilter, Workload, WorkloadError,
    WorkloadFactory, WorkloadRegistry, SYNTHETIC_WORKLOAD,
};

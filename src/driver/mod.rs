//! Run orchestration: resolves the configured connector and workload, drives
//! the warmup and measured phases, analyzes delays and writes the run
//! artifacts.

pub mod results_dir;

pub use results_dir::{ResultsDir, RunPhase};

use crate::clock::{system_clock, SharedTimeSource};
use crate::config::{ConfigError, DriverConfig};
use crate::connector::{ConnectorError, ConnectorRegistry, DbConnector};
use crate::coordination::{
    CompletionTimeService, CoordinationError, FailureCell, FailureKind, FailureRecord, WriterHandle,
};
use crate::metrics::{
    results_log_rows, LatencyPipeline, MetricsSnapshot, ResultsLogError, ResultsLogSink,
};
use crate::observability::{DriverLog, LogLevel};
use crate::runtime::{
    DispatchReport, Dispatcher, DispatcherConfig, RunContext, LATENCY_QUEUE_CAPACITY,
};
use crate::tuning::{AutoTuner, ProbeOutcome, ThroughputProbe, TuningError, TuningReport};
use crate::validation::{
    compute_summary_from_log, read_validation_cases, validate, DbValidationReport, DbValidator,
    DelaySummary, OperationCounts, ValidationError, ValidationParamsCreator,
    ValidationParamsReport, ValidationPolicy, ValidationResult,
};
use crate::workload::{
    prepare_schedule, MergedStream, OperationStream, ScheduleTransform, StreamWindow, Workload,
    WorkloadError, WorkloadRegistry,
};
use serde::Serialize;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long the driver waits for the seeded watermark before giving up.
pub const WATERMARK_INIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error(transparent)]
    ResultsLog(#[from] ResultsLogError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Tuning(#[from] TuningError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode run artifact: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0} needs a results_dir")]
    MissingResultsDir(&'static str),
    #[error("no results log configured and no results_dir to find one in")]
    MissingResultsLog,
    #[error("database validation modes need database_validation_file")]
    MissingValidationFile,
}

/// Everything one phase produced.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase: RunPhase,
    pub time_compression_ratio: f64,
    pub error_state: Option<FailureRecord>,
    pub dispatch: DispatchReport,
    pub metrics: MetricsSnapshot,
    pub summary: Option<DelaySummary>,
    pub validation: Option<ValidationResult>,
    pub artifacts: Vec<PathBuf>,
}

/// Result of [`Driver::run_once`]. A failed warmup leaves `measured` empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutcome {
    pub error_state: Option<FailureRecord>,
    pub warmup: Option<PhaseOutcome>,
    pub measured: Option<PhaseOutcome>,
}

impl RunOutcome {
    pub fn summary(&self) -> Option<&DelaySummary> {
        self.measured.as_ref().and_then(|phase| phase.summary.as_ref())
    }

    pub fn validation(&self) -> Option<&ValidationResult> {
        self.measured
            .as_ref()
            .and_then(|phase| phase.validation.as_ref())
    }

    pub fn metrics(&self) -> Option<&MetricsSnapshot> {
        self.measured.as_ref().map(|phase| &phase.metrics)
    }

    /// No fatal failure and, when validation ran, no violation.
    pub fn passed(&self) -> bool {
        self.error_state.is_none() && self.validation().map_or(true, ValidationResult::passed)
    }
}

/// Verdict of re-validating an existing results log.
#[derive(Debug, Clone, Serialize)]
pub struct ResultsAudit {
    pub results_log: PathBuf,
    pub summary: DelaySummary,
    pub validation: ValidationResult,
}

#[derive(Clone)]
struct RunTarget {
    connector: Arc<dyn DbConnector>,
    workload: Arc<dyn Workload>,
    results: Option<ResultsDir>,
}

#[derive(Debug, Clone, Copy)]
struct PhasePlan {
    phase: RunPhase,
    window: StreamWindow,
    ratio: f64,
    bound: Option<Duration>,
    policy: Option<ValidationPolicy>,
}

/// Benchmark driver for one configuration.
pub struct Driver {
    config: DriverConfig,
    connectors: ConnectorRegistry,
    workloads: WorkloadRegistry,
    clock: SharedTimeSource,
    log: DriverLog,
}

impl Driver {
    /// Driver with the built-in connectors and workloads and the system
    /// clock.
    pub fn new(config: DriverConfig, log: DriverLog) -> Self {
        Self {
            config,
            connectors: ConnectorRegistry::with_defaults(),
            workloads: WorkloadRegistry::with_defaults(),
            clock: system_clock(),
            log: log.for_module("driver"),
        }
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_workloads(mut self, workloads: WorkloadRegistry) -> Self {
        self.workloads = workloads;
        self
    }

    pub fn with_clock(mut self, clock: SharedTimeSource) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Runs the optional warmup phase and the measured phase once at the
    /// configured compression ratio.
    pub fn run_once(&self) -> Result<RunOutcome, DriverError> {
        let results = self.results_dir()?;
        if let Some(dir) = &results {
            dir.write_json(dir.configuration(), &self.config.to_value())?;
        }
        let target = self.resolve(results)?;
        let policy = ValidationPolicy::Execution {
            record_delayed_operations: self.config.record_delayed_operations,
        };
        let outcome = self.run_phases(&target, self.config.time_compression_ratio, None, policy);
        let closed = target.connector.close();
        let outcome = outcome?;
        closed?;
        self.log.event(
            if outcome.passed() {
                LogLevel::Info
            } else {
                LogLevel::Error
            },
            "run finished",
            json!({
                "name": self.config.name,
                "error_state": outcome.error_state,
                "passed": outcome.passed(),
            }),
        );
        Ok(outcome)
    }

    /// Searches for the smallest compression ratio whose runs still pass
    /// validation.
    pub fn tune(&self) -> Result<TuningReport, DriverError> {
        let results = self
            .results_dir()?
            .ok_or(DriverError::MissingResultsDir("tune mode"))?;
        results.write_json(results.configuration(), &self.config.to_value())?;
        let target = self.resolve(Some(results.clone()))?;
        let tuner = AutoTuner::new(self.config.tuning.clone(), self.log.clone());
        let mut probe = DriverProbe {
            driver: self,
            target: target.clone(),
        };
        let report = tuner.tune(&mut probe);
        let closed = target.connector.close();
        let report = report?;
        closed?;
        results.write_json(results.tuning(), &report)?;
        Ok(report)
    }

    /// Re-judges a persisted results log against the workload's tolerance
    /// policy without running anything.
    pub fn validate_results(&self) -> Result<ResultsAudit, DriverError> {
        let results = self.results_dir()?;
        let path = match (&self.config.results_log, &results) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => dir.results_log(RunPhase::Measured),
            (None, None) => return Err(DriverError::MissingResultsLog),
        };
        let workload = self
            .workloads
            .create(&self.config.workload.name, &self.config.workload.properties)?;
        // One pass to size the tolerance policy, one to summarize.
        let row_count =
            results_log_rows(&path)?.try_fold(0u64, |count, row| row.map(|_| count + 1))?;
        let tolerance = workload.tolerance_policy(row_count);
        let summary = compute_summary_from_log(&path, tolerance.excessive_delay_threshold_ms)?;
        let counts = OperationCounts::new(
            summary
                .per_type
                .iter()
                .map(|(op_type, stats)| (op_type.clone(), stats.count))
                .collect(),
        );
        let validation = validate(
            &summary,
            &tolerance,
            &counts,
            ValidationPolicy::Execution {
                record_delayed_operations: self.config.record_delayed_operations,
            },
        );
        log_verdict(&self.log, &validation);
        let audit = ResultsAudit {
            results_log: path,
            summary,
            validation,
        };
        if let Some(dir) = &results {
            dir.write_json(dir.validation(RunPhase::Measured), &audit)?;
        }
        Ok(audit)
    }

    /// Replays recorded `(operation, expected)` pairs through the connector.
    pub fn validate_database(&self) -> Result<DbValidationReport, DriverError> {
        let file = self
            .config
            .database_validation_file
            .clone()
            .ok_or(DriverError::MissingValidationFile)?;
        let cases = read_validation_cases(&file)?;
        let workload = self
            .workloads
            .create(&self.config.workload.name, &self.config.workload.properties)?;
        let validator = match workload.enabled_validation_types() {
            Some(types) => DbValidator::new().with_enabled_types(types),
            None => DbValidator::new(),
        };
        let connector = self
            .connectors
            .create(&self.config.connector.name, &self.config.connector.properties)?;
        connector.init()?;
        let report = validator.validate(
            connector.as_ref(),
            cases,
            &self.log.for_module("db_validation"),
        );
        let closed = connector.close();
        let report = report?;
        closed?;
        let base = match self.results_dir()? {
            Some(dir) => file
                .file_name()
                .map(|name| dir.root().join(name))
                .unwrap_or_else(|| file.clone()),
            None => file.clone(),
        };
        let written = report.write_failures(&base)?;
        if !written.is_empty() {
            self.log.event(
                LogLevel::Warn,
                "incorrect results written",
                json!({ "files": written }),
            );
        }
        Ok(report)
    }

    /// Runs the head of the merged workload stream through the connector
    /// and writes the answers as a validation parameters file.
    pub fn create_validation(&self) -> Result<ValidationParamsReport, DriverError> {
        let file = self
            .config
            .database_validation_file
            .clone()
            .ok_or(DriverError::MissingValidationFile)?;
        let workload = self
            .workloads
            .create(&self.config.workload.name, &self.config.workload.properties)?;
        let connector = self
            .connectors
            .create(&self.config.connector.name, &self.config.connector.properties)?;
        connector.init()?;
        let size = self.config.validation_parameters_size;
        let mut filter = workload.validation_filter(size);
        let report = workload.streams().map_err(DriverError::from).and_then(|streams| {
            let operations =
                StreamWindow::new(0, self.config.operation_count).apply(MergedStream::new(streams));
            ValidationParamsCreator::new(size)
                .with_serialization_check(self.config.validation_serialization_check)
                .create(
                    connector.as_ref(),
                    operations,
                    filter.as_mut(),
                    &file,
                    &self.log.for_module("create_validation"),
                )
                .map_err(DriverError::from)
        });
        let closed = connector.close();
        let report = report?;
        closed?;
        Ok(report)
    }

    fn results_dir(&self) -> Result<Option<ResultsDir>, DriverError> {
        self.config
            .results_dir
            .as_deref()
            .map(|root| ResultsDir::create(root, &self.config.name))
            .transpose()
    }

    fn resolve(&self, results: Option<ResultsDir>) -> Result<RunTarget, DriverError> {
        let workload = self
            .workloads
            .create(&self.config.workload.name, &self.config.workload.properties)?;
        let connector = self
            .connectors
            .create(&self.config.connector.name, &self.config.connector.properties)?;
        connector.init()?;
        self.log.event(
            LogLevel::Info,
            "benchmark resolved",
            json!({
                "name": self.config.name,
                "connector": connector.name(),
                "workload": workload.name(),
                "threads": self.config.thread_count,
            }),
        );
        Ok(RunTarget {
            connector,
            workload,
            results,
        })
    }

    fn run_phases(
        &self,
        target: &RunTarget,
        ratio: f64,
        bound: Option<Duration>,
        policy: ValidationPolicy,
    ) -> Result<RunOutcome, DriverError> {
        let cfg = &self.config;
        let mut outcome = RunOutcome::default();
        if cfg.warmup_count > 0 {
            let warmup = self.run_phase(
                target,
                PhasePlan {
                    phase: RunPhase::Warmup,
                    window: StreamWindow::new(cfg.skip_count, Some(cfg.warmup_count)),
                    ratio,
                    bound,
                    policy: None,
                },
            )?;
            outcome.error_state = warmup.error_state.clone();
            outcome.warmup = Some(warmup);
            if outcome.error_state.is_some() {
                return Ok(outcome);
            }
            target.connector.reset()?;
        }
        let measured = self.run_phase(
            target,
            PhasePlan {
                phase: RunPhase::Measured,
                window: StreamWindow::new(
                    cfg.skip_count.saturating_add(cfg.warmup_count),
                    cfg.operation_count,
                ),
                ratio,
                bound,
                policy: Some(policy),
            },
        )?;
        outcome.error_state = measured.error_state.clone();
        outcome.measured = Some(measured);
        Ok(outcome)
    }

    fn run_phase(&self, target: &RunTarget, plan: PhasePlan) -> Result<PhaseOutcome, DriverError> {
        let cfg = &self.config;
        let log = self.log.for_run(&format!("{}-{}", cfg.name, plan.phase));
        log.event(
            LogLevel::Info,
            "phase starting",
            json!({
                "phase": plan.phase,
                "ratio": plan.ratio,
                "skip": plan.window.skip,
                "limit": plan.window.limit,
            }),
        );

        let start_ms = self.clock.now_ms().saturating_add(cfg.start_delay_ms);
        let streams = target.workload.streams()?;
        let mut stream = prepare_schedule(
            streams,
            plan.window,
            ScheduleTransform::new(start_ms, plan.ratio),
        )
        .peekable();
        let first_original_ms = match stream.peek() {
            Some(Ok(operation)) => Some(operation.original_ms()),
            _ => None,
        };
        let stream: OperationStream = Box::new(stream);

        let failure = Arc::new(FailureCell::new());
        let completion = Arc::new(CompletionTimeService::with_poll_interval(cfg.spinner_sleep()));
        let writers = self.prepare_watermark(
            &completion,
            target.workload.as_ref(),
            first_original_ms,
            &failure,
            &log,
        )?;

        let results_log = target
            .results
            .as_ref()
            .map(|dir| dir.results_log(plan.phase));
        let sink = ResultsLogSink::create(results_log.as_deref(), cfg.flush_log)?;
        let pipeline = Arc::new(LatencyPipeline::start(
            sink,
            LATENCY_QUEUE_CAPACITY,
            failure.clone(),
            log.clone(),
        ));
        let ctx = RunContext {
            failure: failure.clone(),
            completion: completion.clone(),
            pipeline: pipeline.clone(),
            connector: target.connector.clone(),
            clock: self.clock.clone(),
            log: log.clone(),
        };
        let dispatcher = Dispatcher::new(self.dispatcher_config(), ctx, stream, writers);
        let dispatch = match plan.bound {
            Some(bound) => dispatcher.run_for(bound),
            None => dispatcher.run(),
        };
        let metrics = match pipeline.snapshot() {
            Ok(metrics) => metrics,
            Err(err) => {
                failure.report(FailureKind::Resource, "latency_pipeline", err.to_string());
                pipeline.metrics()
            }
        };
        completion.shutdown();

        let mut artifacts = Vec::new();
        if let Some(path) = &results_log {
            artifacts.push(path.clone());
        }
        if let Some(dir) = &target.results {
            artifacts.push(dir.write_json(dir.results(plan.phase), &metrics)?);
        }

        let (summary, validation) = match plan.policy {
            Some(policy) => self.analyze(
                target.workload.as_ref(),
                results_log.as_deref(),
                &metrics,
                policy,
                &failure,
                &log,
            )?,
            None => (None, None),
        };
        if let (Some(dir), Some(summary)) = (&target.results, &summary) {
            let body = json!({ "summary": summary, "validation": validation });
            artifacts.push(dir.write_json(dir.validation(plan.phase), &body)?);
        }

        let error_state = failure.first();
        log.event(
            if error_state.is_some() {
                LogLevel::Error
            } else {
                LogLevel::Info
            },
            "phase finished",
            json!({
                "phase": plan.phase,
                "operations": metrics.total_count,
                "errors": metrics.error_count,
                "throughput": metrics.throughput_ops_per_sec,
                "error_state": error_state,
            }),
        );
        Ok(PhaseOutcome {
            phase: plan.phase,
            time_compression_ratio: plan.ratio,
            error_state,
            dispatch,
            metrics,
            summary,
            validation,
            artifacts,
        })
    }

    fn prepare_watermark(
        &self,
        completion: &CompletionTimeService,
        workload: &dyn Workload,
        first_original_ms: Option<u64>,
        failure: &FailureCell,
        log: &DriverLog,
    ) -> Result<Vec<WriterHandle>, DriverError> {
        if !workload.has_dependencies() {
            completion.seed_if_no_writers()?;
            log.debug("workload declares no dependencies; watermark pinned to maximum time");
            return Ok(Vec::new());
        }
        let writers = (0..self.config.thread_count)
            .map(|_| completion.register_writer())
            .collect::<Result<Vec<_>, _>>()?;
        // Nothing can depend on an operation before the first one.
        let Some(initial) = first_original_ms.and_then(|first| first.checked_sub(1)) else {
            return Ok(writers);
        };
        completion.seed_all(initial)?;
        if !completion.await_watermark(initial, WATERMARK_INIT_TIMEOUT, failure)? {
            let err = CoordinationError::WaitTimeout {
                target: initial,
                current: completion.watermark(),
                timeout_ms: WATERMARK_INIT_TIMEOUT.as_millis() as u64,
            };
            failure.report(FailureKind::Coordination, "completion_time", err.to_string());
        }
        log.event(
            LogLevel::Info,
            "watermark initialized",
            json!({ "watermark_ms": completion.watermark(), "writers": writers.len() }),
        );
        Ok(writers)
    }

    fn analyze(
        &self,
        workload: &dyn Workload,
        results_log: Option<&Path>,
        metrics: &MetricsSnapshot,
        policy: ValidationPolicy,
        failure: &FailureCell,
        log: &DriverLog,
    ) -> Result<(Option<DelaySummary>, Option<ValidationResult>), DriverError> {
        if self.config.ignore_scheduled_start_times {
            log.info("scheduled start times ignored; delay validation skipped");
            return Ok((None, None));
        }
        let Some(path) = results_log else {
            log.info("no results directory; delay validation skipped");
            return Ok((None, None));
        };
        let tolerance = workload.tolerance_policy(metrics.total_count);
        let summary = match compute_summary_from_log(path, tolerance.excessive_delay_threshold_ms) {
            Ok(summary) => summary,
            // A failed run may leave a truncated log behind.
            Err(err @ ValidationError::ResultsLog(_)) if failure.is_set() => {
                log.warn(&format!("delay analysis skipped: {err}"));
                return Ok((None, None));
            }
            Err(err) => return Err(err.into()),
        };
        let validation = validate(
            &summary,
            &tolerance,
            &OperationCounts::from_metrics(metrics),
            policy,
        );
        log_verdict(log, &validation);
        Ok((Some(summary), Some(validation)))
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_count: self.config.thread_count,
            queue_capacity: self.config.queue_capacity,
            status_interval: self.config.status_interval(),
            ignore_scheduled_start_times: self.config.ignore_scheduled_start_times,
            spinner_sleep: self.config.spinner_sleep(),
            dependency_wait_timeout: self.config.dependency_wait_timeout(),
        }
    }
}

fn log_verdict(log: &DriverLog, validation: &ValidationResult) {
    log.event(
        if validation.passed() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        },
        &validation.audit_message(),
        json!({
            "passed": validation.passed(),
            "excessive_delay_count": validation.excessive_delay_count,
            "violations": validation.errors.len(),
        }),
    );
}

/// Tuning probe that runs the configured benchmark at the probed ratio and
/// resets the connector afterwards.
struct DriverProbe<'a> {
    driver: &'a Driver,
    target: RunTarget,
}

impl ThroughputProbe for DriverProbe<'_> {
    fn probe(&mut self, ratio: f64, bound: Option<Duration>) -> Result<ProbeOutcome, TuningError> {
        let probe_err = |err: &dyn std::fmt::Display| TuningError::Probe {
            ratio,
            message: err.to_string(),
        };
        let outcome = self
            .driver
            .run_phases(&self.target, ratio, bound, ValidationPolicy::Automatic)
            .map_err(|err| probe_err(&err))?;
        self.target
            .connector
            .reset()
            .map_err(|err| probe_err(&err))?;
        let validation = outcome.validation().cloned();
        Ok(ProbeOutcome {
            passed: outcome.passed() && validation.is_some(),
            throughput_ops_per_sec: outcome
                .metrics()
                .map_or(0.0, |metrics| metrics.throughput_ops_per_sec),
            validation,
        })
    }
}

/// Runs `config` once with the default registries.
pub fn run_once(config: DriverConfig, log: DriverLog) -> Result<RunOutcome, DriverError> {
    Driver::new(config, log).run_once()
}

/// Tunes `config` with the default registries.
pub fn tune(config: DriverConfig, log: DriverLog) -> Result<TuningReport, DriverError> {
    Driver::new(config, log).tune()
}

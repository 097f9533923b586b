//! Database validation: replays recorded `(operation, expected result)`
//! pairs through one connector session and compares the answers.

use super::ValidationError;
use crate::connector::{ConnectorError, DbConnector};
use crate::observability::{DriverLog, LogLevel};
use crate::workload::{Operation, OperationType, StreamError, ValidationFilter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One line of a validation parameters file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCase {
    pub operation: Operation,
    pub expected: Value,
}

/// Reads newline-delimited JSON validation cases.
pub fn read_validation_cases(path: &Path) -> Result<Vec<ValidationCase>, ValidationError> {
    let io_err = |source: std::io::Error| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut cases = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let case = serde_json::from_str(&line).map_err(|err| ValidationError::MalformedCase {
            path: path.to_path_buf(),
            line: index + 1,
            reason: err.to_string(),
        })?;
        cases.push(case);
    }
    Ok(cases)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncorrectResult {
    pub operation: Operation,
    pub expected: Value,
    pub actual: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrashedOperation {
    pub operation: Operation,
    pub error: String,
}

/// Tally of a database validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DbValidationReport {
    pub connector: String,
    pub processed: u64,
    pub succeeded: u64,
    pub crashed: u64,
    pub incorrect: u64,
    pub skipped: u64,
    pub missing_handlers: BTreeSet<OperationType>,
    pub successful_per_type: BTreeMap<OperationType, u64>,
    pub incorrect_results: Vec<IncorrectResult>,
    pub crashed_operations: Vec<CrashedOperation>,
}

impl DbValidationReport {
    pub fn passed(&self) -> bool {
        self.crashed == 0 && self.incorrect == 0 && self.missing_handlers.is_empty()
    }

    /// Writes `<base>-failed-actual.json` and `<base>-failed-expected.json`
    /// when any result was incorrect; returns the written paths.
    pub fn write_failures(&self, base: &Path) -> Result<Vec<PathBuf>, ValidationError> {
        if self.incorrect_results.is_empty() {
            return Ok(Vec::new());
        }
        let actual: Vec<Value> = self
            .incorrect_results
            .iter()
            .map(|failure| json!({ "operation": failure.operation, "result": failure.actual }))
            .collect();
        let expected: Vec<Value> = self
            .incorrect_results
            .iter()
            .map(|failure| json!({ "operation": failure.operation, "result": failure.expected }))
            .collect();
        let mut written = Vec::with_capacity(2);
        for (suffix, body) in [("failed-actual", actual), ("failed-expected", expected)] {
            let path = sibling_path(base, suffix);
            let text = serde_json::to_string_pretty(&body)?;
            fs::write(&path, text).map_err(|source| ValidationError::Io {
                path: path.clone(),
                source,
            })?;
            written.push(path);
        }
        Ok(written)
    }
}

fn sibling_path(base: &Path, suffix: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "validation".to_string());
    base.with_file_name(format!("{stem}-{suffix}.json"))
}

/// Runs validation cases sequentially through a single session.
#[derive(Debug, Clone, Default)]
pub struct DbValidator {
    enabled_types: Option<BTreeSet<OperationType>>,
}

impl DbValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts validation to the given types; other cases are skipped.
    pub fn with_enabled_types(mut self, types: impl IntoIterator<Item = OperationType>) -> Self {
        self.enabled_types = Some(types.into_iter().collect());
        self
    }

    pub fn validate(
        &self,
        connector: &dyn DbConnector,
        cases: impl IntoIterator<Item = ValidationCase>,
        log: &DriverLog,
    ) -> Result<DbValidationReport, ValidationError> {
        let mut session = connector.open_session(0)?;
        let mut report = DbValidationReport {
            connector: connector.name().to_string(),
            ..DbValidationReport::default()
        };
        for case in cases {
            let op_type = case.operation.op_type().clone();
            if let Some(enabled) = &self.enabled_types {
                if !enabled.contains(&op_type) {
                    report.skipped += 1;
                    continue;
                }
            }
            match session.execute(&case.operation) {
                Err(ConnectorError::Unsupported(op_type)) => {
                    report.missing_handlers.insert(op_type);
                }
                Err(err) if err.is_fatal() => {
                    let _ = session.cleanup();
                    return Err(err.into());
                }
                Err(err) => {
                    report.processed += 1;
                    report.crashed += 1;
                    report.crashed_operations.push(CrashedOperation {
                        operation: case.operation,
                        error: err.to_string(),
                    });
                }
                Ok(outcome) => {
                    report.processed += 1;
                    if outcome.result == case.expected {
                        report.succeeded += 1;
                        *report.successful_per_type.entry(op_type).or_insert(0) += 1;
                    } else {
                        report.incorrect += 1;
                        report.incorrect_results.push(IncorrectResult {
                            operation: case.operation,
                            expected: case.expected,
                            actual: outcome.result,
                        });
                    }
                }
            }
        }
        session.cleanup()?;
        log.event(
            if report.passed() {
                LogLevel::Info
            } else {
                LogLevel::Warn
            },
            "database validation finished",
            json!({
                "processed": report.processed,
                "crashed": report.crashed,
                "incorrect": report.incorrect,
                "skipped": report.skipped,
                "missing_handlers": report.missing_handlers,
            }),
        );
        Ok(report)
    }
}

/// Tally of a validation parameters file generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationParamsReport {
    pub connector: String,
    pub path: PathBuf,
    pub written: u64,
    /// Operations pulled from the stream, accepted or not.
    pub considered: u64,
    pub filtered: u64,
    /// Accepted operations whose execution failed; they are left out.
    pub failed: u64,
    pub written_per_type: BTreeMap<OperationType, u64>,
}

/// Executes stream operations through one session and records the answers
/// as `(operation, expected)` cases for later database validation.
#[derive(Debug, Clone)]
pub struct ValidationParamsCreator {
    size: u64,
    serialization_check: bool,
}

impl ValidationParamsCreator {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            serialization_check: false,
        }
    }

    /// Re-reads the written file and fails unless it decodes to the same
    /// cases.
    pub fn with_serialization_check(mut self, enabled: bool) -> Self {
        self.serialization_check = enabled;
        self
    }

    pub fn create(
        &self,
        connector: &dyn DbConnector,
        operations: impl IntoIterator<Item = Result<Operation, StreamError>>,
        filter: &mut dyn ValidationFilter,
        path: &Path,
        log: &DriverLog,
    ) -> Result<ValidationParamsReport, ValidationError> {
        let mut session = connector.open_session(0)?;
        let mut report = ValidationParamsReport {
            connector: connector.name().to_string(),
            path: path.to_path_buf(),
            ..ValidationParamsReport::default()
        };
        let mut cases = Vec::new();
        for operation in operations {
            if report.written >= self.size {
                break;
            }
            let operation = match operation {
                Ok(operation) => operation,
                Err(err) => {
                    let _ = session.cleanup();
                    return Err(err.into());
                }
            };
            report.considered += 1;
            if !filter.accept(&operation) {
                report.filtered += 1;
                continue;
            }
            match session.execute(&operation) {
                Ok(outcome) => {
                    filter.written(&operation);
                    report.written += 1;
                    *report
                        .written_per_type
                        .entry(operation.op_type().clone())
                        .or_insert(0) += 1;
                    cases.push(ValidationCase {
                        operation,
                        expected: outcome.result,
                    });
                }
                Err(err) if err.is_fatal() => {
                    let _ = session.cleanup();
                    return Err(err.into());
                }
                Err(err) => {
                    report.failed += 1;
                    log.event(
                        LogLevel::Debug,
                        "validation case dropped",
                        json!({ "op_type": operation.op_type(), "error": err.to_string() }),
                    );
                }
            }
        }
        session.cleanup()?;

        write_validation_cases(path, &cases)?;
        if self.serialization_check {
            let decoded = read_validation_cases(path)?;
            if let Some(index) = first_mismatch(&cases, &decoded) {
                return Err(ValidationError::SerializationMismatch {
                    path: path.to_path_buf(),
                    line: index + 1,
                });
            }
        }
        log.event(
            if report.written < self.size {
                LogLevel::Warn
            } else {
                LogLevel::Info
            },
            "validation parameters written",
            json!({
                "path": path,
                "requested": self.size,
                "written": report.written,
                "filtered": report.filtered,
                "failed": report.failed,
            }),
        );
        Ok(report)
    }
}

/// Writes cases as newline-delimited JSON, the format
/// [`read_validation_cases`] reads.
pub fn write_validation_cases(path: &Path, cases: &[ValidationCase]) -> Result<(), ValidationError> {
    let io_err = |source: std::io::Error| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    for case in cases {
        serde_json::to_writer(&mut writer, case)?;
        writer.write_all(b"\n").map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

fn first_mismatch(written: &[ValidationCase], decoded: &[ValidationCase]) -> Option<usize> {
    written
        .iter()
        .zip(decoded)
        .position(|(left, right)| left != right)
        .or_else(|| (written.len() != decoded.len()).then(|| written.len().min(decoded.len())))
}

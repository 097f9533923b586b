//! Post-run analysis: delay statistics, tolerance verdicts and database
//! result validation.

pub mod database;
pub mod delay;
pub mod tolerance;

pub use database::{
    read_validation_cases, write_validation_cases, CrashedOperation, DbValidationReport,
    DbValidator, IncorrectResult, ValidationCase, ValidationParamsCreator, ValidationParamsReport,
};
pub use delay::{compute_summary, compute_summary_from_log, DelayStats, DelaySummary};
pub use tolerance::{
    validate, OperationCounts, TolerancePolicy, ToleranceViolation, ValidationPolicy,
    ValidationResult,
};

use crate::connector::ConnectorError;
use crate::metrics::ResultsLogError;
use crate::workload::{OperationType, StreamError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(
        "delay can not be negative: {op_type} scheduled at {scheduled_ms} ms started at {actual_ms} ms"
    )]
    NegativeDelay {
        op_type: OperationType,
        scheduled_ms: u64,
        actual_ms: u64,
    },
    #[error(transparent)]
    ResultsLog(#[from] ResultsLogError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("validation file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("validation file {path} line {line}: {reason}")]
    MalformedCase {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("validation file {path} line {line} does not decode to the case that was written")]
    SerializationMismatch { path: PathBuf, line: usize },
    #[error("failed to encode validation output: {0}")]
    Encode(#[from] serde_json::Error),
}

//! Latency records, histograms, the aggregation pipeline and the persisted
//! results log.

pub mod histogram;
pub mod pipeline;
pub mod results_log;

pub use histogram::{Histogram, HistogramSummary};
pub use pipeline::{LatencyPipeline, MetricsSnapshot, OperationMetrics, PipelineError};
pub use results_log::{
    read_results_log, results_log_rows, CsvResultsLog, ResultsLogError, ResultsLogRows,
    ResultsLogSink, RESULTS_LOG_HEADER, RESULTS_LOG_SEPARATOR,
};

use crate::workload::OperationType;
use serde::Serialize;

/// One executed operation as seen by the latency pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencyRecord {
    pub op_type: OperationType,
    pub scheduled_ms: u64,
    pub actual_ms: u64,
    pub duration_ns: u64,
    pub outcome: i32,
}

impl LatencyRecord {
    pub fn new(
        op_type: OperationType,
        scheduled_ms: u64,
        actual_ms: u64,
        duration_ns: u64,
        outcome: i32,
    ) -> Self {
        Self {
            op_type,
            scheduled_ms,
            actual_ms,
            duration_ns,
            outcome,
        }
    }
}

use super::ValidationError;
use crate::metrics::{results_log_rows, Histogram, LatencyRecord};
use crate::workload::OperationType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Delay statistics for one operation type or the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelayStats {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    /// Whole milliseconds: rounded for the aggregate, rounded up per type.
    pub mean_ms: u64,
    pub p50_ms: u64,
    pub p99_ms: u64,
}

impl DelayStats {
    fn from_histogram(histogram: &Histogram, mean_ms: u64) -> Self {
        Self {
            count: histogram.count(),
            min_ms: histogram.min(),
            max_ms: histogram.max(),
            mean_ms,
            p50_ms: histogram.percentile(0.50),
            p99_ms: histogram.percentile(0.99),
        }
    }
}

/// Immutable digest of `actual - scheduled` across a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelaySummary {
    pub excessive_delay_threshold_ms: u64,
    pub aggregate: DelayStats,
    pub per_type: BTreeMap<OperationType, DelayStats>,
    pub excessive_delay_count: u64,
    pub excessive_delay_count_per_type: BTreeMap<OperationType, u64>,
}

impl DelaySummary {
    pub fn operation_count(&self) -> u64 {
        self.aggregate.count
    }

    pub fn excessive_for(&self, op_type: &OperationType) -> u64 {
        self.excessive_delay_count_per_type
            .get(op_type)
            .copied()
            .unwrap_or(0)
    }
}

struct DelayAccumulator {
    threshold_ms: u64,
    aggregate: Histogram,
    per_type: BTreeMap<OperationType, Histogram>,
    excessive: u64,
    excessive_per_type: BTreeMap<OperationType, u64>,
}

impl DelayAccumulator {
    fn new(threshold_ms: u64) -> Self {
        Self {
            threshold_ms,
            aggregate: Histogram::new(),
            per_type: BTreeMap::new(),
            excessive: 0,
            excessive_per_type: BTreeMap::new(),
        }
    }

    fn add(&mut self, record: &LatencyRecord) -> Result<(), ValidationError> {
        let delay = record.actual_ms.checked_sub(record.scheduled_ms).ok_or_else(|| {
            ValidationError::NegativeDelay {
                op_type: record.op_type.clone(),
                scheduled_ms: record.scheduled_ms,
                actual_ms: record.actual_ms,
            }
        })?;
        self.aggregate.record(delay);
        self.per_type
            .entry(record.op_type.clone())
            .or_default()
            .record(delay);
        let excessive = self
            .excessive_per_type
            .entry(record.op_type.clone())
            .or_insert(0);
        if delay > self.threshold_ms {
            *excessive += 1;
            self.excessive += 1;
        }
        Ok(())
    }

    fn finish(self) -> DelaySummary {
        DelaySummary {
            excessive_delay_threshold_ms: self.threshold_ms,
            aggregate: DelayStats::from_histogram(&self.aggregate, self.aggregate.mean_round()),
            per_type: self
                .per_type
                .iter()
                .map(|(op_type, histogram)| {
                    (
                        op_type.clone(),
                        DelayStats::from_histogram(histogram, histogram.mean_ceil()),
                    )
                })
                .collect(),
            excessive_delay_count: self.excessive,
            excessive_delay_count_per_type: self.excessive_per_type,
        }
    }
}

/// Builds the delay summary. A delay is excessive when strictly greater than
/// `threshold_ms`; a negative delay aborts the analysis.
pub fn compute_summary<'a, I>(records: I, threshold_ms: u64) -> Result<DelaySummary, ValidationError>
where
    I: IntoIterator<Item = &'a LatencyRecord>,
{
    let mut acc = DelayAccumulator::new(threshold_ms);
    for record in records {
        acc.add(record)?;
    }
    Ok(acc.finish())
}

/// Summarizes a persisted results log row by row.
pub fn compute_summary_from_log(path: &Path, threshold_ms: u64) -> Result<DelaySummary, ValidationError> {
    let mut acc = DelayAccumulator::new(threshold_ms);
    for record in results_log_rows(path)? {
        acc.add(&record?)?;
    }
    Ok(acc.finish())
}

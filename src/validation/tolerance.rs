use super::delay::DelaySummary;
use crate::metrics::MetricsSnapshot;
use crate::workload::OperationType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How late operations may be before a run is rejected. Supplied by the
/// workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TolerancePolicy {
    pub excessive_delay_threshold_ms: u64,
    /// Default fraction of each type's operations allowed to be late.
    pub tolerated_fraction: f64,
    #[serde(default)]
    pub per_type_fraction: BTreeMap<OperationType, f64>,
    /// Late operations tolerated across the whole run.
    #[serde(default)]
    pub tolerated_count: u64,
}

impl TolerancePolicy {
    pub fn new(excessive_delay_threshold_ms: u64, tolerated_fraction: f64) -> Self {
        Self {
            excessive_delay_threshold_ms,
            tolerated_fraction,
            per_type_fraction: BTreeMap::new(),
            tolerated_count: 0,
        }
    }

    pub fn with_type_fraction(mut self, op_type: impl Into<OperationType>, fraction: f64) -> Self {
        self.per_type_fraction.insert(op_type.into(), fraction);
        self
    }

    pub fn with_tolerated_count(mut self, tolerated_count: u64) -> Self {
        self.tolerated_count = tolerated_count;
        self
    }

    pub fn fraction_for(&self, op_type: &OperationType) -> f64 {
        self.per_type_fraction
            .get(op_type)
            .copied()
            .unwrap_or(self.tolerated_fraction)
    }

    /// `round(count * fraction)` late operations are allowed for a type.
    pub fn allowed_for(&self, op_type: &OperationType, count: u64) -> u64 {
        (count as f64 * self.fraction_for(op_type)).round() as u64
    }
}

/// The two ways a run's delays are judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ValidationPolicy {
    /// Ordinary runs. Per-type limits are only enforced when delayed
    /// operations are recorded, and any violation fails the run.
    Execution { record_delayed_operations: bool },
    /// Tuning probes. Per-type violations are always listed; the verdict
    /// comes from the aggregate late count.
    Automatic,
}

/// Operation counts and throughput observed by the latency pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationCounts {
    pub per_type: BTreeMap<OperationType, u64>,
    pub throughput_ops_per_sec: f64,
}

impl OperationCounts {
    pub fn new(per_type: BTreeMap<OperationType, u64>) -> Self {
        Self {
            per_type,
            throughput_ops_per_sec: 0.0,
        }
    }

    pub fn with_throughput(mut self, throughput_ops_per_sec: f64) -> Self {
        self.throughput_ops_per_sec = throughput_ops_per_sec;
        self
    }

    pub fn from_metrics(metrics: &MetricsSnapshot) -> Self {
        Self::new(metrics.per_type_counts()).with_throughput(metrics.throughput_ops_per_sec)
    }

    pub fn total(&self) -> u64 {
        self.per_type.values().sum()
    }
}

/// One operation type with more late operations than it may have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToleranceViolation {
    pub op_type: OperationType,
    pub late: u64,
    pub allowed: u64,
}

impl fmt::Display for ToleranceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "late count for {} ({}) exceeds tolerated late count ({})",
            self.op_type, self.late, self.allowed
        )
    }
}

/// Verdict of a validation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub policy: ValidationPolicy,
    pub errors: Vec<ToleranceViolation>,
    pub above_threshold: bool,
    pub excessive_delay_count: u64,
    pub operation_count: u64,
    pub throughput_ops_per_sec: Option<f64>,
    pub on_time_ratio: Option<f64>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.errors.is_empty() && !self.above_threshold
    }

    /// One-line verdict logged after validation.
    pub fn audit_message(&self) -> String {
        let verdict = if self.passed() { "PASSED" } else { "FAILED" };
        let mut message = format!(
            "schedule audit {verdict}: {} of {} operations exceeded the delay threshold",
            self.excessive_delay_count, self.operation_count
        );
        if let Some(ratio) = self.on_time_ratio {
            message.push_str(&format!(", on-time ratio {ratio:.6}"));
        }
        if let Some(throughput) = self.throughput_ops_per_sec {
            message.push_str(&format!(", throughput {throughput:.2} ops/s"));
        }
        for error in &self.errors {
            message.push_str("; ");
            message.push_str(&error.to_string());
        }
        message
    }
}

/// Judges a delay summary against the tolerance policy.
pub fn validate(
    summary: &DelaySummary,
    tolerance: &TolerancePolicy,
    counts: &OperationCounts,
    policy: ValidationPolicy,
) -> ValidationResult {
    let check_types = match policy {
        ValidationPolicy::Execution {
            record_delayed_operations,
        } => record_delayed_operations,
        ValidationPolicy::Automatic => true,
    };
    let mut errors = Vec::new();
    if check_types {
        for (op_type, late) in &summary.excessive_delay_count_per_type {
            let count = counts.per_type.get(op_type).copied().unwrap_or(0);
            let allowed = tolerance.allowed_for(op_type, count);
            if *late > allowed {
                errors.push(ToleranceViolation {
                    op_type: op_type.clone(),
                    late: *late,
                    allowed,
                });
            }
        }
    }
    let operation_count = counts.total();
    let mut result = ValidationResult {
        policy,
        above_threshold: false,
        excessive_delay_count: summary.excessive_delay_count,
        operation_count,
        throughput_ops_per_sec: None,
        on_time_ratio: None,
        errors,
    };
    match policy {
        ValidationPolicy::Execution { .. } => {
            result.above_threshold = !result.errors.is_empty();
        }
        ValidationPolicy::Automatic => {
            result.above_threshold = summary.excessive_delay_count > tolerance.tolerated_count;
            result.throughput_ops_per_sec = Some(counts.throughput_ops_per_sec);
            result.on_time_ratio = Some(on_time_ratio(summary.excessive_delay_count, operation_count));
        }
    }
    result
}

fn on_time_ratio(excessive: u64, operation_count: u64) -> f64 {
    if operation_count == 0 {
        return 1.0;
    }
    1.0 - excessive as f64 / operation_count as f64
}

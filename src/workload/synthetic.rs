use super::operation::{Operation, OperationType};
use super::stream::{OperationStream, StreamError};
use super::{Workload, WorkloadError};
use crate::validation::TolerancePolicy;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const SYNTHETIC_WORKLOAD: &str = "synthetic";

/// Properties accepted by the synthetic workload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticConfig {
    /// One stream is generated per entry; each stream emits a single type.
    pub operation_types: Vec<String>,
    pub operations_per_stream: u64,
    pub interval_ms: u64,
    pub base_time_ms: u64,
    /// Every n-th operation of a stream depends on its predecessor; 0 disables.
    pub dependency_every: u64,
    pub excessive_delay_threshold_ms: u64,
    pub tolerated_delay_fraction: f64,
    pub per_type_tolerated_fraction: BTreeMap<String, f64>,
    /// Types database validation covers; unset covers all of them.
    pub validation_types: Option<Vec<String>>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            operation_types: vec!["read".to_string(), "write".to_string()],
            operations_per_stream: 1_000,
            interval_ms: 10,
            base_time_ms: 0,
            dependency_every: 0,
            excessive_delay_threshold_ms: 1_000,
            tolerated_delay_fraction: 0.01,
            per_type_tolerated_fraction: BTreeMap::new(),
            validation_types: None,
        }
    }
}

/// Deterministic generator of evenly spaced operation streams.
///
/// Stream `k` starts `k` ms after the base time so merged streams interleave.
#[derive(Debug, Clone)]
pub struct SyntheticWorkload {
    config: SyntheticConfig,
}

impl SyntheticWorkload {
    pub fn new(config: SyntheticConfig) -> Result<Self, WorkloadError> {
        if config.operation_types.is_empty() {
            return Err(WorkloadError::InvalidProperties(
                "operation_types must not be empty".to_string(),
            ));
        }
        if config.interval_ms == 0 {
            return Err(WorkloadError::InvalidProperties(
                "interval_ms must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&config.tolerated_delay_fraction) {
            return Err(WorkloadError::InvalidProperties(
                "tolerated_delay_fraction must be within [0, 1]".to_string(),
            ));
        }
        Ok(Self { config })
    }

    pub fn from_properties(properties: &Value) -> Result<Self, WorkloadError> {
        let config = if properties.is_null() {
            SyntheticConfig::default()
        } else {
            serde_json::from_value(properties.clone())
                .map_err(|err| WorkloadError::InvalidProperties(err.to_string()))?
        };
        Self::new(config)
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn stream(&self, index: usize, op_type: &str) -> OperationStream {
        let interval = self.config.interval_ms;
        let every = self.config.dependency_every;
        let start = self.config.base_time_ms + index as u64;
        let op_type = op_type.to_string();
        Box::new(
            (0..self.config.operations_per_stream).map(move |seq| -> Result<Operation, StreamError> {
                let time_ms = start + seq * interval;
                let operation = Operation::new(
                    op_type.as_str(),
                    time_ms,
                    json!({ "stream": index, "sequence": seq }),
                );
                if every > 0 && seq > 0 && seq % every == 0 {
                    Ok(operation.with_dependency(time_ms - interval))
                } else {
                    Ok(operation)
                }
            }),
        )
    }
}

impl Workload for SyntheticWorkload {
    fn name(&self) -> &str {
        SYNTHETIC_WORKLOAD
    }

    fn streams(&self) -> Result<Vec<OperationStream>, WorkloadError> {
        Ok(self
            .config
            .operation_types
            .iter()
            .enumerate()
            .map(|(index, op_type)| self.stream(index, op_type))
            .collect())
    }

    fn has_dependencies(&self) -> bool {
        self.config.dependency_every > 0
    }

    fn tolerance_policy(&self, operation_count: u64) -> TolerancePolicy {
        let mut policy = TolerancePolicy::new(
            self.config.excessive_delay_threshold_ms,
            self.config.tolerated_delay_fraction,
        )
        .with_tolerated_count(
            (operation_count as f64 * self.config.tolerated_delay_fraction).round() as u64,
        );
        for (op_type, fraction) in &self.config.per_type_tolerated_fraction {
            policy = policy.with_type_fraction(op_type.as_str(), *fraction);
        }
        policy
    }

    fn enabled_validation_types(&self) -> Option<BTreeSet<OperationType>> {
        self.config
            .validation_types
            .as_ref()
            .map(|types| types.iter().map(|name| OperationType::new(name)).collect())
    }
}

//! Workloads supply restartable operation streams and the tolerance policy
//! their results are judged against.

pub mod operation;
pub mod stream;
pub mod synthetic;

pub use operation::{Operation, OperationType};
pub use stream::{
    prepare_schedule, stream_from_vec, MergedStream, OperationStream, ScheduleTransform,
    ScheduledStream, StreamError, StreamWindow,
};
pub use synthetic::{SyntheticConfig, SyntheticWorkload, SYNTHETIC_WORKLOAD};

use crate::validation::TolerancePolicy;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

/// Source of operation streams for one benchmark.
pub trait Workload: Send + Sync {
    fn name(&self) -> &str;

    /// Fresh, pre-ordered streams. Called once per run phase.
    fn streams(&self) -> Result<Vec<OperationStream>, WorkloadError>;

    /// Whether any operation may declare a dependency. Workloads without
    /// dependencies skip completion-time tracking.
    fn has_dependencies(&self) -> bool {
        true
    }

    /// Tolerance policy for a run of `operation_count` operations.
    fn tolerance_policy(&self, operation_count: u64) -> TolerancePolicy;

    /// Types database validation checks; `None` checks every type.
    fn enabled_validation_types(&self) -> Option<BTreeSet<OperationType>> {
        None
    }

    /// Filter deciding which operations become validation cases when a
    /// parameters file of `required` cases is generated.
    fn validation_filter(&self, required: u64) -> Box<dyn ValidationFilter> {
        Box::new(TypeQuotaFilter::new(self.enabled_validation_types(), required))
    }
}

/// Stateful selector for validation parameter generation.
pub trait ValidationFilter: Send {
    /// Whether `operation` should be executed and kept as a case.
    fn accept(&mut self, operation: &Operation) -> bool;

    /// Records that an accepted operation was written as a case.
    fn written(&mut self, _operation: &Operation) {}
}

/// Accepts enabled types only and caps each type at an even share of the
/// requested total, so one frequent type can not crowd out the rest.
#[derive(Debug, Clone)]
pub struct TypeQuotaFilter {
    enabled: Option<BTreeSet<OperationType>>,
    per_type_cap: Option<u64>,
    written: BTreeMap<OperationType, u64>,
}

impl TypeQuotaFilter {
    pub fn new(enabled: Option<BTreeSet<OperationType>>, required: u64) -> Self {
        let per_type_cap = enabled
            .as_ref()
            .filter(|types| !types.is_empty())
            .map(|types| required.div_ceil(types.len() as u64).max(1));
        Self {
            enabled,
            per_type_cap,
            written: BTreeMap::new(),
        }
    }
}

impl ValidationFilter for TypeQuotaFilter {
    fn accept(&mut self, operation: &Operation) -> bool {
        let op_type = operation.op_type();
        if let Some(enabled) = &self.enabled {
            if !enabled.contains(op_type) {
                return false;
            }
        }
        match self.per_type_cap {
            Some(cap) => self.written.get(op_type).copied().unwrap_or(0) < cap,
            None => true,
        }
    }

    fn written(&mut self, operation: &Operation) {
        *self.written.entry(operation.op_type().clone()).or_insert(0) += 1;
    }
}

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("unknown workload '{0}'")]
    Unknown(String),
    #[error("invalid workload properties: {0}")]
    InvalidProperties(String),
    #[error("workload source failed: {0}")]
    Source(String),
}

pub type WorkloadFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Workload>, WorkloadError> + Send + Sync>;

/// Name → factory table used to resolve the configured workload.
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    factories: BTreeMap<String, WorkloadFactory>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in synthetic workload.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SYNTHETIC_WORKLOAD, |properties| {
            let workload: Arc<dyn Workload> = Arc::new(SyntheticWorkload::from_properties(properties)?);
            Ok(workload)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Workload>, WorkloadError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str, properties: &Value) -> Result<Arc<dyn Workload>, WorkloadError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| WorkloadError::Unknown(name.to_string()))?;
        factory(properties)
    }
}

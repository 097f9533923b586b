use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Interned operation type tag (`"transfer"`, `"read_account"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationType(Arc<str>);

impl OperationType {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One unit of work replayed against the connector.
///
/// `original_ms` is the workload timestamp; `scheduled_ms` is the wall-clock
/// time the dispatcher fires it at after offset and compression. The
/// dependency, when present, is expressed on the original timeline and is
/// strictly earlier than `original_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    op_type: OperationType,
    scheduled_ms: u64,
    original_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependency_ms: Option<u64>,
    #[serde(default)]
    payload: Value,
}

impl Operation {
    /// Builds an operation whose scheduled time equals its original time.
    pub fn new(op_type: impl Into<OperationType>, time_ms: u64, payload: Value) -> Self {
        Self {
            op_type: op_type.into(),
            scheduled_ms: time_ms,
            original_ms: time_ms,
            dependency_ms: None,
            payload,
        }
    }

    pub fn with_dependency(mut self, dependency_ms: u64) -> Self {
        self.dependency_ms = Some(dependency_ms);
        self
    }

    pub fn op_type(&self) -> &OperationType {
        &self.op_type
    }

    pub fn scheduled_ms(&self) -> u64 {
        self.scheduled_ms
    }

    pub fn original_ms(&self) -> u64 {
        self.original_ms
    }

    pub fn dependency_ms(&self) -> Option<u64> {
        self.dependency_ms
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the operation moved to a new wall-clock time.
    pub fn rescheduled(mut self, scheduled_ms: u64) -> Self {
        self.scheduled_ms = scheduled_ms;
        self
    }
}

use super::{ConnectorError, DbConnector, DbSession, OperationOutcome};
use crate::workload::Operation;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DUMMY_CONNECTOR: &str = "dummy";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DummyConfig {
    /// Simulated execution time per operation.
    pub latency_ms: u64,
    /// Operation types answered with an execution error.
    pub failing_types: BTreeSet<String>,
    /// Operation types with no handler.
    pub unsupported_types: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct DummyCounters {
    executed: AtomicU64,
    sessions: AtomicU64,
    resets: AtomicU64,
}

/// Connector that answers every operation locally. Each result echoes the
/// operation type and payload.
#[derive(Debug, Clone)]
pub struct DummyConnector {
    config: Arc<DummyConfig>,
    counters: Arc<DummyCounters>,
}

impl DummyConnector {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config: Arc::new(config),
            counters: Arc::new(DummyCounters::default()),
        }
    }

    pub fn from_properties(properties: &Value) -> Result<Self, ConnectorError> {
        if properties.is_null() {
            return Ok(Self::new(DummyConfig::default()));
        }
        serde_json::from_value(properties.clone())
            .map(Self::new)
            .map_err(|err| ConnectorError::InvalidProperties(err.to_string()))
    }

    pub fn executed(&self) -> u64 {
        self.counters.executed.load(Ordering::Relaxed)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.counters.sessions.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u64 {
        self.counters.resets.load(Ordering::Relaxed)
    }
}

impl DbConnector for DummyConnector {
    fn name(&self) -> &str {
        DUMMY_CONNECTOR
    }

    fn init(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn open_session(&self, _worker: usize) -> Result<Box<dyn DbSession>, ConnectorError> {
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(DummySession {
            config: self.config.clone(),
            counters: self.counters.clone(),
        }))
    }

    fn reset(&self) -> Result<(), ConnectorError> {
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

struct DummySession {
    config: Arc<DummyConfig>,
    counters: Arc<DummyCounters>,
}

impl DbSession for DummySession {
    fn execute(&mut self, operation: &Operation) -> Result<OperationOutcome, ConnectorError> {
        let op_type = operation.op_type();
        if self.config.unsupported_types.contains(op_type.as_str()) {
            return Err(ConnectorError::Unsupported(op_type.clone()));
        }
        if self.config.latency_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.latency_ms));
        }
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        if self.config.failing_types.contains(op_type.as_str()) {
            return Err(ConnectorError::Execution {
                op_type: op_type.clone(),
                message: "rejected by dummy connector".to_string(),
            });
        }
        Ok(OperationOutcome::ok(json!({
            "operation_type": op_type.as_str(),
            "payload": operation.payload(),
        })))
    }
}

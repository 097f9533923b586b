//! Database connector contract. The driver shares one connector across the
//! run and opens one session per worker.

pub mod dummy;

pub use dummy::{DummyConfig, DummyConnector, DUMMY_CONNECTOR};

use crate::workload::{Operation, OperationType};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result code recorded for successful operations.
pub const RESULT_CODE_OK: i32 = 0;
/// Result code recorded when the connector rejected an operation.
pub const RESULT_CODE_EXECUTION_ERROR: i32 = -1;
/// Result code recorded when no handler exists for the operation type.
pub const RESULT_CODE_UNSUPPORTED: i32 = -2;

/// What a session reports for one executed operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub code: i32,
    pub result: Value,
}

impl OperationOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            code: RESULT_CODE_OK,
            result,
        }
    }
}

pub trait DbConnector: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> Result<(), ConnectorError>;

    /// Opens the session owned by worker `worker`.
    fn open_session(&self, worker: usize) -> Result<Box<dyn DbSession>, ConnectorError>;

    /// Restores the database between run phases and tuning probes.
    fn reset(&self) -> Result<(), ConnectorError>;

    fn close(&self) -> Result<(), ConnectorError>;
}

pub trait DbSession: Send {
    fn execute(&mut self, operation: &Operation) -> Result<OperationOutcome, ConnectorError>;

    fn cleanup(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("unknown connector '{0}'")]
    Unknown(String),
    #[error("invalid connector properties: {0}")]
    InvalidProperties(String),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("{op_type} failed: {message}")]
    Execution {
        op_type: OperationType,
        message: String,
    },
    #[error("no handler for operation type {0}")]
    Unsupported(OperationType),
    #[error("connector i/o failure: {0}")]
    Io(#[from] io::Error),
}

impl ConnectorError {
    /// Fatal errors abort the run; the rest are counted per operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConnectorError::Execution { .. } | ConnectorError::Unsupported(_)
        )
    }

    /// Result code recorded in the results log for a non-fatal error.
    pub fn result_code(&self) -> i32 {
        match self {
            ConnectorError::Unsupported(_) => RESULT_CODE_UNSUPPORTED,
            _ => RESULT_CODE_EXECUTION_ERROR,
        }
    }
}

pub type ConnectorFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn DbConnector>, ConnectorError> + Send + Sync>;

/// Name → factory table used to resolve the configured connector.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: BTreeMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DUMMY_CONNECTOR, |properties| {
            let connector: Arc<dyn DbConnector> =
                Arc::new(DummyConnector::from_properties(properties)?);
            Ok(connector)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn DbConnector>, ConnectorError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(
        &self,
        name: &str,
        properties: &Value,
    ) -> Result<Arc<dyn DbConnector>, ConnectorError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConnectorError::Unknown(name.to_string()))?;
        factory(properties)
    }
}

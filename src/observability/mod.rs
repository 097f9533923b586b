//! Structured JSON-line logging shared by every component of a run.

pub mod logging;

pub use logging::{
    DriverLog, JsonLineLogger, LogFile, LogLevel, LogRecord, LogRotationPolicy, LogSink,
    LoggingError,
};

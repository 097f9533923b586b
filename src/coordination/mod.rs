//! Cross-thread coordination for a single run: the completion-time watermark
//! and the run-scoped failure cell.

pub mod completion_time;
pub mod failure;

pub use completion_time::{
    CompletionTimeService, CompletionTimeSnapshot, CoordinationError, ProgressKind, WriterHandle,
    WriterId, DEFAULT_POLL_INTERVAL, MAX_TIME_MS, NEARLY_MAX_TIME_MS,
};
pub use failure::{FailureCell, FailureKind, FailureRecord};

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Class of a fatal failure captured during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Watermark wait timeout or out-of-order progress submission.
    Coordination,
    /// Connector connection or results-log I/O failure.
    Resource,
    /// Worker or aggregator thread died unexpectedly.
    Internal,
}

impl FailureKind {
    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Coordination => "coordination",
            FailureKind::Resource => "resource",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First fatal failure observed by any thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub source: String,
    pub message: String,
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.source, self.message)
    }
}

/// Run-scoped failure flag shared by every worker.
///
/// Setting the flag is the cancellation primitive for errors: workers stop
/// picking up new operations at their next poll point. A separate drain
/// request stops a run without marking it failed (bounded probes use it).
#[derive(Debug, Default)]
pub struct FailureCell {
    failed: AtomicBool,
    drain: AtomicBool,
    reports: AtomicU64,
    first: Mutex<Option<FailureRecord>>,
}

impl FailureCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fatal failure. Returns true when this was the first one.
    pub fn report(
        &self,
        kind: FailureKind,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.reports.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.first.lock().unwrap();
        let first = guard.is_none();
        if first {
            *guard = Some(FailureRecord {
                kind,
                source: source.into(),
                message: message.into(),
            });
        }
        self.failed.store(true, Ordering::SeqCst);
        first
    }

    /// True once any thread reported a fatal failure.
    pub fn is_set(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Asks workers to finish in-flight work and stop without failing the run.
    pub fn request_drain(&self) {
        self.drain.store(true, Ordering::SeqCst);
    }

    pub fn drain_requested(&self) -> bool {
        self.drain.load(Ordering::SeqCst)
    }

    /// Workers check this before starting every operation.
    pub fn should_stop(&self) -> bool {
        self.is_set() || self.drain_requested()
    }

    /// Number of fatal reports, including ones after the first.
    pub fn report_count(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    pub fn first(&self) -> Option<FailureRecord> {
        self.first.lock().unwrap().clone()
    }
}

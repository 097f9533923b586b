//! Completion-time watermark shared by the dispatcher's workers.
//!
//! Every worker owns a writer slot holding the latest scheduled time it has
//! initiated and the latest scheduled time it certifies as completed. The
//! watermark is the minimum certified completion across live writers: every
//! operation scheduled at or before it has finished. Dependent operations
//! block on the watermark instead of tracking their parents individually.

use super::failure::FailureCell;
use serde::Serialize;
use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default sleep between watermark polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Sentinels used when no writer ever registers.
pub const NEARLY_MAX_TIME_MS: u64 = u64::MAX - 1;
pub const MAX_TIME_MS: u64 = u64::MAX;

/// Identifier of a registered progress writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WriterId(usize);

impl WriterId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writer-{}", self.0)
    }
}

/// Handle passed explicitly to the component that advances one writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterHandle {
    id: WriterId,
}

impl WriterHandle {
    pub fn id(&self) -> WriterId {
        self.id
    }
}

/// Which half of a writer's progress a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Initiated,
    Completed,
}

impl fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressKind::Initiated => f.write_str("initiated"),
            ProgressKind::Completed => f.write_str("completed"),
        }
    }
}

/// Errors raised by the watermark service. All of them are fatal to a run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("{writer} submitted {kind} time {submitted} after {previous}")]
    OutOfOrder {
        writer: WriterId,
        kind: ProgressKind,
        previous: u64,
        submitted: u64,
    },
    #[error("{writer} submitted completed time {completed} beyond initiated time {initiated:?}")]
    CompletedBeyondInitiated {
        writer: WriterId,
        completed: u64,
        initiated: Option<u64>,
    },
    #[error("{0} is not registered")]
    UnknownWriter(WriterId),
    #[error("writers cannot register once the watermark is defined")]
    LateRegistration,
    #[error("completion time service has been shut down")]
    ShutDown,
    #[error("watermark wait for {target} aborted: run failure flag set")]
    Aborted { target: u64 },
    #[error("timed out after {timeout_ms} ms waiting for watermark {target} (current {current:?})")]
    WaitTimeout {
        target: u64,
        current: Option<u64>,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct WriterSlot {
    last_initiated: Option<u64>,
    last_completed: Option<u64>,
}

#[derive(Debug, Default)]
struct ServiceState {
    // `None` marks a retired writer; indices stay stable.
    writers: Vec<Option<WriterSlot>>,
    seeded: bool,
    shut_down: bool,
}

impl ServiceState {
    fn slot_mut(&mut self, id: WriterId) -> Result<&mut WriterSlot, CoordinationError> {
        if self.shut_down {
            return Err(CoordinationError::ShutDown);
        }
        self.writers
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(CoordinationError::UnknownWriter(id))
    }

    fn compute(&self) -> Option<u64> {
        let mut live = self.writers.iter().flatten().peekable();
        live.peek()?;
        live.map(|slot| slot.last_completed)
            .try_fold(u64::MAX, |acc, completed| completed.map(|c| cmp::min(acc, c)))
    }

    fn lagging_writer(&self) -> Option<WriterId> {
        self.writers
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.map(|slot| (idx, slot)))
            .min_by_key(|(_, slot)| slot.last_completed)
            .map(|(idx, _)| WriterId(idx))
    }
}

/// Point-in-time view used by the status reporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionTimeSnapshot {
    pub watermark_ms: Option<u64>,
    pub live_writers: usize,
    pub lagging_writer: Option<WriterId>,
    pub seeded: bool,
}

/// Global watermark computed from per-writer progress.
#[derive(Debug)]
pub struct CompletionTimeService {
    state: Mutex<ServiceState>,
    watermark: AtomicU64,
    known: AtomicBool,
    poll_interval: Duration,
}

impl Default for CompletionTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionTimeService {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Service whose waiters sleep `poll_interval` between checks.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            watermark: AtomicU64::new(0),
            known: AtomicBool::new(false),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Registers a new writer. Its slot is empty until its first submission,
    /// which keeps the watermark unknown.
    pub fn register_writer(&self) -> Result<WriterHandle, CoordinationError> {
        let mut state = self.state.lock().unwrap();
        if state.shut_down {
            return Err(CoordinationError::ShutDown);
        }
        if self.known.load(Ordering::Acquire) {
            return Err(CoordinationError::LateRegistration);
        }
        state.writers.push(Some(WriterSlot::default()));
        Ok(WriterHandle {
            id: WriterId(state.writers.len() - 1),
        })
    }

    /// Number of writers that have not been retired.
    pub fn live_writers(&self) -> usize {
        self.state.lock().unwrap().writers.iter().flatten().count()
    }

    /// Handles of every live writer.
    pub fn writers(&self) -> Vec<WriterHandle> {
        self.state
            .lock()
            .unwrap()
            .writers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| WriterHandle { id: WriterId(idx) })
            .collect()
    }

    /// Records that the writer started the operation scheduled at `time_ms`.
    pub fn submit_initiated(
        &self,
        handle: &WriterHandle,
        time_ms: u64,
    ) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().unwrap();
        let slot = state.slot_mut(handle.id)?;
        if let Some(previous) = slot.last_initiated {
            if time_ms < previous {
                return Err(CoordinationError::OutOfOrder {
                    writer: handle.id,
                    kind: ProgressKind::Initiated,
                    previous,
                    submitted: time_ms,
                });
            }
        }
        slot.last_initiated = Some(time_ms);
        Ok(())
    }

    /// Certifies that every operation the writer scheduled at or before
    /// `time_ms` has completed.
    pub fn submit_completed(
        &self,
        handle: &WriterHandle,
        time_ms: u64,
    ) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().unwrap();
        let slot = state.slot_mut(handle.id)?;
        if let Some(previous) = slot.last_completed {
            if time_ms < previous {
                return Err(CoordinationError::OutOfOrder {
                    writer: handle.id,
                    kind: ProgressKind::Completed,
                    previous,
                    submitted: time_ms,
                });
            }
        }
        match slot.last_initiated {
            Some(initiated) if time_ms <= initiated => {}
            initiated => {
                return Err(CoordinationError::CompletedBeyondInitiated {
                    writer: handle.id,
                    completed: time_ms,
                    initiated,
                })
            }
        }
        slot.last_completed = Some(time_ms);
        self.publish(&state);
        Ok(())
    }

    /// Raises the writer's completed time to `min(time_ms, last_initiated)`
    /// when that is an advance; lower values are ignored.
    pub fn certify_up_to(
        &self,
        handle: &WriterHandle,
        time_ms: u64,
    ) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().unwrap();
        let slot = state.slot_mut(handle.id)?;
        let Some(initiated) = slot.last_initiated else {
            return Ok(());
        };
        let candidate = cmp::min(time_ms, initiated);
        if slot.last_completed.map_or(true, |done| candidate > done) {
            slot.last_completed = Some(candidate);
            self.publish(&state);
        }
        Ok(())
    }

    /// Moves an idle writer (nothing in flight) forward to `time_ms`.
    pub fn advance_idle(&self, handle: &WriterHandle, time_ms: u64) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().unwrap();
        let slot = state.slot_mut(handle.id)?;
        if slot.last_initiated.map_or(true, |initiated| time_ms > initiated) {
            slot.last_initiated = Some(time_ms);
        }
        if slot.last_completed.map_or(true, |done| time_ms > done) {
            slot.last_completed = Some(time_ms);
            self.publish(&state);
        }
        Ok(())
    }

    /// Removes a writer so it no longer holds the watermark back.
    pub fn retire(&self, handle: &WriterHandle) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().unwrap();
        state.slot_mut(handle.id)?;
        state.writers[handle.id.0] = None;
        self.publish(&state);
        Ok(())
    }

    /// Seeds every live writer with an initiated+completed time.
    pub fn seed_all(&self, time_ms: u64) -> Result<(), CoordinationError> {
        for handle in self.writers() {
            self.submit_initiated(&handle, time_ms)?;
            self.submit_completed(&handle, time_ms)?;
        }
        Ok(())
    }

    /// When nothing registered a writer, installs an internal writer pinned
    /// near the maximum representable time so every wait succeeds at once.
    /// Returns true when the seed was applied.
    pub fn seed_if_no_writers(&self) -> Result<bool, CoordinationError> {
        {
            let state = self.state.lock().unwrap();
            if state.shut_down {
                return Err(CoordinationError::ShutDown);
            }
            if !state.writers.is_empty() {
                return Ok(false);
            }
        }
        let handle = self.register_writer()?;
        self.submit_initiated(&handle, NEARLY_MAX_TIME_MS)?;
        self.submit_completed(&handle, NEARLY_MAX_TIME_MS)?;
        self.submit_initiated(&handle, MAX_TIME_MS)?;
        self.submit_completed(&handle, MAX_TIME_MS)?;
        self.state.lock().unwrap().seeded = true;
        Ok(true)
    }

    /// Current watermark, `None` while any writer has not reported.
    pub fn watermark(&self) -> Option<u64> {
        if self.known.load(Ordering::Acquire) {
            Some(self.watermark.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Blocks until the watermark reaches `target_ms`, sleeping between polls.
    /// Returns `Ok(false)` on timeout.
    pub fn await_watermark(
        &self,
        target_ms: u64,
        timeout: Duration,
        failure: &FailureCell,
    ) -> Result<bool, CoordinationError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.lock().unwrap().shut_down {
                return Err(CoordinationError::ShutDown);
            }
            if self.watermark().is_some_and(|current| current >= target_ms) {
                return Ok(true);
            }
            if failure.is_set() {
                return Err(CoordinationError::Aborted { target: target_ms });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(cmp::min(self.poll_interval, deadline - now));
        }
    }

    pub fn snapshot(&self) -> CompletionTimeSnapshot {
        let state = self.state.lock().unwrap();
        CompletionTimeSnapshot {
            watermark_ms: self.watermark(),
            live_writers: state.writers.iter().flatten().count(),
            lagging_writer: state.lagging_writer(),
            seeded: state.seeded,
        }
    }

    /// Drops every writer. The service is unusable afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.writers.clear();
        state.shut_down = true;
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }

    // Called with the state lock held so publications are serialized.
    fn publish(&self, state: &ServiceState) {
        let Some(computed) = state.compute() else {
            return;
        };
        if self.known.load(Ordering::Acquire) {
            let current = self.watermark.load(Ordering::Acquire);
            self.watermark
                .store(cmp::max(current, computed), Ordering::Release);
        } else {
            self.watermark.store(computed, Ordering::Release);
            self.known.store(true, Ordering::Release);
        }
    }
}

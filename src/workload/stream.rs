//! Lazy operation streams: k-way merge, ordering checks, the skip/limit
//! window and the offset+compression transform.

use super::operation::{Operation, OperationType};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use thiserror::Error;

/// Fallible, lazily produced sequence of operations ordered by original time.
pub type OperationStream = Box<dyn Iterator<Item = Result<Operation, StreamError>> + Send>;

/// Wraps an in-memory vector as a stream.
pub fn stream_from_vec(operations: Vec<Operation>) -> OperationStream {
    Box::new(operations.into_iter().map(Ok))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream {stream} went backwards: {op_type} at {time_ms} after {previous_ms}")]
    OutOfOrder {
        stream: usize,
        op_type: OperationType,
        previous_ms: u64,
        time_ms: u64,
    },
    #[error("{op_type} at {time_ms} depends on {dependency_ms}, which is not strictly earlier")]
    DependencyNotBefore {
        op_type: OperationType,
        time_ms: u64,
        dependency_ms: u64,
    },
    #[error("stream source failed: {0}")]
    Source(String),
}

struct HeapEntry {
    time_ms: u64,
    stream: usize,
    operation: Operation,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Ties resolve by stream index so the merge is deterministic.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time_ms, self.stream).cmp(&(other.time_ms, other.stream))
    }
}

struct StreamCursor {
    inner: OperationStream,
    last_ms: Option<u64>,
}

/// K-way merge of pre-ordered streams preserving global original-time order.
pub struct MergedStream {
    cursors: Vec<StreamCursor>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    primed: bool,
    failed: bool,
}

impl MergedStream {
    pub fn new(streams: Vec<OperationStream>) -> Self {
        let cursors = streams
            .into_iter()
            .map(|inner| StreamCursor {
                inner,
                last_ms: None,
            })
            .collect::<Vec<_>>();
        Self {
            heap: BinaryHeap::with_capacity(cursors.len()),
            cursors,
            primed: false,
            failed: false,
        }
    }

    fn pull(&mut self, stream: usize) -> Result<(), StreamError> {
        let cursor = &mut self.cursors[stream];
        let Some(next) = cursor.inner.next() else {
            return Ok(());
        };
        let operation = next?;
        let time_ms = operation.original_ms();
        if let Some(previous_ms) = cursor.last_ms {
            if time_ms < previous_ms {
                return Err(StreamError::OutOfOrder {
                    stream,
                    op_type: operation.op_type().clone(),
                    previous_ms,
                    time_ms,
                });
            }
        }
        if let Some(dependency_ms) = operation.dependency_ms() {
            if dependency_ms >= time_ms {
                return Err(StreamError::DependencyNotBefore {
                    op_type: operation.op_type().clone(),
                    time_ms,
                    dependency_ms,
                });
            }
        }
        cursor.last_ms = Some(time_ms);
        self.heap.push(Reverse(HeapEntry {
            time_ms,
            stream,
            operation,
        }));
        Ok(())
    }
}

impl Iterator for MergedStream {
    type Item = Result<Operation, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            self.primed = true;
            for stream in 0..self.cursors.len() {
                if let Err(err) = self.pull(stream) {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        let Reverse(entry) = self.heap.pop()?;
        if let Err(err) = self.pull(entry.stream) {
            self.failed = true;
            return Some(Err(err));
        }
        Some(Ok(entry.operation))
    }
}

/// Maps original workload time onto the wall clock:
/// `scheduled = start + round((original - first_original) * ratio)`.
///
/// A ratio below 1 compresses the timeline (faster replay).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleTransform {
    pub start_ms: u64,
    pub ratio: f64,
}

impl ScheduleTransform {
    pub fn new(start_ms: u64, ratio: f64) -> Self {
        Self { start_ms, ratio }
    }

    pub fn map(&self, first_original_ms: u64, original_ms: u64) -> u64 {
        let elapsed = original_ms.saturating_sub(first_original_ms) as f64;
        self.start_ms
            .saturating_add((elapsed * self.ratio).round() as u64)
    }
}

/// Applies a [`ScheduleTransform`] anchored at the first operation it sees.
pub struct ScheduledStream<I> {
    inner: I,
    transform: ScheduleTransform,
    first_original_ms: Option<u64>,
}

impl<I> ScheduledStream<I> {
    pub fn new(inner: I, transform: ScheduleTransform) -> Self {
        Self {
            inner,
            transform,
            first_original_ms: None,
        }
    }
}

impl<I> Iterator for ScheduledStream<I>
where
    I: Iterator<Item = Result<Operation, StreamError>>,
{
    type Item = Result<Operation, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        let operation = match self.inner.next()? {
            Ok(operation) => operation,
            Err(err) => return Some(Err(err)),
        };
        let first = *self
            .first_original_ms
            .get_or_insert(operation.original_ms());
        let scheduled = self.transform.map(first, operation.original_ms());
        Some(Ok(operation.rescheduled(scheduled)))
    }
}

/// Operation window `[skip, skip + limit)` over a merged stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWindow {
    pub skip: u64,
    pub limit: Option<u64>,
}

impl StreamWindow {
    pub fn new(skip: u64, limit: Option<u64>) -> Self {
        Self { skip, limit }
    }

    pub fn apply<I>(self, stream: I) -> impl Iterator<Item = Result<Operation, StreamError>>
    where
        I: Iterator<Item = Result<Operation, StreamError>>,
    {
        // Errors are never skipped so a broken source is reported even when
        // it sits inside the skipped prefix.
        let mut skipped = 0u64;
        let skip = self.skip;
        let limited = stream.filter(move |item| {
            if item.is_err() || skipped >= skip {
                return true;
            }
            skipped += 1;
            false
        });
        limited.take(self.limit.map_or(usize::MAX, |limit| {
            usize::try_from(limit).unwrap_or(usize::MAX)
        }))
    }
}

/// Merges, windows and schedules the streams of one run phase.
pub fn prepare_schedule(
    streams: Vec<OperationStream>,
    window: StreamWindow,
    transform: ScheduleTransform,
) -> OperationStream {
    Box::new(ScheduledStream::new(
        window.apply(MergedStream::new(streams)),
        transform,
    ))
}

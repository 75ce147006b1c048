// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{event, Level};

use crate::{
    Buffer, ConstBuffer, Deadline, IoHandle, IoOutcome, NativeHandle, Result,
};

/// The kinds of write reordering barrier which can be performed.
///
/// The discriminants are wire-stable; do not renumber them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum BarrierKind {
    /// Barrier data only, non-blocking: may return as soon as the barrier is scheduled.
    #[display("nowait_data_only")]
    NowaitDataOnly = 0,
    /// Barrier data only, block until it has reached storage.
    #[display("wait_data_only")]
    WaitDataOnly = 1,
    /// Barrier data and the metadata required to retrieve it, non-blocking.
    #[display("nowait_all")]
    NowaitAll = 2,
    /// Barrier data and the metadata required to retrieve it, block until done.
    #[display("wait_all")]
    WaitAll = 3,
}

impl BarrierKind {
    /// Whether this barrier does not return until it has reached storage.
    #[must_use]
    pub const fn waits(&self) -> bool {
        matches!(self, Self::WaitDataOnly | Self::WaitAll)
    }

    /// Whether this barrier also covers the file metadata required to locate the contents.
    #[must_use]
    pub const fn includes_metadata(&self) -> bool {
        matches!(self, Self::NowaitAll | Self::WaitAll)
    }
}

/// What an in-flight operation asks of the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// Scatter read.
    Read,
    /// Gather write.
    Write,
    /// Write-ordering barrier.
    Barrier(BarrierKind),
}

/// The completion callback of an operation. Invoked exactly once, on whichever thread
/// processes the completion (possibly the submitting thread, when the operation completes
/// synchronously during submission).
pub type Receiver = Box<dyn FnOnce(Result<IoOutcome>) + Send + 'static>;

/// Identifies one in-flight operation within the multiplexer it was started on.
///
/// The identity remains usable after completion; cancelling a completed operation is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationId(pub(crate) u64);

/// The request buffers of an operation: scatter descriptors for reads, gather descriptors
/// for writes and barriers.
#[derive(Debug)]
pub(crate) enum RequestBuffers {
    Scatter(Vec<Buffer>),
    Gather(Vec<ConstBuffer>),
}

impl RequestBuffers {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Scatter(buffers) => buffers.len(),
            Self::Gather(buffers) => buffers.len(),
        }
    }

    /// Segment capacities in request order.
    pub(crate) fn capacities(&self) -> Vec<usize> {
        match self {
            Self::Scatter(buffers) => buffers.iter().map(Buffer::len).collect(),
            Self::Gather(buffers) => buffers.iter().map(ConstBuffer::len).collect(),
        }
    }

    /// Whether every segment's address and length are multiples of `alignment`.
    pub(crate) fn is_aligned(&self, alignment: usize) -> bool {
        match self {
            Self::Scatter(buffers) => buffers
                .iter()
                .all(|b| (b.data() as usize) % alignment == 0 && b.len() % alignment == 0),
            Self::Gather(buffers) => buffers
                .iter()
                .all(|b| (b.data() as usize) % alignment == 0 && b.len() % alignment == 0),
        }
    }
}

/// The per-in-flight-I/O state: a handle-bound request plus the receiver that observes its
/// completion.
///
/// An operation connection is constructed by the caller, then consumed by one of the
/// multiplexer's `start_*` operations. Submission has three outcomes: synchronous success
/// (receiver invoked with the transfer before `start_*` returns), synchronous failure
/// (receiver invoked with the error before `start_*` returns), or pending (receiver invoked
/// later from a thread driving the completion loop).
///
/// # Memory validity
///
/// The buffer descriptors in the request do not extend any borrow. The memory they describe
/// must remain valid, and must not be accessed from other code, from submission until the
/// receiver has been invoked. Closing the bound handle while the operation is in flight
/// forfeits the completion; cancel and drain first.
///
/// # Thread safety
///
/// This type is thread-mobile (`Send`): it may be constructed on one thread and started on
/// another.
#[derive(derive_more::Debug)]
pub struct OperationConnection {
    handle: NativeHandle,
    kind: OperationKind,
    buffers: RequestBuffers,
    offset: u64,
    deadline: Deadline,
    #[debug(skip)]
    receiver: Option<Receiver>,
}

impl OperationConnection {
    /// A scatter read of `buffers` from `offset`, bound to `handle`, delivering its outcome
    /// to `receiver`.
    #[must_use]
    pub fn read(
        handle: &IoHandle,
        buffers: Vec<Buffer>,
        offset: u64,
        receiver: impl FnOnce(Result<IoOutcome>) + Send + 'static,
    ) -> Self {
        Self {
            handle: handle.native_handle(),
            kind: OperationKind::Read,
            buffers: RequestBuffers::Scatter(buffers),
            offset,
            deadline: Deadline::Infinite,
            receiver: Some(Box::new(receiver)),
        }
    }

    /// A gather write of `buffers` at `offset`, bound to `handle`, delivering its outcome
    /// to `receiver`.
    #[must_use]
    pub fn write(
        handle: &IoHandle,
        buffers: Vec<ConstBuffer>,
        offset: u64,
        receiver: impl FnOnce(Result<IoOutcome>) + Send + 'static,
    ) -> Self {
        Self {
            handle: handle.native_handle(),
            kind: OperationKind::Write,
            buffers: RequestBuffers::Gather(buffers),
            offset,
            deadline: Deadline::Infinite,
            receiver: Some(Box::new(receiver)),
        }
    }

    /// A write-ordering barrier covering the ranges described by `buffers` (or the whole
    /// handle, if empty), bound to `handle`, delivering its outcome to `receiver`.
    #[must_use]
    pub fn barrier(
        handle: &IoHandle,
        buffers: Vec<ConstBuffer>,
        kind: BarrierKind,
        receiver: impl FnOnce(Result<IoOutcome>) + Send + 'static,
    ) -> Self {
        Self {
            handle: handle.native_handle(),
            kind: OperationKind::Barrier(kind),
            buffers: RequestBuffers::Gather(buffers),
            offset: 0,
            deadline: Deadline::Infinite,
            receiver: Some(Box::new(receiver)),
        }
    }

    /// Attaches a deadline by which the operation must complete, else it is cancelled
    /// internally and the receiver observes [`Error::TimedOut`][crate::Error::TimedOut].
    #[must_use]
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// The handle the operation is bound to.
    #[must_use]
    pub const fn handle(&self) -> NativeHandle {
        self.handle
    }

    /// What the operation asks of the kernel.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The extent offset of the request.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// The operation's deadline.
    #[must_use]
    pub const fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub(crate) fn buffers(&self) -> &RequestBuffers {
        &self.buffers
    }

    /// Replaces the receiver with a wrapped version of itself. Used by
    /// [`CompletionScope`][crate::CompletionScope] to interpose deferral.
    pub(crate) fn map_receiver(&mut self, f: impl FnOnce(Receiver) -> Receiver) {
        let receiver = self
            .receiver
            .take()
            .expect("operation connection has already delivered its completion");
        self.receiver = Some(f(receiver));
    }

    /// Detaches the receiver for delivery. Panics if called twice; the exactly-once
    /// completion guarantee depends on it.
    pub(crate) fn take_receiver(&mut self) -> Receiver {
        self.receiver
            .take()
            .expect("operation connection has already delivered its completion")
    }

    /// Delivers the operation's result, consuming the connection.
    pub(crate) fn complete(mut self, result: Result<IoOutcome>) {
        deliver(self.take_receiver(), result);
    }
}

/// Invokes a receiver, isolating the multiplexer from receiver panics: a panicking receiver
/// is logged and completion processing continues with the next item in the batch.
pub(crate) fn deliver(receiver: Receiver, result: Result<IoOutcome>) {
    if catch_unwind(AssertUnwindSafe(move || receiver(result))).is_err() {
        event!(
            Level::ERROR,
            message = "receiver panicked during completion delivery; continuing"
        );
    }
}

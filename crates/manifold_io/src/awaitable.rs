// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An awaitable adaptor over multiplexed operations.
//!
//! The core multiplexer does not assume a coroutine runtime: receivers are plain callables.
//! This adaptor bridges the two worlds by capturing the completion in a oneshot channel and
//! exposing the receiving half as a future. Suspension and resumption are entirely the
//! awaiting executor's responsibility; some thread must still drive the multiplexer's
//! completion loop for the future to resolve.
//!
//! ```no_run
//! use manifold_io::{awaitable, best_available, Buffer, Deadline, IoHandle};
//!
//! # fn main() -> manifold_io::Result<()> {
//! let multiplexer = best_available(1)?;
//! let (mut reader, _writer) = IoHandle::pipe()?;
//! reader.set_multiplexer(Some(multiplexer.clone()))?;
//!
//! let mut storage = vec![0_u8; 64];
//! let future = awaitable::read(
//!     multiplexer.as_ref(),
//!     &reader,
//!     vec![Buffer::from_slice(&mut storage)],
//!     0,
//!     Deadline::infinite(),
//! )?;
//!
//! // ... hand `future` to an executor and drive `multiplexer.run()` elsewhere ...
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{
    BarrierKind, Buffer, ConstBuffer, Deadline, Error, IoHandle, IoMultiplexer, IoOutcome,
    OperationConnection, OperationId, Result,
};

/// A future resolving to the outcome of one multiplexed I/O operation.
///
/// Dropping the future does not cancel the operation; use [`id()`][Self::id] with
/// [`IoMultiplexer::cancel()`] for that. A dropped future simply discards the outcome when
/// it arrives.
pub struct IoFuture {
    rx: oneshot::Receiver<Result<IoOutcome>>,
    id: OperationId,
}

impl std::fmt::Debug for IoFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoFuture")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl IoFuture {
    /// The operation's identity, usable with [`IoMultiplexer::cancel()`].
    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }
}

impl Future for IoFuture {
    type Output = Result<IoOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        Pin::new(&mut this.rx).poll(cx).map(|received| {
            // The sender only vanishes unresolved if the multiplexer dropped the operation
            // without delivering, which the exactly-once guarantee rules out for started
            // operations; treat the theoretical case as cancellation.
            received.unwrap_or(Err(Error::Canceled))
        })
    }
}

/// Starts a scatter read through the multiplexer, returning a future for its outcome.
///
/// The buffer descriptors must stay valid until the future resolves (or until the outcome
/// would have been delivered, if the future is dropped early).
pub fn read(
    multiplexer: &dyn IoMultiplexer,
    handle: &IoHandle,
    buffers: Vec<Buffer>,
    offset: u64,
    deadline: Deadline,
) -> Result<IoFuture> {
    let (tx, rx) = oneshot::channel();

    let op = OperationConnection::read(handle, buffers, offset, move |result| {
        // A dropped future is the only reason nobody listens; the outcome is then moot.
        let _ = tx.send(result);
    })
    .with_deadline(deadline);

    let id = multiplexer.start_read(op)?;
    Ok(IoFuture { rx, id })
}

/// Starts a gather write through the multiplexer, returning a future for its outcome.
pub fn write(
    multiplexer: &dyn IoMultiplexer,
    handle: &IoHandle,
    buffers: Vec<ConstBuffer>,
    offset: u64,
    deadline: Deadline,
) -> Result<IoFuture> {
    let (tx, rx) = oneshot::channel();

    let op = OperationConnection::write(handle, buffers, offset, move |result| {
        let _ = tx.send(result);
    })
    .with_deadline(deadline);

    let id = multiplexer.start_write(op)?;
    Ok(IoFuture { rx, id })
}

/// Starts a write-ordering barrier through the multiplexer, returning a future for its
/// outcome.
pub fn barrier(
    multiplexer: &dyn IoMultiplexer,
    handle: &IoHandle,
    buffers: Vec<ConstBuffer>,
    kind: BarrierKind,
    deadline: Deadline,
) -> Result<IoFuture> {
    let (tx, rx) = oneshot::channel();

    let op = OperationConnection::barrier(handle, buffers, kind, move |result| {
        let _ = tx.send(result);
    })
    .with_deadline(deadline);

    let id = multiplexer.start_barrier(op)?;
    Ok(IoFuture { rx, id })
}

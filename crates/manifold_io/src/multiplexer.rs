// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{event, Level};

use crate::posted::PostedItem;
use crate::{
    Deadline, DeadlineAnchor, IoOutcome, NativeHandle, OperationConnection, OperationId,
    RegisteredBuffer, Result, ERR_POISONED_LOCK,
};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod uring;

#[cfg(target_os = "linux")]
pub use epoll::EpollMultiplexer;
#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub use uring::UringMultiplexer;

/// What one pass of the completion loop accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// This many items (completions, timeouts and posted work) were processed.
    Processed(usize),

    /// No item became ready within the supplied deadline. `pending` is the number of
    /// operations still in flight, for callers who want to know whether a further blocking
    /// wait could make progress.
    Idle {
        /// Operations currently in flight on the multiplexer.
        pending: usize,
    },
}

impl Progress {
    /// The number of items processed; zero when idle.
    #[must_use]
    pub const fn items(&self) -> usize {
        match self {
            Self::Processed(count) => *count,
            Self::Idle { .. } => 0,
        }
    }
}

/// A multiplexer of byte-oriented I/O: hosts many concurrent operations against registered
/// handles, delivering their completions through each operation's receiver with per-operation
/// deadlines and cancellation.
///
/// # Scheduling modes
///
/// Two modes are supported. In *single-threaded cooperative* mode, one thread calls
/// [`run()`][Self::run]; submissions from other threads are legal only through
/// [`post()`][Self::post], and receivers execute on the loop thread. In *parallel* mode,
/// any number of threads call `run()` concurrently and any thread may submit or post;
/// receivers execute on whichever thread picks up the completion and must be prepared
/// for that.
///
/// Only `run()`, [`complete_io()`][Self::complete_io] and [`timeout_io()`][Self::timeout_io]
/// may block in the kernel. Submission, posting and cancellation take the short internal
/// mutex at most.
///
/// # Ordering
///
/// Completions for different operations may be delivered in any order regardless of
/// submission order. For a single operation, exactly one receiver invocation occurs. Posted
/// callables execute in submission order on a single-threaded multiplexer; across parallel
/// loop threads the order is unspecified but each callable still runs exactly once.
///
/// # Shutdown
///
/// Dropping a multiplexer while operations are still in flight is a fatal programming error:
/// the backends assert in `Drop`. Cancel and drain first.
#[cfg_attr(test, mockall::automock)]
pub trait IoMultiplexer: Debug + Send + Sync {
    /// Associates a native handle with the multiplexer's completion mechanism. Idempotent
    /// per handle.
    ///
    /// After registration, all asynchronous I/O submitted against the handle delivers its
    /// completion into this multiplexer. Registration may switch the handle into
    /// non-blocking mode. Registering a handle with a second multiplexer requires
    /// deregistering it from the first, and registering or deregistering while I/O is
    /// outstanding is undefined - the caller must quiesce.
    fn register_handle(&self, handle: &NativeHandle) -> Result<()>;

    /// Dissociates a native handle. After this returns, no further completions are produced
    /// for the handle.
    fn deregister_handle(&self, handle: &NativeHandle) -> Result<()>;

    /// Submits a scatter read. See [`OperationConnection`] for the three submission
    /// outcomes.
    fn start_read(&self, op: OperationConnection) -> Result<OperationId>;

    /// Submits a gather write.
    fn start_write(&self, op: OperationConnection) -> Result<OperationId>;

    /// Submits a write-ordering barrier.
    fn start_barrier(&self, op: OperationConnection) -> Result<OperationId>;

    /// Requests cancellation of an in-flight operation.
    ///
    /// Cancellation is cooperative: the operation completes once the cancellation or the
    /// original completion has been processed by a completion loop thread, and its receiver
    /// observes [`Error::Canceled`] unless the I/O had already completed. Cancelling an
    /// operation that already completed is a no-op.
    fn cancel(&self, id: OperationId) -> Result<()>;

    /// Drives the completion loop: drains posted work, then either polls or sleeps for
    /// kernel completions (bounded by the earliest of the supplied deadline and any pending
    /// operation deadline), processes expired deadlines, and processes completions.
    ///
    /// Re-loops while nothing has been done and the supplied deadline has not elapsed.
    fn run(&self, max_items: usize, deadline: Deadline) -> Result<Progress>;

    /// Drains kernel completions only - no timeouts, no posted work. For callers who manage
    /// their own loop.
    fn complete_io(&self, max_items: usize, deadline: Deadline) -> Result<usize>;

    /// Processes timed-out pending operations only, completing them with
    /// [`Error::TimedOut`].
    fn timeout_io(&self, max_items: usize, deadline: Deadline) -> Result<usize>;

    /// Drains the posted-work queue only.
    fn invoke_posted_items(&self, max_items: usize, deadline: Deadline) -> Result<usize>;

    /// Enqueues a callable to be executed on a thread that is running (or next calls)
    /// [`run()`][Self::run] or [`invoke_posted_items()`][Self::invoke_posted_items].
    ///
    /// Thread-safe and wait-free with respect to the kernel. The callable is invoked exactly
    /// once. If a loop thread is currently blocked in the kernel, a wake is delivered.
    fn post(&self, work: PostedItem);

    /// The maximum scatter-gather fan-out for a single operation on this handle through this
    /// multiplexer. Zero for pure in-process handles.
    fn max_buffers(&self, handle: &NativeHandle) -> usize;

    /// Allocates a registered buffer of at least `len` bytes (rounded up to a page-size
    /// multiple), suitable for maximum performance I/O through this multiplexer.
    fn allocate_registered_buffer(&self, len: usize) -> Result<RegisteredBuffer>;

    /// The number of operations currently in flight: submitted, not yet delivered to their
    /// receivers.
    fn pending_io(&self) -> usize;
}

/// Chooses the best available multiplexer implementation for this platform.
///
/// `threads` is the number of threads the caller intends to run the completion loop on.
/// On Linux, single-threaded callers get `io_uring` where the kernel and environment allow
/// ring creation (probed at construction), with `epoll` as the fallback and as the
/// multi-threaded choice. Other platforms currently have no backend.
pub fn best_available(threads: usize) -> Result<Arc<dyn IoMultiplexer>> {
    #[cfg(target_os = "linux")]
    {
        #[cfg(feature = "io-uring")]
        if threads <= 1 {
            match UringMultiplexer::new() {
                Ok(multiplexer) => {
                    event!(Level::DEBUG, message = "selected io_uring multiplexer");
                    return Ok(Arc::new(multiplexer));
                }
                Err(e) => {
                    // Ring creation is commonly forbidden in containers and sandboxes;
                    // fall back to readiness-based multiplexing.
                    event!(Level::DEBUG, message = "io_uring unavailable", error = %e);
                }
            }
        }

        let multiplexer = EpollMultiplexer::new()?;
        event!(Level::DEBUG, message = "selected epoll multiplexer", threads);
        Ok(Arc::new(multiplexer))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = threads;
        Err(crate::Error::NotSupported(
            "no multiplexer backend exists for this platform",
        ))
    }
}

/// Submits one operation and drives the completion loop until its receiver has fired,
/// cancelling it if the deadline expires first.
///
/// This implements the synchronous [`IoHandle`][crate::IoHandle] surface on top of a
/// multiplexer. Safe in both scheduling modes: if another loop thread picks up the
/// completion, our own `run()` calls simply report idle and we observe the filled slot.
pub(crate) fn run_until_complete(
    multiplexer: &dyn IoMultiplexer,
    deadline: Deadline,
    submit: impl FnOnce(Box<dyn FnOnce(Result<IoOutcome>) + Send + 'static>) -> Result<OperationId>,
) -> Result<IoOutcome> {
    let anchor = DeadlineAnchor::new(deadline);

    let slot: Arc<Mutex<Option<Result<IoOutcome>>>> = Arc::new(Mutex::new(None));
    let receiver_slot = Arc::clone(&slot);

    let id = submit(Box::new(move |result| {
        *receiver_slot.lock().expect(ERR_POISONED_LOCK) = Some(result);
    }))?;

    let mut cancel_requested = false;

    loop {
        if let Some(result) = slot.lock().expect(ERR_POISONED_LOCK).take() {
            // A cancellation we issued ourselves is a deadline expiry from the caller's
            // point of view.
            return match result {
                Err(crate::Error::Canceled) if cancel_requested => Err(crate::Error::TimedOut),
                other => other,
            };
        }

        if !cancel_requested && anchor.expired() {
            multiplexer.cancel(id)?;
            cancel_requested = true;
        }

        // Once cancellation is requested we keep draining in short slices until the
        // cancellation (or a racing completion) is delivered.
        let loop_deadline = if cancel_requested {
            Deadline::from(Duration::from_millis(50))
        } else {
            anchor.as_partial_deadline()
        };

        multiplexer.run(64, loop_deadline)?;
    }
}

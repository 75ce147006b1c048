// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use negative_impl::negative_impl;
use tracing::{event, Level};

use crate::{
    deliver, IoMultiplexer, IoOutcome, OperationConnection, OperationId, Receiver, Result,
    ERR_POISONED_LOCK,
};

/// Batches completion deliveries for operations submitted through it, draining them in FIFO
/// order when the scope ends.
///
/// Receivers that submit further I/O on the same handle can recurse: a submission may
/// complete synchronously, invoking the next receiver inside the current one, and a
/// reciprocating completion chain then grows the stack without bound. Submitting through a
/// completion scope removes the recursion: while the scope is active, receiver invocations
/// for its operations are captured instead of fired, and the scope exit runs them one after
/// another. Completions captured while the drain itself is running are appended and run
/// after the current batch, preserving a well-defined FIFO order.
///
/// The scope is an explicit context: deferral applies exactly to operations whose
/// submission was wrapped by this scope (via [`start_read()`][Self::start_read] and
/// friends, or [`wrap()`][Self::wrap]). A receiver that wants its own follow-up
/// submissions deferred as well captures a [`handle()`][Self::handle] clone and wraps them
/// with it.
///
/// Operations that complete asynchronously after the scope has ended deliver directly, as
/// if never wrapped.
///
/// The optional counter cell is incremented by the number of completions drained at scope
/// exit.
///
/// # Thread safety
///
/// This type is single-threaded (`!Send`, `!Sync`); create it on the thread that submits
/// and drains. The [`ScopeHandle`] it hands out is thread-safe.
#[derive(Debug)]
pub struct CompletionScope<'c> {
    shared: ScopeHandle,
    counter: Option<&'c Cell<usize>>,
}

#[negative_impl]
impl !Send for CompletionScope<'_> {}
#[negative_impl]
impl !Sync for CompletionScope<'_> {}

/// A cloneable reference to a [`CompletionScope`], used to wrap follow-up submissions made
/// from inside receivers.
#[derive(Clone, Debug)]
pub struct ScopeHandle {
    inner: Arc<ScopeShared>,
}

#[derive(Debug)]
struct ScopeShared {
    state: Mutex<ScopeState>,
}

#[derive(Debug, Default)]
struct ScopeState {
    /// Deliveries are captured while the scope is active and fire directly afterwards.
    active: bool,
    queue: VecDeque<DeferredCompletion>,
}

struct DeferredCompletion {
    receiver: Receiver,
    result: Result<IoOutcome>,
}

impl std::fmt::Debug for DeferredCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCompletion")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl Default for CompletionScope<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'c> CompletionScope<'c> {
    fn new_handle() -> ScopeHandle {
        ScopeHandle {
            inner: Arc::new(ScopeShared {
                state: Mutex::new(ScopeState {
                    active: true,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// An active scope with no drain counter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Self::new_handle(),
            counter: None,
        }
    }

    /// An active scope that adds the number of completions drained at scope exit to
    /// `counter`.
    #[must_use]
    pub fn with_counter(counter: &'c Cell<usize>) -> Self {
        Self {
            shared: Self::new_handle(),
            counter: Some(counter),
        }
    }

    /// A thread-safe reference for wrapping follow-up submissions from inside receivers.
    #[must_use]
    pub fn handle(&self) -> ScopeHandle {
        self.shared.clone()
    }

    /// Starts a read whose completion is deferred by this scope.
    pub fn start_read(
        &self,
        multiplexer: &dyn IoMultiplexer,
        op: OperationConnection,
    ) -> Result<OperationId> {
        multiplexer.start_read(self.shared.wrap(op))
    }

    /// Starts a write whose completion is deferred by this scope.
    pub fn start_write(
        &self,
        multiplexer: &dyn IoMultiplexer,
        op: OperationConnection,
    ) -> Result<OperationId> {
        multiplexer.start_write(self.shared.wrap(op))
    }

    /// Starts a barrier whose completion is deferred by this scope.
    pub fn start_barrier(
        &self,
        multiplexer: &dyn IoMultiplexer,
        op: OperationConnection,
    ) -> Result<OperationId> {
        multiplexer.start_barrier(self.shared.wrap(op))
    }

    /// Wraps an operation so that its completion is deferred by this scope.
    #[must_use]
    pub fn wrap(&self, op: OperationConnection) -> OperationConnection {
        self.shared.wrap(op)
    }

    /// The number of completions currently captured and awaiting the drain.
    #[must_use]
    pub fn captured(&self) -> usize {
        self.shared.inner.state.lock().expect(ERR_POISONED_LOCK).queue.len()
    }

    fn drain(&mut self) -> usize {
        let mut drained = 0;

        // One deferred completion at a time: a completion captured while an earlier one is
        // being delivered (e.g. a synchronous follow-up submission through the scope
        // handle) lands at the back of the queue and runs after the current batch.
        loop {
            let next = {
                let mut state = self.shared.inner.state.lock().expect(ERR_POISONED_LOCK);
                match state.queue.pop_front() {
                    Some(completion) => Some(completion),
                    None => {
                        // Nothing left; deactivate while still holding the lock so that no
                        // new capture can race between our check and the deactivation.
                        state.active = false;
                        None
                    }
                }
            };

            let Some(completion) = next else { break };

            deliver(completion.receiver, completion.result);
            drained += 1;
        }

        if drained > 0 {
            event!(Level::TRACE, message = "completion scope drained", drained);
        }

        if let Some(counter) = self.counter {
            counter.set(counter.get() + drained);
        }

        drained
    }
}

impl Drop for CompletionScope<'_> {
    fn drop(&mut self) {
        self.drain();
    }
}

impl ScopeHandle {
    /// Wraps an operation so that its completion is deferred by the scope this handle
    /// refers to, if the scope is still active when the completion arrives.
    #[must_use]
    pub fn wrap(&self, mut op: OperationConnection) -> OperationConnection {
        let inner = Arc::clone(&self.inner);

        op.map_receiver(move |receiver| {
            Box::new(move |result: Result<IoOutcome>| {
                let captured = {
                    let mut state = inner.state.lock().expect(ERR_POISONED_LOCK);
                    if state.active {
                        state.queue.push_back(DeferredCompletion { receiver, result });
                        None
                    } else {
                        // The scope has already drained; deliver directly.
                        Some((receiver, result))
                    }
                };

                if let Some((receiver, result)) = captured {
                    receiver(result);
                }
            })
        });

        op
    }
}

/// A placeholder error for scope tests that need one.
#[cfg(test)]
fn canceled() -> Result<IoOutcome> {
    Err(crate::Error::Canceled)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{Buffer, IoHandle};

    fn read_op(
        reader: &IoHandle,
        storage: &mut Vec<u8>,
        receiver: impl FnOnce(Result<IoOutcome>) + Send + 'static,
    ) -> OperationConnection {
        OperationConnection::read(reader, vec![Buffer::from_slice(storage)], 0, receiver)
    }

    #[test]
    fn single_threaded_type() {
        assert_not_impl_any!(CompletionScope<'_>: Send, Sync);
        assert_impl_all!(ScopeHandle: Send, Sync);
    }

    #[test]
    fn wrapped_completion_is_captured_until_scope_exit() {
        let (reader, _writer) = IoHandle::pipe().unwrap();
        let mut storage = vec![0_u8; 4];
        let invoked = Arc::new(AtomicUsize::new(0));

        let drained = Cell::new(0);
        {
            let scope = CompletionScope::with_counter(&drained);

            let op = scope.wrap(read_op(&reader, &mut storage, {
                let invoked = Arc::clone(&invoked);
                move |_result| {
                    invoked.fetch_add(1, Ordering::SeqCst);
                }
            }));

            // Simulate a synchronous completion during submission.
            op.complete(canceled());

            assert_eq!(invoked.load(Ordering::SeqCst), 0);
            assert_eq!(scope.captured(), 1);
        }

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(drained.get(), 1);
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let (reader, _writer) = IoHandle::pipe().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let scope = CompletionScope::new();

            for n in 0..3 {
                let mut storage = vec![0_u8; 4];
                let order = Arc::clone(&order);
                let op = scope.wrap(read_op(&reader, &mut storage, move |_result| {
                    order.lock().unwrap().push(n);
                }));
                op.complete(canceled());
            }
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn completion_enqueued_during_drain_runs_after_current_batch() {
        let (reader, _writer) = IoHandle::pipe().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let scope = CompletionScope::new();
            let handle = scope.handle();

            // First captured completion submits a follow-up through the scope handle, whose
            // synchronous completion must land behind the already-captured second one.
            {
                let order = Arc::clone(&order);
                let reader2 = IoHandle::pipe().unwrap().0;
                let mut storage = vec![0_u8; 4];
                let op = scope.wrap(read_op(&reader, &mut storage, move |_result| {
                    order.lock().unwrap().push("first");

                    let order = Arc::clone(&order);
                    let mut follow_up_storage = vec![0_u8; 4];
                    let follow_up =
                        handle.wrap(read_op(&reader2, &mut follow_up_storage, move |_result| {
                            order.lock().unwrap().push("follow-up");
                        }));
                    follow_up.complete(canceled());
                }));
                op.complete(canceled());
            }

            {
                let order = Arc::clone(&order);
                let mut storage = vec![0_u8; 4];
                let op = scope.wrap(read_op(&reader, &mut storage, move |_result| {
                    order.lock().unwrap().push("second");
                }));
                op.complete(canceled());
            }
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "second", "follow-up"]
        );
    }

    #[test]
    fn late_completion_after_scope_exit_delivers_directly() {
        let (reader, _writer) = IoHandle::pipe().unwrap();
        let invoked = Arc::new(AtomicUsize::new(0));

        let wrapped = {
            let scope = CompletionScope::new();
            let mut storage = vec![0_u8; 4];
            scope.wrap(read_op(&reader, &mut storage, {
                let invoked = Arc::clone(&invoked);
                move |_result| {
                    invoked.fetch_add(1, Ordering::SeqCst);
                }
            }))
            // Scope drains here, with nothing captured.
        };

        wrapped.complete(canceled());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_scope_drains_nothing() {
        let drained = Cell::new(7);
        drop(CompletionScope::with_counter(&drained));
        assert_eq!(drained.get(), 7);
    }
}

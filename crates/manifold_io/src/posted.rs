// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{event, Level};

use crate::DeadlineAnchor;

/// A unit of work posted to a multiplexer, to be executed on a thread driving the
/// completion loop.
pub(crate) type PostedItem = Box<dyn FnOnce() + Send + 'static>;

/// The queue of posted work items.
///
/// The queue itself carries no lock: it lives inside the multiplexer's guarded state, so
/// enqueueing shares the multiplexer mutex. Draining takes the whole chain out under the
/// lock and walks it with the lock released; a deadline-bounded drain splices the untouched
/// remainder back in order.
#[derive(Default)]
pub(crate) struct PostedWorkQueue {
    items: VecDeque<PostedItem>,
}

impl std::fmt::Debug for PostedWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostedWorkQueue")
            .field("len", &self.items.len())
            .finish()
    }
}

impl PostedWorkQueue {
    /// Enqueues one item. Returns whether the queue was empty, in which case the caller
    /// must raise the non-empty flag and deliver a wake to any sleeping completion loop.
    pub(crate) fn push(&mut self, item: PostedItem) -> bool {
        let was_empty = self.items.is_empty();
        self.items.push_back(item);
        was_empty
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Detaches the whole chain for execution outside the lock. The caller must clear the
    /// non-empty flag while still holding the lock.
    pub(crate) fn take_all(&mut self) -> VecDeque<PostedItem> {
        std::mem::take(&mut self.items)
    }

    /// Returns an untouched remainder to the front of the queue, preserving order ahead of
    /// anything posted while the drain was running. Returns whether the queue was empty.
    pub(crate) fn splice_front(&mut self, mut remainder: VecDeque<PostedItem>) -> bool {
        let was_empty = self.items.is_empty();

        while let Some(item) = remainder.pop_back() {
            self.items.push_front(item);
        }

        was_empty
    }
}

/// Executes items from a detached chain until the chain is empty, `max_items` have run or
/// the deadline expires, leaving the untouched remainder in the chain.
///
/// Each callable runs exactly once. A panicking item is logged and does not abort the rest
/// of the chain.
pub(crate) fn run_items(
    chain: &mut VecDeque<PostedItem>,
    max_items: usize,
    anchor: &DeadlineAnchor,
) -> usize {
    let mut executed = 0;

    while executed < max_items {
        if executed > 0 && anchor.expired() {
            break;
        }

        let Some(item) = chain.pop_front() else {
            break;
        };

        if catch_unwind(AssertUnwindSafe(item)).is_err() {
            event!(
                Level::ERROR,
                message = "posted work item panicked; continuing"
            );
        }

        executed += 1;
    }

    executed
}

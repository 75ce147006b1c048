// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use io_uring::{opcode, squeue, types, IoUring};
use tracing::{event, Level};

use crate::posted::{run_items, PostedWorkQueue};
use crate::{
    sys, Deadline, DeadlineAnchor, Error, IoMultiplexer, IoOutcome, NativeHandle,
    OperationConnection, OperationId, OperationKind, Progress, RegisteredBuffer, Result,
    ERR_POISONED_LOCK,
};

const DEFAULT_RING_ENTRIES: u32 = 256;

/// User data of the wake descriptor's poll entry. Distinct from any operation key.
const WAKE_KEY: u64 = u64::MAX;

/// User data of cancellation entries themselves; their completions carry no operation.
const CANCEL_TAG: u64 = u64::MAX - 1;

/// Operation keys stay below the sentinel range.
const MAX_OPERATION_KEY: u64 = u64::MAX - 16;

#[derive(Clone, Copy, Debug)]
enum CancelReason {
    TimedOut,
    Canceled,
}

impl From<CancelReason> for Error {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::TimedOut => Self::TimedOut,
            CancelReason::Canceled => Self::Canceled,
        }
    }
}

/// One in-flight operation. The iovec array is heap-pinned here because the kernel reads it
/// for the duration of the ring operation.
#[derive(derive_more::Debug)]
struct PendingOperation {
    #[debug(skip)]
    op: OperationConnection,
    #[debug(skip)]
    iovecs: Box<[libc::iovec]>,
    steady_expiry: Option<Instant>,
    wall_expiry: Option<SystemTime>,
    cancel_reason: Option<CancelReason>,
}

#[derive(Debug, Default)]
struct MuxState {
    pending: HashMap<u64, PendingOperation>,
    registered: HashSet<RawFd>,
    steady_deadlines: BTreeMap<(Instant, u64), ()>,
    wall_deadlines: BTreeMap<(SystemTime, u64), ()>,
    cancel_requests: Vec<u64>,
    /// Operations whose receiver has already observed a timeout or cancellation but whose
    /// ring completion has not yet arrived. The iovec arrays are parked here until the
    /// kernel confirms it is done with them; the arriving completion is absorbed.
    absorbed: HashMap<u64, Box<[libc::iovec]>>,
    posted: PostedWorkQueue,
}

/// The ring multiplexer: the completion-port state machine collapsed onto an `io_uring`
/// submission/completion ring.
///
/// One vectored submission entry is issued per operation, keyed by the operation key in the
/// entry's user data. Cancellation and deadline expiry push `AsyncCancel` entries; the
/// original completion that the kernel still delivers afterwards is absorbed. The wake
/// mechanism is a poll entry over an eventfd, re-armed after each firing.
///
/// Intended for single-threaded completion loop mode; [`best_available()`][1] only selects
/// it for single-threaded callers.
///
/// [1]: crate::best_available
#[derive(derive_more::Debug)]
#[debug("UringMultiplexer(wake fd {wake_fd})")]
pub struct UringMultiplexer {
    #[debug(skip)]
    ring: Mutex<IoUring>,
    wake_fd: RawFd,
    state: Mutex<MuxState>,
    total_pending_io: AtomicUsize,
    sleepers: AtomicUsize,
    posted_non_empty: AtomicBool,
    next_key: AtomicU64,
}

// The only non-Send/Sync field reachable from `UringMultiplexer` is the raw `iovec` array
// pinned inside `MuxState`, which is always accessed through the `state` mutex.
unsafe impl Send for UringMultiplexer {}
unsafe impl Sync for UringMultiplexer {}

impl UringMultiplexer {
    /// Creates a ring multiplexer with the default queue depth, probing ring availability.
    ///
    /// Ring creation is commonly forbidden in containers and hardened environments; the
    /// error from here is the signal to fall back to the readiness multiplexer.
    pub fn new() -> Result<Self> {
        Self::with_entries(DEFAULT_RING_ENTRIES)
    }

    /// Creates a ring multiplexer with a specific submission queue depth.
    pub fn with_entries(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries).map_err(Error::Platform)?;

        // SAFETY: Plain eventfd creation.
        let wake_fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if wake_fd < 0 {
            return Err(Error::last_os_error());
        }

        let multiplexer = Self {
            ring: Mutex::new(ring),
            wake_fd,
            state: Mutex::new(MuxState::default()),
            total_pending_io: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            posted_non_empty: AtomicBool::new(false),
            next_key: AtomicU64::new(1),
        };

        multiplexer.arm_wake()?;

        event!(Level::TRACE, message = "new ring multiplexer", wake_fd, entries);
        Ok(multiplexer)
    }

    fn state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn wake(&self, count: usize) {
        if count == 0 {
            return;
        }

        let value = count as u64;
        // SAFETY: Writing the 8-byte counter value is the eventfd contract.
        unsafe {
            libc::write(self.wake_fd, std::ptr::from_ref(&value).cast(), 8);
        }
    }

    fn consume_wake(&self) {
        let mut value: u64 = 0;
        // SAFETY: Reading the 8-byte counter value is the eventfd contract.
        unsafe {
            libc::read(self.wake_fd, std::ptr::from_mut(&mut value).cast(), 8);
        }
    }

    /// Arms (or re-arms) the wake poll entry.
    fn arm_wake(&self) -> Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(self.wake_fd), libc::POLLIN as u32)
            .build()
            .user_data(WAKE_KEY);
        self.push_entry(entry)
    }

    /// Pushes one submission entry and flushes it to the kernel.
    ///
    /// A thread sleeping inside the ring holds the ring lock, so when one is sleeping we
    /// release it with a wake token before blocking on the lock. The token is delivered
    /// only then: an unconditional token would make the wake poll's own re-arm
    /// self-sustaining and turn every completion wait into a busy spin.
    fn push_entry(&self, entry: squeue::Entry) -> Result<()> {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            self.wake(1);
        }

        let mut ring = self.ring.lock().expect(ERR_POISONED_LOCK);

        loop {
            // SAFETY: Everything the entry references (iovec arrays, buffer memory) is kept
            // alive in the pending table until the matching completion is consumed.
            let pushed = unsafe { ring.submission().push(&entry) }.is_ok();
            if pushed {
                break;
            }

            // Submission queue full: flush what is there to make room.
            if let Err(e) = ring.submit() {
                return Err(Error::Platform(e));
            }
        }

        ring.submit().map_err(Error::Platform)?;
        Ok(())
    }

    fn detach_locked(state: &mut MuxState, key: u64) -> Option<PendingOperation> {
        let pending = state.pending.remove(&key)?;

        if let Some(expiry) = pending.steady_expiry {
            state.steady_deadlines.remove(&(expiry, key));
        }
        if let Some(expiry) = pending.wall_expiry {
            state.wall_deadlines.remove(&(expiry, key));
        }

        Some(pending)
    }

    fn finish(&self, op: OperationConnection, result: Result<IoOutcome>) {
        self.total_pending_io.fetch_sub(1, Ordering::SeqCst);
        op.complete(result);
    }

    fn submit(&self, op: OperationConnection) -> Result<OperationId> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        assert!(key < MAX_OPERATION_KEY, "operation keys exhausted");
        let id = OperationId(key);
        let anchor = DeadlineAnchor::new(op.deadline());
        let handle = op.handle();

        if !self.state().registered.contains(&handle.fd()) {
            op.complete(Err(Error::InvalidArgument(
                "handle is not registered with this multiplexer",
            )));
            return Ok(id);
        }

        if let Err(e) = sys::validate_request(
            &handle,
            op.kind(),
            op.buffers(),
            op.offset(),
            self.max_buffers(&handle),
        ) {
            op.complete(Err(e));
            return Ok(id);
        }

        // Barriers on handles without a backing filing system are advisory no-ops.
        if matches!(op.kind(), OperationKind::Barrier(_))
            && !handle.is_regular()
            && !handle.is_directory()
        {
            let capacities = op.buffers().capacities();
            op.complete(Ok(IoOutcome::new(capacities)));
            return Ok(id);
        }

        // The synchronous fast path: an operation that can complete right now never enters
        // the ring. Reads and writes consult readiness; a ready descriptor's syscall does
        // not block. Barriers always go through the ring (fsync cannot be polled).
        if !matches!(op.kind(), OperationKind::Barrier(_)) {
            let want_read = matches!(op.kind(), OperationKind::Read);
            match sys::poll_readiness(handle.fd(), want_read, !want_read, Some(Duration::ZERO)) {
                Err(e) => {
                    op.complete(Err(e));
                    return Ok(id);
                }
                Ok(true) => {
                    let iovecs = sys::iovecs_from_request(op.buffers());
                    let attempt = if want_read {
                        sys::attempt_readv(&handle, &iovecs, op.offset())
                    } else {
                        sys::attempt_writev(&handle, &iovecs, op.offset())
                    };

                    match attempt {
                        sys::Attempt::Transferred(n) => {
                            event!(Level::TRACE, message = "completed at submit", key, bytes = n);
                            let segments = crate::split_transfer(n, &op.buffers().capacities());
                            op.complete(Ok(IoOutcome::new(segments)));
                            return Ok(id);
                        }
                        sys::Attempt::Failed(e) => {
                            op.complete(Err(e));
                            return Ok(id);
                        }
                        // Readiness was consumed by a competitor; take the ring path.
                        sys::Attempt::WouldBlock => {}
                    }
                }
                Ok(false) => {
                    if op.deadline().is_zero() {
                        op.complete(Err(Error::TimedOut));
                        return Ok(id);
                    }
                }
            }
        } else if op.deadline().is_zero() {
            // A barrier poll has nothing already completed to report.
            op.complete(Err(Error::TimedOut));
            return Ok(id);
        }

        self.enqueue(key, op, &anchor)?;
        Ok(id)
    }

    /// Builds the submission entry for an operation and transitions it into the pending
    /// state before flushing, so that an instantly-arriving completion finds it.
    fn enqueue(&self, key: u64, op: OperationConnection, anchor: &DeadlineAnchor) -> Result<()> {
        let handle = op.handle();
        let fd = types::Fd(handle.fd());

        // Non-seekable and append-only handles submit at the kernel's "current position"
        // sentinel rather than an explicit extent offset.
        let ring_offset = if handle.is_seekable() && !handle.is_append_only() {
            op.offset()
        } else {
            u64::MAX
        };

        let iovecs: Box<[libc::iovec]> = sys::iovecs_from_request(op.buffers()).into_boxed_slice();

        #[expect(
            clippy::cast_possible_truncation,
            reason = "validated against max_buffers, far below u32::MAX"
        )]
        let entry = match op.kind() {
            OperationKind::Read => {
                opcode::Readv::new(fd, iovecs.as_ptr(), iovecs.len() as u32)
                    .offset(ring_offset)
                    .build()
                    .user_data(key)
            }
            OperationKind::Write => {
                opcode::Writev::new(fd, iovecs.as_ptr(), iovecs.len() as u32)
                    .offset(ring_offset)
                    .build()
                    .user_data(key)
            }
            OperationKind::Barrier(kind) => {
                let flags = if kind.includes_metadata() {
                    types::FsyncFlags::empty()
                } else {
                    types::FsyncFlags::DATASYNC
                };
                opcode::Fsync::new(fd).flags(flags).build().user_data(key)
            }
        };

        let (steady_expiry, wall_expiry) = anchor.expiries();

        self.total_pending_io.fetch_add(1, Ordering::SeqCst);

        let mut new_earliest = false;
        {
            let mut state = self.state();

            if let Some(expiry) = steady_expiry {
                new_earliest |= state
                    .steady_deadlines
                    .first_key_value()
                    .is_none_or(|((first, _), ())| expiry < *first);
                state.steady_deadlines.insert((expiry, key), ());
            }
            if let Some(expiry) = wall_expiry {
                new_earliest |= state
                    .wall_deadlines
                    .first_key_value()
                    .is_none_or(|((first, _), ())| expiry < *first);
                state.wall_deadlines.insert((expiry, key), ());
            }

            state.pending.insert(
                key,
                PendingOperation {
                    op,
                    iovecs,
                    steady_expiry,
                    wall_expiry,
                    cancel_reason: None,
                },
            );
        }

        if let Err(e) = self.push_entry(entry) {
            // Unwind the enlistment and fail the operation through its receiver.
            let pending = {
                let mut state = self.state();
                Self::detach_locked(&mut state, key)
            };
            if let Some(pending) = pending {
                self.finish(pending.op, Err(e));
            }
            return Ok(());
        }

        event!(Level::TRACE, message = "operation pending", key);

        if new_earliest {
            self.wake(self.sleepers.load(Ordering::SeqCst));
        }

        Ok(())
    }

    /// One ring wait plus processing of every completion it returned. As with the readiness
    /// backend, the budget is a soft bound: dequeued completions are always honored.
    fn reap(&self, budget: usize, timeout: Option<Duration>) -> Result<usize> {
        if budget == 0 {
            return Ok(0);
        }

        let entries: Vec<(u64, i32)> = {
            // Announce the sleep before taking the ring lock: submitters check the sleeper
            // count to decide whether a wake token is needed to release the lock holder.
            self.sleepers.fetch_add(1, Ordering::SeqCst);
            let mut ring = self.ring.lock().expect(ERR_POISONED_LOCK);

            let wait_result = match timeout {
                Some(duration) if duration.is_zero() => ring.submitter().submit(),
                Some(duration) => {
                    let timespec = types::Timespec::new()
                        .sec(duration.as_secs())
                        .nsec(duration.subsec_nanos());
                    let args = types::SubmitArgs::new().timespec(&timespec);
                    ring.submitter().submit_with_args(1, &args)
                }
                None => ring.submitter().submit_and_wait(1),
            };
            self.sleepers.fetch_sub(1, Ordering::SeqCst);

            match wait_result {
                Ok(_) => {}
                Err(e) => match e.raw_os_error() {
                    // Timed out, interrupted, or completions already pending: reap below.
                    Some(libc::ETIME | libc::EINTR | libc::EBUSY) => {}
                    _ => return Err(Error::Platform(e)),
                },
            }

            ring.completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect()
        };

        let mut processed = 0;
        let mut rearm_wake = false;

        for (key, raw_result) in entries {
            if key == WAKE_KEY {
                self.consume_wake();
                rearm_wake = true;
                continue;
            }
            if key == CANCEL_TAG {
                continue;
            }

            let detached = {
                let mut state = self.state();
                if state.absorbed.remove(&key).is_some() {
                    // The receiver already observed a timeout or cancellation; the kernel
                    // has now confirmed it is done with the operation's resources.
                    None
                } else {
                    Self::detach_locked(&mut state, key)
                }
            };

            let Some(pending) = detached else {
                continue;
            };

            let result = if raw_result < 0 {
                let errno = -raw_result;
                if errno == libc::ECANCELED {
                    let reason = pending.cancel_reason.unwrap_or(CancelReason::Canceled);
                    Err(reason.into())
                } else {
                    Err(Error::Platform(std::io::Error::from_raw_os_error(errno)))
                }
            } else {
                #[expect(clippy::cast_sign_loss, reason = "guarded by the raw_result < 0 branch")]
                let transferred = raw_result as usize;
                event!(
                    Level::TRACE,
                    message = "operation completed",
                    key,
                    bytes = transferred
                );
                Ok(IoOutcome::new(crate::split_transfer(
                    transferred,
                    &pending.op.buffers().capacities(),
                )))
            };

            self.finish(pending.op, result);
            processed += 1;
        }

        if rearm_wake {
            self.arm_wake()?;
        }

        Ok(processed)
    }

    /// Detaches an operation whose receiver must observe its cancellation now, parks its
    /// iovec array for absorption and asks the kernel to cancel the ring entry.
    fn cancel_detached(&self, key: u64) -> Option<OperationConnection> {
        let pending = {
            let mut state = self.state();
            let mut pending = Self::detach_locked(&mut state, key)?;
            let iovecs = std::mem::take(&mut pending.iovecs);
            state.absorbed.insert(key, iovecs);
            pending
        };

        // Failure to push the cancellation is tolerable: the original completion will
        // arrive on its own schedule and be absorbed then.
        let entry = opcode::AsyncCancel::new(key).build().user_data(CANCEL_TAG);
        if self.push_entry(entry).is_err() {
            event!(Level::TRACE, message = "cancellation push failed", key);
        }

        Some(pending.op)
    }

    fn process_expired(&self, max_items: usize) -> usize {
        let mut processed = 0;
        let now_steady = Instant::now();
        let now_wall = SystemTime::now();

        while processed < max_items {
            let key = {
                let state = self.state();

                let steady_key = state
                    .steady_deadlines
                    .first_key_value()
                    .filter(|((expiry, _), ())| *expiry <= now_steady)
                    .map(|((_, key), ())| *key);

                steady_key.or_else(|| {
                    state
                        .wall_deadlines
                        .first_key_value()
                        .filter(|((expiry, _), ())| *expiry <= now_wall)
                        .map(|((_, key), ())| *key)
                })
            };

            let Some(key) = key else { break };

            if let Some(op) = self.cancel_detached(key) {
                event!(Level::TRACE, message = "operation timed out", key);
                self.finish(op, Err(Error::TimedOut));
                processed += 1;
            }
        }

        processed
    }

    fn process_cancellations(&self, max_items: usize) -> usize {
        let requests = {
            let mut state = self.state();
            if state.cancel_requests.is_empty() {
                return 0;
            }
            std::mem::take(&mut state.cancel_requests)
        };

        let mut processed = 0;

        for key in requests {
            if processed >= max_items {
                self.state().cancel_requests.push(key);
                continue;
            }

            if let Some(op) = self.cancel_detached(key) {
                event!(Level::TRACE, message = "operation canceled", key);
                self.finish(op, Err(Error::Canceled));
                processed += 1;
            }
        }

        processed
    }

    fn sleep_budget(&self, anchor: &DeadlineAnchor) -> Option<Duration> {
        let mut budget = anchor.remaining();

        let state = self.state();

        if let Some(((expiry, _), ())) = state.steady_deadlines.first_key_value() {
            let until = expiry.saturating_duration_since(Instant::now());
            budget = Some(budget.map_or(until, |b| b.min(until)));
        }

        if let Some(((expiry, _), ())) = state.wall_deadlines.first_key_value() {
            let until = expiry
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            budget = Some(budget.map_or(until, |b| b.min(until)));
        }

        budget
    }

    fn drain_posted(&self, max_items: usize, anchor: &DeadlineAnchor) -> usize {
        if max_items == 0 || !self.posted_non_empty.load(Ordering::Acquire) {
            return 0;
        }

        let mut chain = {
            let mut state = self.state();
            let chain = state.posted.take_all();
            self.posted_non_empty.store(false, Ordering::Release);
            chain
        };

        if chain.is_empty() {
            return 0;
        }

        let executed = run_items(&mut chain, max_items, anchor);

        if !chain.is_empty() {
            {
                let mut state = self.state();
                state.posted.splice_front(chain);
                self.posted_non_empty.store(true, Ordering::Release);
            }
            self.wake(1);
        }

        executed
    }
}

impl IoMultiplexer for UringMultiplexer {
    fn register_handle(&self, handle: &NativeHandle) -> Result<()> {
        if !handle.is_valid() {
            return Err(Error::InvalidArgument("handle is invalid"));
        }

        // The ring submits against blocking descriptors and suspends internally, so
        // registration is pure bookkeeping.
        self.state().registered.insert(handle.fd());

        event!(Level::TRACE, message = "handle registered", fd = handle.fd());
        Ok(())
    }

    fn deregister_handle(&self, handle: &NativeHandle) -> Result<()> {
        let fd = handle.fd();
        let mut state = self.state();

        if !state.registered.contains(&fd) {
            return Ok(());
        }

        if state.pending.values().any(|p| p.op.handle().fd() == fd) {
            return Err(Error::InvalidArgument(
                "cannot deregister a handle with I/O outstanding",
            ));
        }

        state.registered.remove(&fd);

        event!(Level::TRACE, message = "handle deregistered", fd);
        Ok(())
    }

    fn start_read(&self, op: OperationConnection) -> Result<OperationId> {
        if !matches!(op.kind(), OperationKind::Read) {
            op.complete(Err(Error::InvalidArgument(
                "start_read requires a read operation",
            )));
            return Ok(OperationId(self.next_key.fetch_add(1, Ordering::Relaxed)));
        }
        self.submit(op)
    }

    fn start_write(&self, op: OperationConnection) -> Result<OperationId> {
        if !matches!(op.kind(), OperationKind::Write) {
            op.complete(Err(Error::InvalidArgument(
                "start_write requires a write operation",
            )));
            return Ok(OperationId(self.next_key.fetch_add(1, Ordering::Relaxed)));
        }
        self.submit(op)
    }

    fn start_barrier(&self, op: OperationConnection) -> Result<OperationId> {
        if !matches!(op.kind(), OperationKind::Barrier(_)) {
            op.complete(Err(Error::InvalidArgument(
                "start_barrier requires a barrier operation",
            )));
            return Ok(OperationId(self.next_key.fetch_add(1, Ordering::Relaxed)));
        }
        self.submit(op)
    }

    fn cancel(&self, id: OperationId) -> Result<()> {
        {
            let mut state = self.state();

            let Some(pending) = state.pending.get_mut(&id.0) else {
                return Ok(());
            };

            if pending.cancel_reason.is_none() {
                pending.cancel_reason = Some(CancelReason::Canceled);
            }
            state.cancel_requests.push(id.0);
        }

        event!(Level::TRACE, message = "cancellation requested", key = id.0);
        self.wake(1);
        Ok(())
    }

    fn run(&self, max_items: usize, deadline: Deadline) -> Result<Progress> {
        if max_items == 0 {
            return Ok(Progress::Processed(0));
        }

        let anchor = DeadlineAnchor::new(deadline);

        loop {
            let mut processed = self.drain_posted(max_items, &anchor);
            processed += self.process_cancellations(max_items - processed);

            let timeout = if processed > 0 {
                Some(Duration::ZERO)
            } else {
                self.sleep_budget(&anchor)
            };

            processed += self.reap(max_items.saturating_sub(processed), timeout)?;
            processed += self.process_expired(max_items.saturating_sub(processed));

            if processed > 0 {
                return Ok(Progress::Processed(processed));
            }

            if anchor.expired() {
                return Ok(Progress::Idle {
                    pending: self.pending_io(),
                });
            }
        }
    }

    fn complete_io(&self, max_items: usize, deadline: Deadline) -> Result<usize> {
        if max_items == 0 {
            return Ok(0);
        }

        let anchor = DeadlineAnchor::new(deadline);

        loop {
            let mut processed = self.process_cancellations(max_items);

            let timeout = if processed > 0 {
                Some(Duration::ZERO)
            } else {
                anchor.remaining()
            };

            processed += self.reap(max_items.saturating_sub(processed), timeout)?;

            if processed > 0 || anchor.expired() {
                return Ok(processed);
            }
        }
    }

    fn timeout_io(&self, max_items: usize, _deadline: Deadline) -> Result<usize> {
        Ok(self.process_expired(max_items))
    }

    fn invoke_posted_items(&self, max_items: usize, deadline: Deadline) -> Result<usize> {
        let anchor = DeadlineAnchor::new(deadline);
        Ok(self.drain_posted(max_items, &anchor))
    }

    fn post(&self, work: Box<dyn FnOnce() + Send + 'static>) {
        let was_empty = {
            let mut state = self.state();
            state.posted.push(work)
        };

        if was_empty {
            self.posted_non_empty.store(true, Ordering::Release);
            self.wake(1);
        }
    }

    fn max_buffers(&self, handle: &NativeHandle) -> usize {
        if handle.is_in_process_only() {
            return 0;
        }
        sys::iov_max()
    }

    fn allocate_registered_buffer(&self, len: usize) -> Result<RegisteredBuffer> {
        RegisteredBuffer::allocate(len)
    }

    fn pending_io(&self) -> usize {
        self.total_pending_io.load(Ordering::SeqCst)
    }
}

impl Drop for UringMultiplexer {
    fn drop(&mut self) {
        if !thread::panicking() {
            assert_eq!(
                self.pending_io(),
                0,
                "multiplexer dropped with I/O still in flight"
            );
        }

        sys::close_fd(self.wake_fd);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{event, Level};

use crate::posted::{run_items, PostedWorkQueue};
use crate::{
    sys, Deadline, DeadlineAnchor, Error, IoMultiplexer, IoOutcome, NativeHandle,
    OperationConnection, OperationId, OperationKind, Progress, RegisteredBuffer, Result,
    ERR_POISONED_LOCK,
};

/// Max number of readiness events to dequeue in one kernel wait. Events above the limit are
/// simply picked up by the next wait; with one-shot arming nothing is lost.
const POLL_SIZE_EVENTS: usize = 256;

/// The registration key carried by wake packets. Distinct from any descriptor.
const WAKE_KEY: u64 = u64::MAX;

const READY_FOR_READ: u32 =
    (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
const READY_FOR_WRITE: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Why an in-flight operation was cancelled internally.
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

/// One in-flight operation, owned by the multiplexer from submission until its receiver
/// has been invoked.
#[derive(derive_more::Debug)]
struct PendingOperation {
    #[debug(skip)]
    op: OperationConnection,
    steady_expiry: Option<Instant>,
    wall_expiry: Option<SystemTime>,
    cancel_reason: Option<CancelReason>,
}

/// Per-descriptor registration record: which operations are waiting for which readiness.
#[derive(Debug, Default)]
struct Registration {
    read_waiters: VecDeque<u64>,
    write_waiters: VecDeque<u64>,
    /// Whether the descriptor participates in readiness notification at all. Regular files
    /// and other always-ready handles complete synchronously at submit and never arm.
    pollable: bool,
}

#[derive(Debug, Default)]
struct MuxState {
    pending: HashMap<u64, PendingOperation>,
    registrations: HashMap<RawFd, Registration>,
    steady_deadlines: BTreeMap<(Instant, u64), ()>,
    wall_deadlines: BTreeMap<(SystemTime, u64), ()>,
    /// Cancellation requests awaiting delivery by a completion loop thread.
    cancel_requests: Vec<u64>,
    posted: PostedWorkQueue,
}

/// The readiness-based multiplexer: epoll plus the shared pending-operation state machine.
///
/// Submission attempts the syscall immediately; a would-block outcome arms one-shot
/// readiness notification and enlists the operation, and the completion loop re-issues the
/// syscall when the descriptor becomes ready. Handles that never block (regular files)
/// therefore always complete synchronously during submission and never touch the epoll
/// instance - the readiness analog of skipping the completion port for synchronous
/// completions.
///
/// Safe to drive from one thread or many; see the trait-level discussion of the two
/// scheduling modes.
#[derive(derive_more::Debug)]
#[debug("EpollMultiplexer(epoll fd {epoll_fd}, wake fd {wake_fd})")]
pub struct EpollMultiplexer {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    state: Mutex<MuxState>,
    /// Operations submitted and not yet delivered to their receivers.
    total_pending_io: AtomicUsize,
    /// Threads currently inside the sleep phase of a completion wait.
    sleepers: AtomicUsize,
    /// Lock-free fast path for "is there posted work".
    posted_non_empty: AtomicBool,
    next_key: AtomicU64,
}

impl EpollMultiplexer {
    /// Creates a new readiness multiplexer.
    pub fn new() -> Result<Self> {
        // SAFETY: Plain epoll instance creation.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::last_os_error());
        }

        // Semaphore mode: each wake token satisfies exactly one sleeping wait, so waking
        // "all current sleepers" is writing that many tokens.
        // SAFETY: Plain eventfd creation.
        let wake_fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if wake_fd < 0 {
            let e = Error::last_os_error();
            sys::close_fd(epoll_fd);
            return Err(e);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_KEY,
        };
        // SAFETY: Registering the wake descriptor we just created.
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) } < 0 {
            let e = Error::last_os_error();
            sys::close_fd(wake_fd);
            sys::close_fd(epoll_fd);
            return Err(e);
        }

        event!(Level::TRACE, message = "new epoll multiplexer", epoll_fd, wake_fd);

        Ok(Self {
            epoll_fd,
            wake_fd,
            state: Mutex::new(MuxState::default()),
            total_pending_io: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            posted_non_empty: AtomicBool::new(false),
            next_key: AtomicU64::new(1),
        })
    }

    fn state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    /// Delivers `count` wake tokens, each releasing one sleeping completion wait.
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
        // SAFETY: Reading the 8-byte counter value is the eventfd contract; the descriptor
        // is non-blocking so a lost race simply returns EAGAIN.
        unsafe {
            libc::read(self.wake_fd, std::ptr::from_mut(&mut value).cast(), 8);
        }
    }

    /// Applies the descriptor's current interest set, one-shot. An empty interest set
    /// leaves the descriptor disarmed so spurious hangup events cannot storm the loop.
    fn arm_interest(&self, state: &MuxState, fd: RawFd) {
        let Some(reg) = state.registrations.get(&fd) else {
            return;
        };
        if !reg.pollable {
            return;
        }

        let mut events = libc::EPOLLONESHOT as u32;
        if !reg.read_waiters.is_empty() {
            events |= libc::EPOLLIN as u32;
        }
        if !reg.write_waiters.is_empty() {
            events |= libc::EPOLLOUT as u32;
        }

        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        // A non-blocking control call; this is not a kernel wait.
        // SAFETY: Plain epoll interest update on descriptors we track.
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev);
        }
    }

    /// Removes one operation from every tracking structure. The caller delivers.
    fn detach_locked(state: &mut MuxState, key: u64) -> Option<PendingOperation> {
        let pending = state.pending.remove(&key)?;

        if let Some(expiry) = pending.steady_expiry {
            state.steady_deadlines.remove(&(expiry, key));
        }
        if let Some(expiry) = pending.wall_expiry {
            state.wall_deadlines.remove(&(expiry, key));
        }

        let fd = pending.op.handle().fd();
        if let Some(reg) = state.registrations.get_mut(&fd) {
            reg.read_waiters.retain(|k| *k != key);
            reg.write_waiters.retain(|k| *k != key);
        }

        Some(pending)
    }

    /// Invokes the receiver of an operation that was counted as pending.
    fn finish(&self, op: OperationConnection, result: Result<IoOutcome>) {
        self.total_pending_io.fetch_sub(1, Ordering::SeqCst);
        op.complete(result);
    }

    /// Submission path shared by reads and writes.
    fn submit(&self, op: OperationConnection) -> Result<OperationId> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let id = OperationId(key);
        let anchor = DeadlineAnchor::new(op.deadline());
        let handle = op.handle();

        let registered_pollable = self
            .state()
            .registrations
            .get(&handle.fd())
            .map(|reg| reg.pollable);

        let Some(pollable) = registered_pollable else {
            op.complete(Err(Error::InvalidArgument(
                "handle is not registered with this multiplexer",
            )));
            return Ok(id);
        };

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

        if let OperationKind::Barrier(kind) = op.kind() {
            // Barriers cannot be suspended on readiness; they execute at submit. The ring
            // backend makes these truly asynchronous.
            let range_len: usize = op.buffers().capacities().iter().sum();
            let result = sys::execute_barrier(&handle, kind, op.offset(), range_len)
                .map(|()| IoOutcome::new(op.buffers().capacities()));

            event!(Level::TRACE, message = "barrier executed", key, kind = %kind);
            op.complete(result);
            return Ok(id);
        }

        let iovecs = sys::iovecs_from_request(op.buffers());
        let attempt = match op.kind() {
            OperationKind::Read => sys::attempt_readv(&handle, &iovecs, op.offset()),
            OperationKind::Write => sys::attempt_writev(&handle, &iovecs, op.offset()),
            OperationKind::Barrier(_) => unreachable!("barriers handled above"),
        };

        match attempt {
            sys::Attempt::Transferred(n) => {
                event!(Level::TRACE, message = "completed at submit", key, bytes = n);
                let segments = crate::split_transfer(n, &op.buffers().capacities());
                op.complete(Ok(IoOutcome::new(segments)));
                Ok(id)
            }
            sys::Attempt::Failed(e) => {
                event!(Level::TRACE, message = "failed at submit", key, error = %e);
                op.complete(Err(e));
                Ok(id)
            }
            sys::Attempt::WouldBlock => {
                if op.deadline().is_zero() {
                    // A poll: nothing had completed, report so without enlisting.
                    op.complete(Err(Error::TimedOut));
                    return Ok(id);
                }

                if !pollable {
                    op.complete(Err(Error::NotSupported(
                        "handle cannot participate in readiness notification",
                    )));
                    return Ok(id);
                }

                self.enlist(key, op, &anchor);
                Ok(id)
            }
        }
    }

    /// Transitions an operation into the pending state: tracking tables, readiness arming,
    /// deadline indexes and the pending-I/O count.
    fn enlist(&self, key: u64, op: OperationConnection, anchor: &DeadlineAnchor) {
        let fd = op.handle().fd();
        let direction_read = matches!(op.kind(), OperationKind::Read);
        let (steady_expiry, wall_expiry) = anchor.expiries();

        self.total_pending_io.fetch_add(1, Ordering::SeqCst);

        let mut new_earliest = false;
        {
            let mut state = self.state();

            let Some(reg) = state.registrations.get_mut(&fd) else {
                // Deregistered between validation and enlist; fail the operation rather
                // than leak it.
                drop(state);
                self.finish(
                    op,
                    Err(Error::InvalidArgument(
                        "handle was deregistered during submission",
                    )),
                );
                return;
            };

            if direction_read {
                reg.read_waiters.push_back(key);
            } else {
                reg.write_waiters.push_back(key);
            }

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
                    steady_expiry,
                    wall_expiry,
                    cancel_reason: None,
                },
            );

            self.arm_interest(&state, fd);
        }

        event!(Level::TRACE, message = "operation pending", key, fd);

        // A new earliest deadline invalidates the sleep timeout other loop threads
        // computed before blocking; wake them all so they recompute.
        if new_earliest {
            self.wake(self.sleepers.load(Ordering::SeqCst));
        }
    }

    /// Handles readiness of one descriptor: re-issues syscalls for its waiting operations
    /// in FIFO order until the descriptor would block again, then re-arms.
    fn process_ready_fd(&self, fd: RawFd, revents: u32) -> usize {
        let mut processed = 0;
        let readable = revents & READY_FOR_READ != 0;
        let writable = revents & READY_FOR_WRITE != 0;

        loop {
            let candidate = {
                let mut state = self.state();

                let key = state.registrations.get(&fd).and_then(|reg| {
                    let read_key = if readable {
                        reg.read_waiters.front().copied()
                    } else {
                        None
                    };
                    read_key.or_else(|| {
                        if writable {
                            reg.write_waiters.front().copied()
                        } else {
                            None
                        }
                    })
                });

                match key {
                    Some(key) => Self::detach_locked(&mut state, key).map(|p| (key, p)),
                    None => None,
                }
            };

            let Some((key, pending)) = candidate else {
                break;
            };

            if let Some(reason) = pending.cancel_reason {
                self.finish(pending.op, Err(reason.into()));
                processed += 1;
                continue;
            }

            let iovecs = sys::iovecs_from_request(pending.op.buffers());
            let attempt = match pending.op.kind() {
                OperationKind::Read => {
                    sys::attempt_readv(&pending.op.handle(), &iovecs, pending.op.offset())
                }
                OperationKind::Write => {
                    sys::attempt_writev(&pending.op.handle(), &iovecs, pending.op.offset())
                }
                OperationKind::Barrier(_) => unreachable!("barriers never enlist"),
            };

            match attempt {
                sys::Attempt::WouldBlock => {
                    // Someone else consumed the readiness; re-suspend at the front of the
                    // queue so FIFO order is preserved.
                    let mut state = self.state();

                    if let Some(reg) = state.registrations.get_mut(&fd) {
                        if matches!(pending.op.kind(), OperationKind::Read) {
                            reg.read_waiters.push_front(key);
                        } else {
                            reg.write_waiters.push_front(key);
                        }
                    }
                    if let Some(expiry) = pending.steady_expiry {
                        state.steady_deadlines.insert((expiry, key), ());
                    }
                    if let Some(expiry) = pending.wall_expiry {
                        state.wall_deadlines.insert((expiry, key), ());
                    }
                    state.pending.insert(key, pending);

                    self.arm_interest(&state, fd);
                    break;
                }
                sys::Attempt::Transferred(n) => {
                    event!(Level::TRACE, message = "operation completed", key, bytes = n);
                    let segments = crate::split_transfer(n, &pending.op.buffers().capacities());
                    self.finish(pending.op, Ok(IoOutcome::new(segments)));
                    processed += 1;
                }
                sys::Attempt::Failed(e) => {
                    event!(Level::TRACE, message = "operation failed", key, error = %e);
                    self.finish(pending.op, Err(e));
                    processed += 1;
                }
            }
        }

        // Whatever remains waiting needs its interest re-armed (the event consumed the
        // one-shot arming).
        {
            let state = self.state();
            self.arm_interest(&state, fd);
        }

        processed
    }

    /// Completes every operation whose deadline has passed, up to `max_items`.
    fn process_expired(&self, max_items: usize) -> usize {
        let mut processed = 0;
        let now_steady = Instant::now();
        let now_wall = SystemTime::now();

        while processed < max_items {
            let candidate = {
                let mut state = self.state();

                let steady_key = state
                    .steady_deadlines
                    .first_key_value()
                    .filter(|((expiry, _), ())| *expiry <= now_steady)
                    .map(|((_, key), ())| *key);

                let key = steady_key.or_else(|| {
                    state
                        .wall_deadlines
                        .first_key_value()
                        .filter(|((expiry, _), ())| *expiry <= now_wall)
                        .map(|((_, key), ())| *key)
                });

                key.and_then(|key| {
                    let pending = Self::detach_locked(&mut state, key);
                    if let Some(p) = &pending {
                        self.arm_interest(&state, p.op.handle().fd());
                    }
                    pending.map(|p| (key, p))
                })
            };

            let Some((key, pending)) = candidate else {
                break;
            };

            event!(Level::TRACE, message = "operation timed out", key);
            self.finish(pending.op, Err(Error::TimedOut));
            processed += 1;
        }

        processed
    }

    /// Delivers cancellations requested since the last pass, up to `max_items`.
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
            let candidate = {
                let mut state = self.state();

                if processed >= max_items {
                    // Out of budget; requeue for the next pass.
                    state.cancel_requests.push(key);
                    continue;
                }

                let pending = Self::detach_locked(&mut state, key);
                if let Some(p) = &pending {
                    self.arm_interest(&state, p.op.handle().fd());
                }
                pending
            };

            if let Some(pending) = candidate {
                let reason = pending.cancel_reason.unwrap_or(CancelReason::Canceled);
                event!(Level::TRACE, message = "operation canceled", key);
                self.finish(pending.op, Err(reason.into()));
                processed += 1;
            }
        }

        processed
    }

    /// One kernel wait plus processing of whatever it returned. `budget` is a soft bound:
    /// every dequeued readiness event is honored in full, because one-shot arming means a
    /// dequeued event not acted upon would strand its waiters.
    fn poll_completions(&self, budget: usize, timeout: Option<Duration>) -> Result<usize> {
        if budget == 0 {
            return Ok(0);
        }

        let max_events = budget.clamp(1, POLL_SIZE_EVENTS);
        // SAFETY: epoll_event is plain old data; the kernel fills what it reports.
        let mut events: [libc::epoll_event; POLL_SIZE_EVENTS] = unsafe { std::mem::zeroed() };

        self.sleepers.fetch_add(1, Ordering::SeqCst);
        // SAFETY: The event buffer outlives the call and max_events is within its length.
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                libc::c_int::try_from(max_events).unwrap_or(1),
                sys::timeout_millis(timeout),
            )
        };
        self.sleepers.fetch_sub(1, Ordering::SeqCst);

        if n < 0 {
            return match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => Ok(0),
                _ => Err(Error::last_os_error()),
            };
        }

        let mut processed = 0;

        #[expect(clippy::cast_sign_loss, reason = "guarded by the n < 0 branch above")]
        for ev in events.iter().take(n as usize) {
            let key = ev.u64;
            if key == WAKE_KEY {
                // The wake already achieved its goal by getting us here.
                self.consume_wake();
                continue;
            }

            #[expect(
                clippy::cast_possible_truncation,
                reason = "registration keys are descriptors by construction"
            )]
            let fd = key as RawFd;
            processed += self.process_ready_fd(fd, ev.events);
        }

        Ok(processed)
    }

    /// Computes how long a completion wait may sleep: the earliest of the caller's budget
    /// and both deadline indexes.
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

    /// Drains posted work, bounded by `max_items` and the anchor's budget.
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
            // Leftover work needs another loop pass; make sure one happens.
            self.wake(1);
        }

        executed
    }
}

impl IoMultiplexer for EpollMultiplexer {
    fn register_handle(&self, handle: &NativeHandle) -> Result<()> {
        if !handle.is_valid() {
            return Err(Error::InvalidArgument("handle is invalid"));
        }

        let fd = handle.fd();
        let pollable =
            !(handle.is_regular() || handle.is_directory() || handle.is_in_process_only());

        {
            let mut state = self.state();
            if state.registrations.contains_key(&fd) {
                return Ok(());
            }

            if pollable {
                // Readiness suspension requires that the attempted syscalls report
                // would-block instead of sleeping.
                sys::set_nonblocking(fd)?;

                let mut ev = libc::epoll_event {
                    // Disarmed (and one-shot) until an operation expresses interest.
                    events: libc::EPOLLONESHOT as u32,
                    u64: fd as u64,
                };
                // SAFETY: Adding a descriptor the caller owns to our epoll instance.
                if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0
                {
                    return Err(Error::last_os_error());
                }
            }

            state.registrations.insert(
                fd,
                Registration {
                    pollable,
                    ..Registration::default()
                },
            );
        }

        event!(Level::TRACE, message = "handle registered", fd, pollable);
        Ok(())
    }

    fn deregister_handle(&self, handle: &NativeHandle) -> Result<()> {
        let fd = handle.fd();

        let removed = {
            let mut state = self.state();

            match state.registrations.get(&fd) {
                None => return Ok(()),
                Some(reg) if !reg.read_waiters.is_empty() || !reg.write_waiters.is_empty() => {
                    return Err(Error::InvalidArgument(
                        "cannot deregister a handle with I/O outstanding",
                    ));
                }
                Some(_) => state
                    .registrations
                    .remove(&fd)
                    .expect("presence checked above"),
            }
        };

        if removed.pollable {
            // SAFETY: Removing a descriptor we previously added; failure (e.g. the
            // descriptor was closed already) leaves nothing to clean up.
            unsafe {
                libc::epoll_ctl(
                    self.epoll_fd,
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                );
            }
        }

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
                // Already completed (or never pending); cancellation lost the race.
                return Ok(());
            };

            if pending.cancel_reason.is_none() {
                pending.cancel_reason = Some(CancelReason::Canceled);
            }
            state.cancel_requests.push(id.0);
        }

        event!(Level::TRACE, message = "cancellation requested", key = id.0);

        // A loop thread must deliver the cancellation; make sure one wakes up.
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

            // Posted work counts as progress: poll for completions without blocking so a
            // busy posting caller cannot starve I/O, then return.
            let timeout = if processed > 0 {
                Some(Duration::ZERO)
            } else {
                self.sleep_budget(&anchor)
            };

            processed += self.poll_completions(max_items.saturating_sub(processed), timeout)?;
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

            processed += self.poll_completions(max_items.saturating_sub(processed), timeout)?;

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
            // If a loop thread is blocked in the kernel, this gets the work picked up with
            // minimal latency; otherwise the token is consumed by the next wait.
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

impl Drop for EpollMultiplexer {
    fn drop(&mut self) {
        if !thread::panicking() {
            // Destroying the multiplexer while handles are still transacting is a fatal
            // programming error: receivers that will never run and kernel interest in
            // freed state.
            assert_eq!(
                self.pending_io(),
                0,
                "multiplexer dropped with I/O still in flight"
            );
        }

        sys::close_fd(self.wake_fd);
        sys::close_fd(self.epoll_fd);
    }
}

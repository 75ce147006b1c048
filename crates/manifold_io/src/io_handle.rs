// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tracing::{event, Level};

use crate::multiplexer::run_until_complete;
use crate::{
    sys, Buffer, BarrierKind, ConstBuffer, Deadline, DeadlineAnchor, Disposition, Error,
    IoMultiplexer, IoRequest, NativeHandle, OperationConnection, OperationId, OperationKind,
    RegisteredBuffer, RequestBuffers, Result,
};

/// A handle to something capable of scatter-gather byte I/O.
///
/// The handle owns its kernel object: construction wraps, destruction closes, and
/// [`take()`][Self::take] releases the raw descriptor without closing.
///
/// When a multiplexer has been attached via [`set_multiplexer()`][Self::set_multiplexer],
/// [`read()`][Self::read], [`write()`][Self::write] and [`barrier()`][Self::barrier] are
/// forwarded to it. Otherwise a synchronous default executes the operation directly with
/// blocking syscalls; deadlined calls on non-blocking-capable handles emulate the wait with
/// the kernel's readiness poll, at the cost of extra syscalls per operation.
#[derive(Debug)]
pub struct IoHandle {
    native: NativeHandle,
    multiplexer: Option<Arc<dyn IoMultiplexer>>,
}

impl IoHandle {
    /// Wraps a native handle, taking ownership of the kernel object: it is closed when the
    /// `IoHandle` is dropped.
    ///
    /// The disposition must describe the descriptor truthfully; the capability checks on
    /// every operation are driven by it.
    #[must_use]
    pub const fn from_native(native: NativeHandle) -> Self {
        Self {
            native,
            multiplexer: None,
        }
    }

    /// Creates an anonymous pipe pair, returned as (read end, write end). Both ends start
    /// out blocking.
    pub fn pipe() -> Result<(Self, Self)> {
        let mut fds = [0 as RawFd; 2];

        // SAFETY: Plain pipe creation into a live out-array.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::last_os_error());
        }

        let reader = Self::from_native(NativeHandle::new(
            fds[0],
            Disposition::READABLE | Disposition::PIPE,
        ));
        let writer = Self::from_native(NativeHandle::new(
            fds[1],
            Disposition::WRITABLE | Disposition::PIPE,
        ));

        Ok((reader, writer))
    }

    /// The wrapped native handle (a copy; the `IoHandle` retains ownership).
    #[must_use]
    pub const fn native_handle(&self) -> NativeHandle {
        self.native
    }

    /// Releases the kernel object without closing it, consuming the handle. The handle is
    /// deregistered from any attached multiplexer first.
    #[must_use]
    pub fn take(mut self) -> NativeHandle {
        if let Some(multiplexer) = self.multiplexer.take() {
            let _ = multiplexer.deregister_handle(&self.native);
        }

        std::mem::replace(&mut self.native, NativeHandle::invalid())
    }

    /// Switches the descriptor into non-blocking mode, marking the handle as capable of
    /// multiplexed I/O. Required for deadlined I/O through the synchronous default path.
    pub fn set_nonblocking(&mut self) -> Result<()> {
        sys::set_nonblocking(self.native.fd())?;
        self.native.merge_disposition(Disposition::OVERLAPPED);
        Ok(())
    }

    /// The multiplexer this handle will use to multiplex I/O, if one has been attached.
    #[must_use]
    pub fn multiplexer(&self) -> Option<&Arc<dyn IoMultiplexer>> {
        self.multiplexer.as_ref()
    }

    /// Sets the multiplexer this handle will use to implement `read()`, `write()` and
    /// `barrier()`, or detaches with `None`.
    ///
    /// This deregisters the handle from any existing multiplexer and registers it with the
    /// new one, so it must not be called while any I/O is outstanding on the handle. Note
    /// that registration may switch the descriptor into non-blocking mode.
    pub fn set_multiplexer(&mut self, multiplexer: Option<Arc<dyn IoMultiplexer>>) -> Result<()> {
        if let (Some(current), Some(new)) = (&self.multiplexer, &multiplexer) {
            if Arc::ptr_eq(current, new) {
                return Ok(());
            }
        }

        if let Some(current) = self.multiplexer.take() {
            current.deregister_handle(&self.native)?;
        }

        if let Some(new) = multiplexer {
            new.register_handle(&self.native)?;

            // Registration makes pollable handles participate in multiplexed I/O, which on
            // this platform means non-blocking mode.
            if !self.native.is_regular()
                && !self.native.is_directory()
                && !self.native.is_in_process_only()
            {
                self.native.merge_disposition(Disposition::OVERLAPPED);
            }

            self.multiplexer = Some(new);
        }

        Ok(())
    }

    /// The *maximum* number of buffers which a single operation can process at a time for
    /// this specific open handle, preferring any attached multiplexer's answer over the
    /// platform default.
    ///
    /// Handles whose I/O happens entirely in user space report `0`.
    #[must_use]
    pub fn max_buffers(&self) -> usize {
        if let Some(multiplexer) = &self.multiplexer {
            return multiplexer.max_buffers(&self.native);
        }

        if self.native.is_in_process_only() {
            return 0;
        }
        sys::iov_max()
    }

    /// Requests the allocation of a new registered I/O buffer suitable for maximum
    /// performance I/O, preferring any attached multiplexer's allocator.
    ///
    /// The size may be rounded up considerably; always use the length of the returned
    /// buffer.
    pub fn allocate_registered_buffer(&self, len: usize) -> Result<RegisteredBuffer> {
        if let Some(multiplexer) = &self.multiplexer {
            return multiplexer.allocate_registered_buffer(len);
        }
        RegisteredBuffer::allocate(len)
    }

    /// Reads data from the handle into the request's buffers, starting at the request's
    /// offset.
    ///
    /// Returns the prefix of the request's buffers that transferred data, each descriptor's
    /// length updated to the bytes transferred for that segment; the sequence ends at the
    /// first short segment. Depending on the backend the returned descriptors may point at
    /// *different memory* than was submitted - always read through the returned
    /// descriptors.
    ///
    /// A zero deadline polls: it returns whatever has already completed, or
    /// [`Error::TimedOut`] without blocking.
    pub fn read<'a>(
        &self,
        req: IoRequest<'a, Buffer>,
        deadline: Deadline,
    ) -> Result<&'a mut [Buffer]> {
        if let Some(multiplexer) = &self.multiplexer {
            let offset = req.offset;
            let descriptors = req.buffers.to_vec();

            let outcome = run_until_complete(multiplexer.as_ref(), deadline, move |receiver| {
                multiplexer.start_read(
                    OperationConnection::read(self, descriptors, offset, receiver)
                        .with_deadline(deadline),
                )
            })?;

            return Ok(apply_segments(req.buffers, outcome.segments()));
        }

        self.read_fallback(req, deadline)
    }

    /// Writes data from the request's buffers to the handle at the request's offset.
    ///
    /// Returns the prefix of the request's buffers actually written, lengths updated. Not
    /// all buffers may be consumed; append-only handles ignore the offset and append
    /// atomically with respect to other appenders on the same inode. When the filing
    /// system does not auto-extend, writing beyond end-of-file fails; extend first.
    pub fn write<'a>(
        &self,
        req: IoRequest<'a, ConstBuffer>,
        deadline: Deadline,
    ) -> Result<&'a mut [ConstBuffer]> {
        if let Some(multiplexer) = &self.multiplexer {
            let offset = req.offset;
            let descriptors = req.buffers.to_vec();

            let outcome = run_until_complete(multiplexer.as_ref(), deadline, move |receiver| {
                multiplexer.start_write(
                    OperationConnection::write(self, descriptors, offset, receiver)
                        .with_deadline(deadline),
                )
            })?;

            return Ok(apply_const_segments(req.buffers, outcome.segments()));
        }

        self.write_fallback(req, deadline)
    }

    /// Issues a write reordering barrier such that writes preceding the barrier reach
    /// storage before writes after it.
    ///
    /// **Assume that this call is a no-op**: it is advisory, and many configurations
    /// (containers, non-default mount options) silently ignore it. Code that needs
    /// durability must open the handle with write-through caching instead. Barriers order
    /// writes for a single handle only.
    ///
    /// An empty request barriers the whole handle; otherwise the request's offset and
    /// buffer lengths describe the range to barrier.
    pub fn barrier<'a>(
        &self,
        req: IoRequest<'a, ConstBuffer>,
        kind: BarrierKind,
        deadline: Deadline,
    ) -> Result<&'a mut [ConstBuffer]> {
        if let Some(multiplexer) = &self.multiplexer {
            let offset = req.offset;
            let descriptors = req.buffers.to_vec();

            let outcome = run_until_complete(multiplexer.as_ref(), deadline, move |receiver| {
                multiplexer.start_barrier(
                    OperationConnection::barrier(self, descriptors, kind, receiver)
                        .with_deadline(deadline),
                )
            })?;

            return Ok(apply_const_segments(req.buffers, outcome.segments()));
        }

        let range_len = req.buffers.iter().map(ConstBuffer::len).sum();
        sys::execute_barrier(&self.native, kind, req.offset, range_len)?;

        event!(
            Level::TRACE,
            message = "barrier executed",
            fd = self.native.fd(),
            kind = %kind
        );

        let segments: Vec<usize> = req.buffers.iter().map(ConstBuffer::len).collect();
        Ok(apply_const_segments(req.buffers, &segments))
    }

    /// Convenience single-buffer read returning the byte count.
    pub fn read_at(&self, offset: u64, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        let mut buffers = [Buffer::from_slice(buf)];
        let filled = self.read(IoRequest::new(&mut buffers, offset), deadline)?;
        Ok(filled.iter().map(Buffer::len).sum())
    }

    /// Convenience single-buffer write returning the byte count.
    pub fn write_at(&self, offset: u64, buf: &[u8], deadline: Deadline) -> Result<usize> {
        let mut buffers = [ConstBuffer::from_slice(buf)];
        let written = self.write(IoRequest::new(&mut buffers, offset), deadline)?;
        Ok(written.iter().map(ConstBuffer::len).sum())
    }

    /// Submits an asynchronous read through the attached multiplexer.
    ///
    /// Fails with [`Error::NotSupported`] when no multiplexer is attached; the operation's
    /// receiver is not invoked in that case, as the operation was never started.
    pub fn async_read(&self, op: OperationConnection) -> Result<OperationId> {
        match &self.multiplexer {
            Some(multiplexer) => multiplexer.start_read(op),
            None => Err(Error::NotSupported(
                "asynchronous I/O requires an attached multiplexer",
            )),
        }
    }

    /// Submits an asynchronous write through the attached multiplexer.
    pub fn async_write(&self, op: OperationConnection) -> Result<OperationId> {
        match &self.multiplexer {
            Some(multiplexer) => multiplexer.start_write(op),
            None => Err(Error::NotSupported(
                "asynchronous I/O requires an attached multiplexer",
            )),
        }
    }

    /// Submits an asynchronous barrier through the attached multiplexer.
    pub fn async_barrier(&self, op: OperationConnection) -> Result<OperationId> {
        match &self.multiplexer {
            Some(multiplexer) => multiplexer.start_barrier(op),
            None => Err(Error::NotSupported(
                "asynchronous I/O requires an attached multiplexer",
            )),
        }
    }

    fn read_fallback<'a>(
        &self,
        req: IoRequest<'a, Buffer>,
        deadline: Deadline,
    ) -> Result<&'a mut [Buffer]> {
        self.check_fallback_deadline(deadline)?;
        sys::validate_request(
            &self.native,
            OperationKind::Read,
            &RequestBuffers::Scatter(req.buffers.to_vec()),
            req.offset,
            self.max_buffers(),
        )?;

        let anchor = DeadlineAnchor::new(deadline);
        let iovecs = sys::iovecs_from_buffers(req.buffers);

        loop {
            match sys::attempt_readv(&self.native, &iovecs, req.offset) {
                sys::Attempt::Transferred(n) => {
                    let segments = crate::split_transfer(
                        n,
                        &req.buffers.iter().map(Buffer::len).collect::<Vec<_>>(),
                    );
                    return Ok(apply_segments(req.buffers, &segments));
                }
                sys::Attempt::Failed(e) => return Err(e),
                sys::Attempt::WouldBlock => {
                    self.wait_for_readiness(true, &anchor)?;
                }
            }
        }
    }

    fn write_fallback<'a>(
        &self,
        req: IoRequest<'a, ConstBuffer>,
        deadline: Deadline,
    ) -> Result<&'a mut [ConstBuffer]> {
        self.check_fallback_deadline(deadline)?;
        sys::validate_request(
            &self.native,
            OperationKind::Write,
            &RequestBuffers::Gather(req.buffers.to_vec()),
            req.offset,
            self.max_buffers(),
        )?;

        let anchor = DeadlineAnchor::new(deadline);
        let iovecs = sys::iovecs_from_const_buffers(req.buffers);

        loop {
            match sys::attempt_writev(&self.native, &iovecs, req.offset) {
                sys::Attempt::Transferred(n) => {
                    let segments = crate::split_transfer(
                        n,
                        &req.buffers.iter().map(ConstBuffer::len).collect::<Vec<_>>(),
                    );
                    return Ok(apply_const_segments(req.buffers, &segments));
                }
                sys::Attempt::Failed(e) => return Err(e),
                sys::Attempt::WouldBlock => {
                    self.wait_for_readiness(false, &anchor)?;
                }
            }
        }
    }

    /// Deadline policy of the synchronous default path: infinite deadlines use plain
    /// blocking syscalls; finite deadlines require a handle capable of non-blocking
    /// operation, whose waits are emulated with the kernel's readiness poll.
    fn check_fallback_deadline(&self, deadline: Deadline) -> Result<()> {
        if !deadline.is_infinite() && !self.native.is_overlapped() {
            return Err(Error::NotSupported(
                "deadlined I/O requires a non-blocking capable handle",
            ));
        }

        Ok(())
    }

    /// Sleeps until the descriptor is ready or the operation's budget is exhausted.
    fn wait_for_readiness(&self, want_read: bool, anchor: &DeadlineAnchor) -> Result<()> {
        let remaining = anchor.remaining();

        if remaining == Some(std::time::Duration::ZERO) {
            return Err(Error::TimedOut);
        }

        let ready =
            sys::poll_readiness(self.native.fd(), want_read, !want_read, remaining)?;
        if !ready {
            return Err(Error::TimedOut);
        }

        Ok(())
    }
}

impl AsRawFd for IoHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.native.fd()
    }
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        if let Some(multiplexer) = self.multiplexer.take() {
            // Best effort: with I/O outstanding this is refused, and the close below then
            // invalidates the descriptor anyway.
            let _ = multiplexer.deregister_handle(&self.native);
        }

        if self.native.is_valid() {
            sys::close_fd(self.native.fd());
        }
    }
}

/// Applies per-segment transfer lengths to the caller's descriptors and returns the
/// transferred prefix.
fn apply_segments<'a>(buffers: &'a mut [Buffer], segments: &[usize]) -> &'a mut [Buffer] {
    for (buffer, transferred) in buffers.iter_mut().zip(segments) {
        buffer.truncate(*transferred);
    }
    &mut buffers[..segments.len()]
}

fn apply_const_segments<'a>(
    buffers: &'a mut [ConstBuffer],
    segments: &[usize],
) -> &'a mut [ConstBuffer] {
    for (buffer, transferred) in buffers.iter_mut().zip(segments) {
        buffer.truncate(*transferred);
    }
    &mut buffers[..segments.len()]
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::io::IntoRawFd;
    use std::time::{Duration, Instant};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{IoOutcome, MockIoMultiplexer};

    fn temp_file_handle(name: &str) -> (IoHandle, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "manifold_io_{}_{}_{name}",
            std::process::id(),
            std::thread::current().name().unwrap_or("main").replace("::", "_"),
        ));

        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let handle = IoHandle::from_native(NativeHandle::new(
            file.into_raw_fd(),
            Disposition::READABLE
                | Disposition::WRITABLE
                | Disposition::SEEKABLE
                | Disposition::FILE,
        ));

        (handle, path)
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(IoHandle: Send, Sync);
    }

    #[test]
    fn pipe_round_trip_with_thread() {
        let (reader, writer) = IoHandle::pipe().unwrap();

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let written = writer.write_at(0, b"hello", Deadline::infinite()).unwrap();
            assert_eq!(written, 5);
        });

        // Blocking read with no deadline: sleeps until the writer delivers.
        let mut storage = [0_u8; 64];
        let n = reader
            .read_at(0, &mut storage, Deadline::infinite())
            .unwrap();

        assert_eq!(n, 5);
        assert_eq!(&storage[..5], b"hello");
        t.join().unwrap();
    }

    #[test]
    fn scatter_read_reports_prefix() {
        let (reader, writer) = IoHandle::pipe().unwrap();
        writer.write_at(0, b"abcdefgh", Deadline::infinite()).unwrap();

        let mut first = [0_u8; 4];
        let mut second = [0_u8; 16];
        let mut buffers = [Buffer::from_slice(&mut first), Buffer::from_slice(&mut second)];

        let filled = reader
            .read(IoRequest::new(&mut buffers, 0), Deadline::infinite())
            .unwrap();

        assert_eq!(filled.len(), 2);
        assert_eq!(filled[0].len(), 4);
        assert_eq!(filled[1].len(), 4);
        assert_eq!(&first, b"abcd");
        assert_eq!(&second[..4], b"efgh");
    }

    #[test]
    fn zero_deadline_on_blocking_pipe_is_not_supported() {
        let (reader, _writer) = IoHandle::pipe().unwrap();

        let mut storage = [0_u8; 8];
        let result = reader.read_at(0, &mut storage, Deadline::zero());
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }

    #[test]
    fn zero_deadline_poll_on_nonblocking_pipe_times_out() {
        let (mut reader, _writer) = IoHandle::pipe().unwrap();
        reader.set_nonblocking().unwrap();

        let mut storage = [0_u8; 8];
        let result = reader.read_at(0, &mut storage, Deadline::zero());
        assert!(matches!(result, Err(Error::TimedOut)));
    }

    #[test]
    fn deadline_expires_on_quiet_nonblocking_pipe() {
        let (mut reader, _writer) = IoHandle::pipe().unwrap();
        reader.set_nonblocking().unwrap();

        let mut storage = [0_u8; 8];
        let started = Instant::now();
        let result = reader.read_at(0, &mut storage, Duration::from_millis(50).into());

        assert!(matches!(result, Err(Error::TimedOut)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn write_to_read_end_is_not_permitted() {
        let (reader, _writer) = IoHandle::pipe().unwrap();

        let result = reader.write_at(0, b"nope", Deadline::infinite());
        assert!(matches!(result, Err(Error::NotPermitted(_))));
    }

    #[test]
    fn read_from_write_end_is_not_permitted() {
        let (_reader, writer) = IoHandle::pipe().unwrap();

        let mut storage = [0_u8; 8];
        let result = writer.read_at(0, &mut storage, Deadline::infinite());
        assert!(matches!(result, Err(Error::NotPermitted(_))));
    }

    #[test]
    fn file_positioned_round_trip_and_barrier() {
        let (handle, path) = temp_file_handle("positioned");

        assert_eq!(
            handle
                .write_at(3, b"positioned", Deadline::infinite())
                .unwrap(),
            10
        );

        let mut storage = [0_u8; 10];
        assert_eq!(
            handle
                .read_at(3, &mut storage, Deadline::infinite())
                .unwrap(),
            10
        );
        assert_eq!(&storage, b"positioned");

        // Whole-handle barrier, then a ranged scheduled one.
        let mut none: [ConstBuffer; 0] = [];
        handle
            .barrier(
                IoRequest::new(&mut none, 0),
                BarrierKind::WaitAll,
                Deadline::infinite(),
            )
            .unwrap();

        let range = [0_u8; 10];
        let mut ranged = [ConstBuffer::from_slice(&range)];
        handle
            .barrier(
                IoRequest::new(&mut ranged, 3),
                BarrierKind::NowaitDataOnly,
                Deadline::infinite(),
            )
            .unwrap();

        drop(handle);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn barrier_on_pipe_is_an_advisory_no_op() {
        let (_reader, writer) = IoHandle::pipe().unwrap();

        let mut none: [ConstBuffer; 0] = [];
        let barriered = writer
            .barrier(
                IoRequest::new(&mut none, 0),
                BarrierKind::WaitDataOnly,
                Deadline::infinite(),
            )
            .unwrap();
        assert!(barriered.is_empty());
    }

    #[test]
    fn too_many_buffers_is_invalid() {
        let (reader, _writer) = IoHandle::pipe().unwrap();

        let mut storage = vec![0_u8; 8];
        let buffer = Buffer::from_slice(&mut storage);
        let mut buffers = vec![buffer; reader.max_buffers() + 1];

        let result = reader.read(IoRequest::new(&mut buffers, 0), Deadline::infinite());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn max_buffers_reports_platform_width() {
        let (reader, _writer) = IoHandle::pipe().unwrap();
        assert!(reader.max_buffers() >= 16);

        let section = IoHandle::from_native(NativeHandle::new(
            // Descriptor value is irrelevant; the handle is never used for I/O.
            reader.as_raw_fd(),
            Disposition::READABLE | Disposition::SECTION,
        ));
        assert_eq!(section.max_buffers(), 0);
        // Not ours to close.
        let _ = section.take();
    }

    #[test]
    fn registered_buffer_allocation_through_the_handle() {
        let (reader, _writer) = IoHandle::pipe().unwrap();
        let buffer = reader.allocate_registered_buffer(100).unwrap();
        assert!(buffer.len() >= 100);
        assert_eq!(buffer.len() % crate::page_size(), 0);
    }

    #[test]
    fn async_submission_without_multiplexer_is_not_supported() {
        let (reader, _writer) = IoHandle::pipe().unwrap();

        let mut storage = vec![0_u8; 8];
        let op = OperationConnection::read(
            &reader,
            vec![Buffer::from_slice(&mut storage)],
            0,
            |_result| panic!("receiver must not run for an unstarted operation"),
        );

        assert!(matches!(
            reader.async_read(op),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn attached_multiplexer_intercepts_reads() {
        let mut mock = MockIoMultiplexer::new();

        mock.expect_register_handle().times(1).returning(|_| Ok(()));
        mock.expect_start_read().times(1).returning(|op| {
            // Complete synchronously with a 3-byte transfer, as a backend would for
            // buffered data.
            let id = OperationId(1);
            op.complete(Ok(IoOutcome::new(vec![3])));
            Ok(id)
        });
        mock.expect_deregister_handle()
            .times(1)
            .returning(|_| Ok(()));

        let multiplexer: Arc<dyn IoMultiplexer> = Arc::new(mock);

        let (mut reader, _writer) = IoHandle::pipe().unwrap();
        reader.set_multiplexer(Some(multiplexer)).unwrap();

        let mut storage = [0_u8; 8];
        let n = reader
            .read_at(0, &mut storage, Deadline::infinite())
            .unwrap();
        assert_eq!(n, 3);

        // Dropping the handle deregisters (the mock asserts the call count).
        drop(reader);
    }

    #[test]
    fn set_multiplexer_is_idempotent_for_the_same_instance() {
        let mut mock = MockIoMultiplexer::new();
        mock.expect_register_handle().times(1).returning(|_| Ok(()));
        mock.expect_deregister_handle()
            .times(1)
            .returning(|_| Ok(()));

        let multiplexer: Arc<dyn IoMultiplexer> = Arc::new(mock);

        let (mut reader, _writer) = IoHandle::pipe().unwrap();
        reader.set_multiplexer(Some(Arc::clone(&multiplexer))).unwrap();
        reader.set_multiplexer(Some(Arc::clone(&multiplexer))).unwrap();
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thin wrappers over the POSIX syscalls shared by the synchronous fallback path and the
//! multiplexer backends. Everything here is non-blocking with respect to locks: callers
//! decide what to hold while calling.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::{
    BarrierKind, Buffer, ConstBuffer, Error, NativeHandle, OperationKind, RequestBuffers, Result,
    ALIGNED_IO_ALIGNMENT,
};

/// The immediate outcome of issuing one scatter-gather syscall.
#[derive(Debug)]
pub(crate) enum Attempt {
    /// The kernel transferred this many bytes (possibly zero, e.g. end-of-file).
    Transferred(usize),
    /// The handle is non-blocking and has no data or no space right now.
    WouldBlock,
    /// The kernel rejected the request.
    Failed(Error),
}

pub(crate) fn iovecs_from_buffers(buffers: &[Buffer]) -> Vec<libc::iovec> {
    buffers
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.data().cast(),
            iov_len: b.len(),
        })
        .collect()
}

pub(crate) fn iovecs_from_const_buffers(buffers: &[ConstBuffer]) -> Vec<libc::iovec> {
    buffers
        .iter()
        .map(|b| libc::iovec {
            // The kernel will not write through a gather iovec; the cast is for the
            // common iovec layout only.
            iov_base: b.data().cast_mut().cast(),
            iov_len: b.len(),
        })
        .collect()
}

pub(crate) fn iovecs_from_request(buffers: &RequestBuffers) -> Vec<libc::iovec> {
    match buffers {
        RequestBuffers::Scatter(buffers) => iovecs_from_buffers(buffers),
        RequestBuffers::Gather(buffers) => iovecs_from_const_buffers(buffers),
    }
}

/// Issues one vectored read against the handle: positioned when the handle is seekable,
/// current-position otherwise.
pub(crate) fn attempt_readv(handle: &NativeHandle, iovecs: &[libc::iovec], offset: u64) -> Attempt {
    attempt_loop(|| {
        // SAFETY: The iovecs describe memory the caller guarantees valid for the call.
        unsafe {
            if handle.is_seekable() {
                libc::preadv(
                    handle.fd(),
                    iovecs.as_ptr(),
                    iovec_count(iovecs),
                    offset_arg(offset),
                )
            } else {
                libc::readv(handle.fd(), iovecs.as_ptr(), iovec_count(iovecs))
            }
        }
    })
}

/// Issues one vectored write against the handle. Append-only handles ignore the offset:
/// the descriptor was opened `O_APPEND`, so bytes land at end-of-file atomically with
/// respect to other appenders on the same inode.
pub(crate) fn attempt_writev(handle: &NativeHandle, iovecs: &[libc::iovec], offset: u64) -> Attempt {
    attempt_loop(|| {
        // SAFETY: The iovecs describe memory the caller guarantees valid for the call.
        unsafe {
            if handle.is_seekable() && !handle.is_append_only() {
                libc::pwritev(
                    handle.fd(),
                    iovecs.as_ptr(),
                    iovec_count(iovecs),
                    offset_arg(offset),
                )
            } else {
                libc::writev(handle.fd(), iovecs.as_ptr(), iovec_count(iovecs))
            }
        }
    })
}

fn attempt_loop(mut syscall: impl FnMut() -> libc::ssize_t) -> Attempt {
    loop {
        let n = syscall();

        if n >= 0 {
            #[expect(clippy::cast_sign_loss, reason = "guarded by the n >= 0 branch")]
            return Attempt::Transferred(n as usize);
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EAGAIN) => return Attempt::WouldBlock,
            _ => return Attempt::Failed(Error::last_os_error()),
        }
    }
}

fn iovec_count(iovecs: &[libc::iovec]) -> libc::c_int {
    libc::c_int::try_from(iovecs.len()).unwrap_or(libc::c_int::MAX)
}

fn offset_arg(offset: u64) -> libc::off_t {
    libc::off_t::try_from(offset).unwrap_or(libc::off_t::MAX)
}

/// Executes a write-ordering barrier synchronously.
///
/// Barriers are advisory. On handles without a backing filing system (pipes, sections) and
/// on filing systems without the primitive this degrades to a no-op success; code that
/// needs durability must open the handle with write-through caching instead.
pub(crate) fn execute_barrier(
    handle: &NativeHandle,
    kind: BarrierKind,
    range_offset: u64,
    range_len: usize,
) -> Result<()> {
    if !handle.is_regular() && !handle.is_directory() {
        return Ok(());
    }

    let result = if kind.includes_metadata() {
        // SAFETY: Plain syscall on a descriptor we do not touch otherwise.
        unsafe { libc::fsync(handle.fd()) }
    } else if !kind.waits() && range_len > 0 && handle.is_regular() {
        // A scheduled data-only barrier over an explicit range maps onto the kernel's
        // ranged writeback primitive where present.
        ranged_writeback(handle.fd(), range_offset, range_len)
    } else {
        // SAFETY: As above.
        unsafe { libc::fdatasync(handle.fd()) }
    };

    if result == 0 {
        return Ok(());
    }

    match std::io::Error::last_os_error().raw_os_error() {
        // The filing system does not provide the primitive; the barrier is advisory.
        Some(libc::EINVAL | libc::EROFS | libc::ENOSYS) => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

#[cfg(target_os = "linux")]
fn ranged_writeback(fd: RawFd, offset: u64, len: usize) -> libc::c_int {
    // SAFETY: Plain syscall on a descriptor the caller owns.
    unsafe {
        libc::sync_file_range(
            fd,
            libc::off64_t::try_from(offset).unwrap_or(libc::off64_t::MAX),
            libc::off64_t::try_from(len).unwrap_or(libc::off64_t::MAX),
            libc::SYNC_FILE_RANGE_WRITE,
        )
    }
}

#[cfg(not(target_os = "linux"))]
fn ranged_writeback(fd: RawFd, _offset: u64, _len: usize) -> libc::c_int {
    // SAFETY: Plain syscall on a descriptor the caller owns.
    unsafe { libc::fdatasync(fd) }
}

/// Sleeps until the descriptor reports the requested readiness or the timeout elapses.
/// Returns whether the descriptor became ready.
pub(crate) fn poll_readiness(
    fd: RawFd,
    want_read: bool,
    want_write: bool,
    timeout: Option<Duration>,
) -> Result<bool> {
    let mut events: libc::c_short = 0;
    if want_read {
        events |= libc::POLLIN;
    }
    if want_write {
        events |= libc::POLLOUT;
    }

    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };

    loop {
        // SAFETY: pollfd is a live local for the duration of the call.
        let n = unsafe { libc::poll(&mut pollfd, 1, timeout_millis(timeout)) };

        if n > 0 {
            return Ok(true);
        }
        if n == 0 {
            return Ok(false);
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => {}
            _ => return Err(Error::last_os_error()),
        }
    }
}

/// Converts an optional wait budget into poll/epoll milliseconds, rounding up so a short
/// budget cannot spin as a sequence of zero-length sleeps. `None` means wait forever.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let millis = duration.as_millis();
            let rounded = if duration.subsec_nanos() % 1_000_000 == 0 {
                millis
            } else {
                millis + 1
            };
            libc::c_int::try_from(rounded).unwrap_or(libc::c_int::MAX)
        }
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::last_os_error());
        }

        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::last_os_error());
        }
    }

    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    // SAFETY: The caller owns the descriptor and will not use it again.
    unsafe {
        libc::close(fd);
    }
}

/// The system's scatter-gather fan-out limit for a single syscall.
pub(crate) fn iov_max() -> usize {
    // SAFETY: sysconf is always safe to call.
    let value = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };

    usize::try_from(value).unwrap_or(1024)
}

/// Validates a request against the handle's capabilities, the multiplexer's scatter-gather
/// width and the aligned-I/O constraints.
pub(crate) fn validate_request(
    handle: &NativeHandle,
    kind: OperationKind,
    buffers: &RequestBuffers,
    offset: u64,
    max_buffers: usize,
) -> Result<()> {
    if !handle.is_valid() {
        return Err(Error::InvalidArgument("handle is invalid"));
    }

    match kind {
        OperationKind::Read => {
            if !handle.is_readable() {
                return Err(Error::NotPermitted("handle is not readable"));
            }
        }
        OperationKind::Write => {
            if !handle.is_writable() {
                return Err(Error::NotPermitted("handle is not writable"));
            }
        }
        // Barriers are permitted on any valid handle; they degrade to no-ops where the
        // handle has nothing to barrier.
        OperationKind::Barrier(_) => {}
    }

    if buffers.len() > max_buffers {
        return Err(Error::InvalidArgument(
            "request exceeds the handle's maximum scatter-gather width",
        ));
    }

    if handle.requires_aligned_io() && !matches!(kind, OperationKind::Barrier(_)) {
        let alignment = ALIGNED_IO_ALIGNMENT as u64;
        if offset % alignment != 0 {
            return Err(Error::InvalidArgument(
                "offset is not aligned for an aligned-I/O handle",
            ));
        }

        if !buffers.is_aligned(ALIGNED_IO_ALIGNMENT) {
            return Err(Error::InvalidArgument(
                "buffer addresses and lengths must be aligned for an aligned-I/O handle",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn timeout_millis_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_millis(5))), 5);
        assert_eq!(timeout_millis(Some(Duration::from_micros(100))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_micros(5_200))), 6);
    }

    #[test]
    fn iov_max_is_sane() {
        assert!(iov_max() >= 16);
    }

    #[test]
    fn poll_times_out_on_quiet_pipe() {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: Plain pipe creation; both ends closed below.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let started = Instant::now();
        let ready =
            poll_readiness(fds[0], true, false, Some(Duration::from_millis(20))).unwrap();
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(20));

        close_fd(fds[0]);
        close_fd(fds[1]);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::{Error, Result};

/// The scatter buffer descriptor used for reads: an (address, length) pair over mutable
/// byte memory.
///
/// This is a trivially-copyable descriptor, not an owner: the memory it points at must remain
/// valid (and not be accessed through any other path) for as long as an I/O operation holds
/// the descriptor. The synchronous [`IoHandle`][1] API enforces this with ordinary borrows;
/// the asynchronous API states it as a submission contract on
/// [`OperationConnection`][2].
///
/// Depending on the backend, the buffers returned from an operation may have a different
/// address and length than those submitted - always use the returned descriptors.
///
/// [1]: crate::IoHandle
/// [2]: crate::OperationConnection
#[derive(Clone, Copy, derive_more::Debug)]
#[debug("Buffer({data:p}, len {len})")]
pub struct Buffer {
    data: *mut u8,
    len: usize,
}

// SAFETY: Buffer is a plain descriptor; it confers no access by itself. The access rules are
// part of the submission contract of the APIs that accept it, which require the caller to
// guarantee exclusive validity of the memory for the duration of the operation.
unsafe impl Send for Buffer {}
// SAFETY: As above - a shared &Buffer only exposes the address and length.
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Describes an exclusively borrowed byte slice.
    ///
    /// The descriptor does not extend the borrow: the caller must keep the slice alive and
    /// untouched until the operation using the descriptor completes.
    #[must_use]
    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self {
            data: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    /// Describes raw memory.
    ///
    /// # Safety
    ///
    /// `data` must point to `len` bytes that remain valid and exclusively reserved for the
    /// I/O subsystem until every operation holding the descriptor completes.
    #[must_use]
    pub const unsafe fn from_raw_parts(data: *mut u8, len: usize) -> Self {
        Self { data, len }
    }

    /// The address of the bytes for this buffer.
    #[must_use]
    pub const fn data(&self) -> *mut u8 {
        self.data
    }

    /// The number of bytes in this buffer.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the described memory as a byte slice.
    ///
    /// # Safety
    ///
    /// The descriptor must point to initialized memory that no in-flight I/O operation and no
    /// other code path is concurrently mutating.
    #[must_use]
    pub const unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.len);
        self.len = len;
    }
}

/// The gather buffer descriptor used for writes and barriers: an (address, length) pair over
/// immutable byte memory.
///
/// The same validity contract applies as for [`Buffer`].
#[derive(Clone, Copy, derive_more::Debug)]
#[debug("ConstBuffer({data:p}, len {len})")]
pub struct ConstBuffer {
    data: *const u8,
    len: usize,
}

// SAFETY: A plain descriptor, as for Buffer.
unsafe impl Send for ConstBuffer {}
// SAFETY: As above.
unsafe impl Sync for ConstBuffer {}

impl ConstBuffer {
    /// Describes a borrowed byte slice.
    ///
    /// The descriptor does not extend the borrow: the caller must keep the slice alive until
    /// the operation using the descriptor completes.
    #[must_use]
    pub const fn from_slice(slice: &[u8]) -> Self {
        Self {
            data: slice.as_ptr(),
            len: slice.len(),
        }
    }

    /// Describes raw memory.
    ///
    /// # Safety
    ///
    /// `data` must point to `len` initialized bytes that remain valid until every operation
    /// holding the descriptor completes.
    #[must_use]
    pub const unsafe fn from_raw_parts(data: *const u8, len: usize) -> Self {
        Self { data, len }
    }

    /// The address of the bytes for this buffer.
    #[must_use]
    pub const fn data(&self) -> *const u8 {
        self.data
    }

    /// The number of bytes in this buffer.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.len);
        self.len = len;
    }
}

impl From<Buffer> for ConstBuffer {
    fn from(buffer: Buffer) -> Self {
        Self {
            data: buffer.data(),
            len: buffer.len(),
        }
    }
}

/// A scatter-gather sequence of buffer descriptors plus the 64-bit extent offset at which
/// the I/O is to be performed.
///
/// For handles that require aligned I/O, every buffer address, every buffer length and the
/// offset must be multiples of the required alignment.
#[derive(Debug)]
pub struct IoRequest<'a, B> {
    /// The scatter-gather buffers, in transfer order.
    pub buffers: &'a mut [B],
    /// The extent offset. Ignored by append-only handles and by handles with no concept
    /// of seeking.
    pub offset: u64,
}

impl<'a, B> IoRequest<'a, B> {
    /// A scatter-gather request at the given extent offset.
    #[must_use]
    pub fn new(buffers: &'a mut [B], offset: u64) -> Self {
        Self { buffers, offset }
    }
}

/// The required alignment for handles carrying the `ALIGNED_IO` disposition.
pub const ALIGNED_IO_ALIGNMENT: usize = 512;

/// Sums the lengths of a completed buffer sequence.
///
/// Each returned buffer's length is the number of bytes transferred for that segment, so the
/// sum is the operation's total transfer.
#[must_use]
pub fn bytes_transferred(buffers: &[ConstBuffer]) -> usize {
    buffers.iter().map(ConstBuffer::len).sum()
}

/// The successful outcome of one asynchronous I/O operation, delivered to its receiver.
///
/// The per-segment lengths follow the prefix rule: segment `i` is the number of bytes
/// transferred for request buffer `i`, the sequence never has more entries than the request,
/// and the first short segment ends the prefix that transferred data.
#[derive(Debug)]
pub struct IoOutcome {
    bytes_transferred: usize,
    segments: Vec<usize>,
}

impl IoOutcome {
    pub(crate) fn new(segments: Vec<usize>) -> Self {
        Self {
            bytes_transferred: segments.iter().sum(),
            segments,
        }
    }

    /// Total bytes transferred across all segments.
    #[must_use]
    pub const fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    /// Bytes transferred per request segment, prefix-truncated.
    #[must_use]
    pub fn segments(&self) -> &[usize] {
        &self.segments
    }
}

/// Distributes a total transfer count across the request's segment lengths, producing the
/// per-segment prefix lengths.
pub(crate) fn split_transfer(total: usize, segment_capacities: &[usize]) -> Vec<usize> {
    let mut remaining = total;
    let mut segments = Vec::with_capacity(segment_capacities.len());

    for capacity in segment_capacities {
        let here = remaining.min(*capacity);
        segments.push(here);
        remaining -= here;

        if here < *capacity {
            break;
        }
    }

    debug_assert_eq!(remaining, 0, "transfer exceeded the request's capacity");
    segments
}

/// A registered I/O buffer: shared-ownership page-aligned memory allocated through the I/O
/// subsystem, suitable for maximum performance I/O.
///
/// Some multiplexer implementations can allocate registered buffers in memory shared between
/// the I/O hardware and user space. When no backend-specific optimization applies, this is
/// plain anonymous pages; the allocation is always rounded up to a page-size multiple, so
/// always use [`len()`][Self::len] rather than the requested size.
///
/// The memory is unmapped when the last clone is dropped.
#[derive(Clone, derive_more::Debug)]
#[debug("RegisteredBuffer({:p}, len {})", inner.data, inner.len)]
pub struct RegisteredBuffer {
    inner: Arc<RegisteredBufferInner>,
}

#[derive(Debug)]
struct RegisteredBufferInner {
    data: *mut u8,
    len: usize,
}

// SAFETY: The mapping is process-private and the inner pointer is only dereferenced through
// the accessors, whose contracts govern concurrent access.
unsafe impl Send for RegisteredBufferInner {}
// SAFETY: As above.
unsafe impl Sync for RegisteredBufferInner {}

impl RegisteredBuffer {
    /// Maps at least `len` bytes of anonymous memory, rounded up to the page size.
    pub(crate) fn allocate(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument(
                "a registered buffer requires a non-zero size",
            ));
        }

        let page = page_size();
        let len = len
            .checked_add(page - 1)
            .ok_or(Error::InvalidArgument("registered buffer size overflows"))?
            / page
            * page;

        // SAFETY: Plain anonymous mapping; we own the returned region until munmap.
        let data = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if data == libc::MAP_FAILED {
            return Err(Error::ResourceExhausted(
                "out of memory mapping a registered buffer",
            ));
        }

        Ok(Self {
            inner: Arc::new(RegisteredBufferInner {
                data: data.cast(),
                len,
            }),
        })
    }

    /// The usable size of the buffer. At least the requested size, rounded up to a page-size
    /// multiple.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the buffer is empty. Registered buffers never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// A scatter descriptor covering the whole buffer.
    #[must_use]
    pub fn as_buffer(&self) -> Buffer {
        Buffer {
            data: self.inner.data,
            len: self.inner.len,
        }
    }

    /// A gather descriptor covering the whole buffer.
    #[must_use]
    pub fn as_const_buffer(&self) -> ConstBuffer {
        ConstBuffer {
            data: self.inner.data,
            len: self.inner.len,
        }
    }

    /// Views the buffer as a byte slice.
    ///
    /// # Safety
    ///
    /// No I/O operation may be concurrently writing into the buffer, and no other clone may
    /// be concurrently mutating it.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: The mapping is readable and initialized (anonymous pages are zero-filled);
        // exclusion from concurrent mutation is the caller's guarantee.
        unsafe { std::slice::from_raw_parts(self.inner.data, self.inner.len) }
    }

    /// Views the buffer as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access: no I/O operation in flight against the buffer
    /// and no other clone concurrently reading or writing it.
    #[must_use]
    #[expect(clippy::mut_from_ref, reason = "exclusivity is the documented safety contract")]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: Forwarding the caller's exclusivity guarantee.
        unsafe { std::slice::from_raw_parts_mut(self.inner.data, self.inner.len) }
    }
}

impl Drop for RegisteredBufferInner {
    fn drop(&mut self) {
        // SAFETY: We mapped exactly this region in allocate() and nothing else unmaps it.
        unsafe {
            libc::munmap(self.data.cast(), self.len);
        }
    }
}

/// The system page size. Registered buffer sizes are rounded up to a multiple of this.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    usize::try_from(value).unwrap_or(4096)
}

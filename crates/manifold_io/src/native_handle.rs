// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::os::unix::io::RawFd;

bitflags::bitflags! {
    /// The behaviour and kind of a [`NativeHandle`].
    ///
    /// The bit values are stable at the ABI layer for interop with C consumers; do not
    /// renumber them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Disposition: u32 {
        /// Is readable.
        const READABLE = 1 << 0;
        /// Is writable.
        const WRITABLE = 1 << 1;
        /// Is append only: writes occur atomically at end-of-file and ignore the offset.
        const APPEND_ONLY = 1 << 2;

        /// Is capable of non-blocking multiplexed I/O and requires additional synchronisation.
        const OVERLAPPED = 1 << 4;
        /// Is seekable.
        const SEEKABLE = 1 << 5;
        /// Requires sector aligned I/O (typically 512 bytes).
        const ALIGNED_IO = 1 << 6;

        /// Is a regular file.
        const FILE = 1 << 8;
        /// Is a directory.
        const DIRECTORY = 1 << 9;
        /// Is a symlink.
        const SYMLINK = 1 << 10;
        /// Is a multiplexer (epoll, kqueue, completion port).
        const MULTIPLEXER = 1 << 11;
        /// Is a child process.
        const PROCESS = 1 << 12;
        /// Is a memory section.
        const SECTION = 1 << 13;
        /// Is a pipe.
        const PIPE = 1 << 14;
    }
}

/// A native handle used for wrapping file descriptors: the kernel identity plus its
/// [`Disposition`].
///
/// Unmanaged: this type never closes the descriptor. Wrap it in an [`IoHandle`][1] to tie
/// the kernel object's lifetime to a Rust value.
///
/// [1]: crate::IoHandle
#[derive(Clone, Copy, Debug)]
pub struct NativeHandle {
    fd: RawFd,
    disposition: Disposition,
}

impl NativeHandle {
    /// Wraps a file descriptor without taking ownership of it.
    #[must_use]
    pub const fn new(fd: RawFd, disposition: Disposition) -> Self {
        Self { fd, disposition }
    }

    /// The invalid handle.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            fd: -1,
            disposition: Disposition::empty(),
        }
    }

    /// The POSIX file descriptor.
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// The behaviour of the handle.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub(crate) fn merge_disposition(&mut self, extra: Disposition) {
        self.disposition |= extra;
    }

    /// True if the handle is valid: the identity is a plausible descriptor and the
    /// disposition is non-empty. The two always agree for handles produced by this crate.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.fd >= 0 && !self.disposition.is_empty()
    }

    /// True if the handle is readable.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.disposition.contains(Disposition::READABLE)
    }

    /// True if the handle is writable.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.disposition.contains(Disposition::WRITABLE)
    }

    /// True if the handle is append only.
    #[must_use]
    pub const fn is_append_only(&self) -> bool {
        self.disposition.contains(Disposition::APPEND_ONLY)
    }

    /// True if the handle is capable of non-blocking multiplexed I/O.
    #[must_use]
    pub const fn is_overlapped(&self) -> bool {
        self.disposition.contains(Disposition::OVERLAPPED)
    }

    /// True if the handle is seekable.
    #[must_use]
    pub const fn is_seekable(&self) -> bool {
        self.disposition.contains(Disposition::SEEKABLE)
    }

    /// True if the handle requires sector aligned I/O.
    #[must_use]
    pub const fn requires_aligned_io(&self) -> bool {
        self.disposition.contains(Disposition::ALIGNED_IO)
    }

    /// True if a regular file.
    #[must_use]
    pub const fn is_regular(&self) -> bool {
        self.disposition.contains(Disposition::FILE)
    }

    /// True if a directory.
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.disposition.contains(Disposition::DIRECTORY)
    }

    /// True if a symlink.
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        self.disposition.contains(Disposition::SYMLINK)
    }

    /// True if a multiplexer like Linux epoll, BSD kqueue or a Windows completion port.
    #[must_use]
    pub const fn is_multiplexer(&self) -> bool {
        self.disposition.contains(Disposition::MULTIPLEXER)
    }

    /// True if a child process.
    #[must_use]
    pub const fn is_process(&self) -> bool {
        self.disposition.contains(Disposition::PROCESS)
    }

    /// True if a memory section.
    #[must_use]
    pub const fn is_section(&self) -> bool {
        self.disposition.contains(Disposition::SECTION)
    }

    /// True if a pipe.
    #[must_use]
    pub const fn is_pipe(&self) -> bool {
        self.disposition.contains(Disposition::PIPE)
    }

    /// True if the handle's I/O happens entirely in user space (memory sections), where
    /// "I/O" is a memory copy and no kernel syscall is involved.
    #[must_use]
    pub const fn is_in_process_only(&self) -> bool {
        self.is_section()
    }
}

impl Default for NativeHandle {
    fn default() -> Self {
        Self::invalid()
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Any I/O error that may arise from the low-level operations provided by the `manifold_io`
/// crate or from higher-level I/O types that use these operations.
///
/// The taxonomy is categorical: callers are expected to branch on the category, not on the
/// underlying platform code. Kernel-reported statuses that do not map onto a category are
/// forwarded transparently as [`Error::Platform`], carrying the native code.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A malformed request: misaligned I/O against an aligned-only handle, more buffers than
    /// the handle supports, an unregistered handle, or similar caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The handle's capabilities do not permit the operation, e.g. a write against a handle
    /// opened read-only.
    #[error("not permitted: {0}")]
    NotPermitted(&'static str),

    /// The operation is valid in principle but not on this handle in this mode, e.g. deadlined
    /// I/O on a handle incapable of non-blocking operation.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The deadline expired before the operation completed.
    #[error("deadline expired before the operation completed")]
    TimedOut,

    /// The operation was canceled before it completed.
    #[error("operation canceled")]
    Canceled,

    /// A finite resource ran out: memory, kernel handles or queue depth.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A non-blocking attempt found no data or no space. Only surfaced where the caller asked
    /// for readiness information rather than a wait.
    #[error("not ready")]
    NotReady,

    /// We are forwarding an error received from the operating system that has no
    /// platform-agnostic category; the native code is preserved.
    #[error(transparent)]
    Platform(#[from] std::io::Error),
}

/// A specialized `Result` for use with I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents a Manifold I/O error as a standard I/O error.
/// This is often used when interoperating with other libraries that expect standard I/O errors.
impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Platform(error) => error,
            Error::TimedOut => Self::new(std::io::ErrorKind::TimedOut, value),
            Error::Canceled => Self::new(std::io::ErrorKind::Interrupted, value),
            Error::NotReady => Self::new(std::io::ErrorKind::WouldBlock, value),
            _ => Self::other(value),
        }
    }
}

impl Error {
    /// Captures `errno` from the most recent failed system call.
    pub(crate) fn last_os_error() -> Self {
        Self::Platform(std::io::Error::last_os_error())
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Manifold I/O subsystem provides mechanisms to execute low-level byte-oriented I/O
//! operations on operating system handles (files, pipes, directories, sections, ...). These
//! mechanisms underpin higher-level I/O endpoint types, which themselves are not part of this
//! crate and are offered by other layers of the stack.
//!
//! Design goals of the I/O subsystem include:
//!
//! * Scatter-gather reads, writes and write-ordering barriers through one uniform contract.
//! * Per-operation deadlines (relative or absolute), with cancellation.
//! * A multiplexer abstraction that hosts many concurrent operations and delivers their
//!   completions through a uniform receiver interface, with both dedicated-thread and
//!   parallel-thread completion loop modes.
//! * A posted-work queue integrated with the completion loop, including wake semantics.
//!
//! The crate consists of the following major components, each relevant for a different audience:
//!
//! 1. Engineers performing I/O will use [`IoHandle`], which executes operations synchronously
//!    by default and forwards them to an [`IoMultiplexer`] when one is attached via
//!    [`IoHandle::set_multiplexer()`].
//! 1. Engineers integrating with an async task runtime will drive a multiplexer's completion
//!    loop ([`IoMultiplexer::run()`]) and may use the [`awaitable`] adaptor to await
//!    individual operations.
//! 1. Engineers implementing new multiplexer backends will implement the [`IoMultiplexer`]
//!    trait; [`best_available()`] selects the preferred backend for the current platform.
//!
//! An asynchronous operation is described by an [`OperationConnection`] bound to a handle and a
//! receiver. Starting it submits the kernel request; the receiver is invoked exactly once, either
//! synchronously during submission or later from a thread driving the completion loop.
//!
//! ```no_run
//! use manifold_io::{best_available, Buffer, Deadline, IoHandle, OperationConnection};
//!
//! # fn main() -> manifold_io::Result<()> {
//! let multiplexer = best_available(1)?;
//!
//! let (mut reader, _writer) = IoHandle::pipe()?;
//! reader.set_multiplexer(Some(multiplexer.clone()))?;
//!
//! let mut storage = vec![0_u8; 64];
//! let op = OperationConnection::read(
//!     &reader,
//!     vec![Buffer::from_slice(&mut storage)],
//!     0,
//!     |result| println!("read completed: {result:?}"),
//! );
//! multiplexer.start_read(op)?;
//!
//! // Drive completions until the receiver has run.
//! multiplexer.run(64, Deadline::infinite())?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("manifold_io requires a POSIX platform; the multiplexer backends require Linux");

pub mod awaitable;

mod buffers;
mod constants;
mod deadline;
mod error;
mod io_handle;
mod multiplexer;
mod native_handle;
mod operation;
mod posted;
mod scope;
mod sys;

pub(crate) use constants::ERR_POISONED_LOCK;

pub use buffers::*;
pub use deadline::*;
pub use error::*;
pub use io_handle::*;
pub use multiplexer::*;
pub use native_handle::*;
pub use operation::*;
pub use scope::*;

#[cfg(test)]
mod tests {
    #[test]
    fn is_64_bit() {
        // Extent offsets are 64-bit and various byte-count arithmetic assumes that usize can
        // hold any transfer size the kernel reports. 32-bit targets would need an audit of
        // the arithmetic in the multiplexer backends first.
        static_assertions::const_assert!(size_of::<usize>() >= 8);
    }
}

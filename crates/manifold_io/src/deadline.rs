// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant, SystemTime};

/// A time deadline for an I/O operation, in either relative-to-now or absolute
/// (wall clock) terms.
///
/// A default-constructed deadline is [`Deadline::Infinite`] and means "wait indefinitely".
/// A steady deadline of zero means "poll": the operation reports what has already completed
/// and otherwise fails with [`Error::TimedOut`][1] without blocking.
///
/// Steady deadlines are measured from an anchor captured when the operation enters the I/O
/// subsystem, so they do not move when the system clock is adjusted. Absolute deadlines follow
/// the system clock.
///
/// The wire representation is a `steady` flag followed by either a 64-bit nanosecond count
/// (steady) or a (seconds, nanoseconds) pair (absolute); the all-zero value is the infinite
/// deadline.
///
/// [1]: crate::Error::TimedOut
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Deadline {
    /// No deadline; the operation may wait indefinitely.
    #[default]
    Infinite,

    /// The operation must complete within this duration, measured from the moment it enters
    /// the I/O subsystem. A zero duration means "poll".
    Steady(Duration),

    /// The operation must complete before this point in wall clock time.
    Absolute(SystemTime),
}

impl Deadline {
    /// The "wait indefinitely" deadline.
    #[must_use]
    pub const fn infinite() -> Self {
        Self::Infinite
    }

    /// A deadline this many nanoseconds after the operation enters the I/O subsystem.
    #[must_use]
    pub const fn steady(duration: Duration) -> Self {
        Self::Steady(duration)
    }

    /// A deadline at an absolute point in wall clock time.
    #[must_use]
    pub const fn absolute(when: SystemTime) -> Self {
        Self::Absolute(when)
    }

    /// The polling deadline: report what has already completed, never block.
    #[must_use]
    pub const fn zero() -> Self {
        Self::Steady(Duration::ZERO)
    }

    /// Whether this deadline permits waiting forever.
    #[must_use]
    pub const fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// Whether this is the polling deadline (steady zero).
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        matches!(self, Self::Steady(Duration::ZERO))
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::Steady(duration)
    }
}

impl From<SystemTime> for Deadline {
    fn from(when: SystemTime) -> Self {
        Self::Absolute(when)
    }
}

/// Converts a [`Deadline`] into remaining wait budgets at each sleep-wait point of an
/// operation.
///
/// The anchor for a steady deadline is captured exactly once, when the operation enters the
/// I/O subsystem, so that time spent in earlier sleep-wait points of the same operation is
/// charged against the same budget.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeadlineAnchor {
    began: Instant,
    deadline: Deadline,
}

impl DeadlineAnchor {
    pub(crate) fn new(deadline: Deadline) -> Self {
        Self {
            began: Instant::now(),
            deadline,
        }
    }

    /// Time remaining before the deadline expires. `None` means "wait forever"; a zero
    /// duration means the deadline has expired (or was the polling deadline).
    pub(crate) fn remaining(&self) -> Option<Duration> {
        match self.deadline {
            Deadline::Infinite => None,
            Deadline::Steady(duration) => {
                Some(duration.saturating_sub(self.began.elapsed()))
            }
            Deadline::Absolute(when) => Some(
                when.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.remaining(), Some(Duration::ZERO))
    }

    /// The deadline split into the two index domains: a steady-clock expiry instant for
    /// relative deadlines, a wall-clock expiry for absolute ones. At most one is populated.
    pub(crate) fn expiries(&self) -> (Option<Instant>, Option<SystemTime>) {
        match self.deadline {
            Deadline::Infinite => (None, None),
            // An unrepresentable expiry is indistinguishable from waiting forever.
            Deadline::Steady(duration) => (self.began.checked_add(duration), None),
            Deadline::Absolute(when) => (None, Some(when)),
        }
    }

    /// Remaining budget expressed as a fresh deadline, for forwarding into a nested wait.
    pub(crate) fn as_partial_deadline(&self) -> Deadline {
        match self.remaining() {
            None => Deadline::Infinite,
            Some(remaining) => Deadline::Steady(remaining),
        }
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types for the runtime core.
//!
//! Programming errors (double-fill, illegal state transitions, negative
//! in-flight counts, conflicting shutdown codes) are represented here and
//! delivered as panic payloads at the job boundary (see `monitor`), never
//! as silent `Result::Err`. Descriptor errors are the opposite: they are
//! always `Result` values, never panics (see `fd::FdError`).

use thiserror::Error;

/// A programming-error invariant violation.
///
/// These correspond 1:1 to the "programming errors" enumerated in the
/// error-handling design: they indicate a bug in the caller, not a
/// recoverable runtime condition, and the runtime panics with this value
/// as the payload message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// `Ivar::fill` called on a cell that is already `Full`.
    #[error("ivar already filled")]
    AlreadyFilled,

    /// An `Fd` state transition was attempted that the state machine
    /// does not allow.
    #[error("illegal fd state transition: {from} -> {to}")]
    IllegalFdTransition { from: &'static str, to: &'static str },

    /// An `Fd`'s in-flight syscall counter would go negative.
    #[error("fd in-flight counter would go negative")]
    NegativeInFlight,

    /// `shutdown` was called with a nonzero code that conflicts with an
    /// already-engaged nonzero shutdown code.
    #[error("conflicting shutdown codes: already shutting down with {existing}, requested {requested}")]
    ShutdownConflict { existing: i32, requested: i32 },

    /// The scheduler reached its test-harness cycle budget without the
    /// awaited deferred becoming determined.
    #[error("scheduler stalled: deferred not determined within {cycles} cycles")]
    Stalled { cycles: u64 },
}

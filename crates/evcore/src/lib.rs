// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded cooperative concurrency core.
//!
//! Three tightly coupled subsystems, leaves first:
//!
//! - [`ivar`] / [`deferred`]: write-once cells and their combinator layer.
//! - [`job`] / [`scheduler`]: the FIFO of ready callbacks and the event
//!   loop that drains it, polls the fd watcher, and fires timers.
//! - [`fd`] / [`fd_watcher`]: the managed descriptor wrapper and the
//!   epoll adapter it rides on.
//! - [`monitor`]: the dynamically-scoped error-handler tree jobs run
//!   under.
//! - [`clock`]: the timer heap backing `after`/`at`/`every`.
//! - [`shutdown`]: process-wide graceful-termination state.
//!
//! Nothing here is `Send`: the runtime owns exactly one OS thread, and
//! `Ivar`/`Fd`/`Monitor` are all `Rc`-based by construction. See
//! [`scheduler::Scheduler`] for the entry point.

pub mod clock;
pub mod config;
pub mod deferred;
pub mod error;
pub mod fd;
pub mod fd_watcher;
pub mod ivar;
pub(crate) mod job;
pub mod logging;
pub mod monitor;
pub mod scheduler;
pub mod sexp;
pub mod shutdown;

pub use config::Config;
pub use deferred::{all_unit, Deferred, How};
pub use error::RuntimeError;
pub use fd::{Direction, Fd, FdError, FdKind, ReadyToResult};
pub use ivar::Ivar;
pub use monitor::{Exn, Monitor};
pub use scheduler::Scheduler;
pub use sexp::{Sexp, ToSexp};
pub use shutdown::{Exiter, ProcessExiter, RecordingExiter};

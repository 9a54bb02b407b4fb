// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The shutdown coordinator: process-wide graceful-termination state.
//!
//! `shutdown`'s eventual "call OS exit" is abstracted behind an
//! [`Exiter`] trait so tests can observe the exit code without
//! terminating the test process -- the same split between "signal
//! state" and "join/exit" the teacher's own scheduler shutdown keeps.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing::{error, warn};

use crate::deferred::{all_unit, Deferred};
use crate::error::RuntimeError;

/// Abstracts the final process-exit call so it can be observed in tests.
pub trait Exiter {
    fn exit(&self, code: i32);
}

/// The production exiter: terminates the process.
pub struct ProcessExiter;

impl Exiter for ProcessExiter {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// A test exiter that records the requested code instead of exiting.
#[derive(Default)]
pub struct RecordingExiter {
    pub code: RefCell<Option<i32>>,
}

impl Exiter for RecordingExiter {
    fn exit(&self, code: i32) {
        *self.code.borrow_mut() = Some(code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    ShuttingDown(i32),
}

pub(crate) struct ShutdownCoordinator {
    state: RefCell<State>,
    hooks: RefCell<Vec<Box<dyn Fn() -> Deferred<()>>>>,
    exiter: Rc<dyn Exiter>,
    timeout: Duration,
    /// Set once the exit call has actually been made, so a late-firing
    /// timeout job after the hook barrier already exited (or vice versa)
    /// is a no-op instead of a second `exiter.exit` call.
    exited: Rc<Cell<bool>>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(exiter: Rc<dyn Exiter>, timeout: Duration) -> Self {
        Self {
            state: RefCell::new(State::Running),
            hooks: RefCell::new(Vec::new()),
            exiter,
            timeout,
            exited: Rc::new(Cell::new(false)),
        }
    }

    pub(crate) fn at_shutdown(&self, hook: impl Fn() -> Deferred<()> + 'static) {
        self.hooks.borrow_mut().push(Box::new(hook));
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        matches!(*self.state.borrow(), State::ShuttingDown(_))
    }

    /// Engage shutdown with `status`, applying the reconciliation rule
    /// if a shutdown is already in flight: two equal codes (or either
    /// code being 0) coalesce to the nonzero one; two differing nonzero
    /// codes are a programming error.
    pub(crate) fn shutdown(self: &Rc<Self>, status: i32) {
        let mut state = self.state.borrow_mut();
        let effective = match *state {
            State::Running => status,
            State::ShuttingDown(existing) => {
                if existing == status || existing == 0 {
                    status
                } else if status == 0 {
                    existing
                } else {
                    panic!(
                        "{}",
                        RuntimeError::ShutdownConflict {
                            existing,
                            requested: status,
                        }
                    );
                }
            }
        };

        let already_running = matches!(*state, State::ShuttingDown(_));
        *state = State::ShuttingDown(effective);
        drop(state);

        if already_running {
            // Already driving the hook barrier for the prior code; the
            // reconciled code in `self.state` takes effect when that
            // barrier's `upon` callback reads it back at fire time.
            return;
        }

        let hooks: Vec<Deferred<()>> = self.hooks.borrow().iter().map(|h| h()).collect();
        let barrier = all_unit(hooks);

        let this = self.clone();
        barrier.upon(move |()| {
            if this.exited.get() {
                return;
            }
            this.exited.set(true);
            let code = match *this.state.borrow() {
                State::ShuttingDown(c) => c,
                State::Running => 0,
            };
            this.exiter.exit(code);
        });

        let timeout_deferred = crate::scheduler::after(self.timeout);
        let this2 = self.clone();
        timeout_deferred.upon(move |()| {
            if this2.exited.get() {
                return;
            }
            this2.exited.set(true);
            warn!("shutdown: at-shutdown hooks did not complete within timeout");
            error!("shutdown: forcing exit with code 1 after timeout");
            this2.exiter.exit(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::time::Duration;

    #[test]
    fn coalescing_zero_then_nonzero_exits_with_nonzero() {
        let exiter = Rc::new(RecordingExiter::default());
        let sched = Scheduler::with_exiter(Default::default(), exiter.clone());
        sched.shutdown(0);
        sched.shutdown(2);
        sched.run_until_shutdown(Duration::from_secs(1));
        assert_eq!(*exiter.code.borrow(), Some(2));
    }

    #[test]
    #[should_panic(expected = "conflicting shutdown codes")]
    fn conflicting_nonzero_codes_panics() {
        let exiter = Rc::new(RecordingExiter::default());
        let sched = Scheduler::with_exiter(Default::default(), exiter);
        sched.shutdown(2);
        sched.shutdown(3);
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Property-based regression coverage for the quantified invariants in
//! the runtime's testable-properties list. Additive to the fixed
//! scenarios in `scenarios.rs`: these vary registration order, fd
//! call sequences, and shutdown code pairs instead of fixing them.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use evcore::shutdown::RecordingExiter;
use evcore::{Config, Deferred, Scheduler};

proptest! {
    /// For any permutation of N callbacks subscribed to the same ivar
    /// before its fill, they are dequeued in subscription order.
    #[test]
    fn upon_callbacks_run_in_subscription_order(n in 1usize..12) {
        let sched = Scheduler::new(Config::default());
        let (iv, d) = Deferred::new_ivar();
        let observed = Rc::new(RefCell::new(Vec::new()));

        for i in 0..n {
            let observed = observed.clone();
            d.upon(move |_: ()| observed.borrow_mut().push(i));
        }
        iv.fill(());

        sched.run_until_determined(&d).unwrap();
        let expected: Vec<usize> = (0..n).collect();
        prop_assert_eq!(&*observed.borrow(), &expected);
    }

    /// Whatever order a sequence of `ready_to`/`close` calls arrives in
    /// (close may or may not have already happened, readiness may or may
    /// not have already fired), `close_finished` is determined exactly
    /// once and the fd is never left "open" afterwards.
    #[test]
    fn fd_close_is_idempotent_under_arbitrary_call_counts(close_calls in 1usize..5) {
        let sched = Scheduler::new(Config::default());
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        prop_assert_eq!(ret, 0);
        let (r, w) = (fds[0], fds[1]);

        let fd = evcore::Fd::create(evcore::FdKind::Fifo, r, "prop-pipe");
        let mut finishes = Vec::new();
        for _ in 0..close_calls {
            finishes.push(fd.close());
        }
        let all = Deferred::all(finishes);
        sched.run_until_determined(&all).unwrap();

        let results = all.peek().unwrap();
        prop_assert_eq!(results.len(), close_calls);
        prop_assert!(!fd.is_open());
        unsafe {
            libc::close(w);
        }
    }

    /// A readable fd left undrained between subscriptions (the normal
    /// case for a level-triggered watcher: the callback doesn't have to
    /// consume every byte before the next `ready_to`) must keep reporting
    /// `Ready` on every fresh subscription rather than getting stuck, and
    /// must never trip the `in_flight >= 0` invariant from a stale
    /// re-fire of an already-consumed slot.
    #[test]
    fn fd_ready_to_read_repeatedly_on_a_lingering_readable_pipe(rounds in 1usize..5) {
        let sched = Scheduler::new(Config::default());
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        prop_assert_eq!(ret, 0);
        let (r, w) = (fds[0], fds[1]);
        unsafe {
            libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let fd = evcore::Fd::create(evcore::FdKind::Fifo, r, "prop-readable-pipe");
        for _ in 0..rounds {
            let ready = fd.ready_to(evcore::Direction::Read);
            sched.run_until_determined(&ready).unwrap();
            prop_assert_eq!(ready.peek(), Some(evcore::ReadyToResult::Ready));
        }

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    /// The shutdown reconciliation rule: two codes where at least one is
    /// zero coalesce to the nonzero one (or to 0, if both are 0); two
    /// distinct nonzero codes are a programming error.
    #[test]
    fn shutdown_reconciliation_matches_the_coalescing_rule(a in 0i32..4, b in 0i32..4) {
        let exiter = Rc::new(RecordingExiter::default());
        let sched = Scheduler::with_exiter(Config::default(), exiter.clone());

        let conflicting = a != 0 && b != 0 && a != b;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sched.shutdown(a);
            sched.shutdown(b);
            sched.run_until_shutdown(std::time::Duration::from_millis(50));
        }));

        if conflicting {
            prop_assert!(outcome.is_err());
        } else {
            prop_assert!(outcome.is_ok());
            let expected = if a != 0 { a } else { b };
            prop_assert_eq!(*exiter.code.borrow(), Some(expected));
        }
    }
}

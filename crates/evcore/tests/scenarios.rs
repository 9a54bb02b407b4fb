// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end acceptance scenarios for the runtime core.
//!
//! Each test here corresponds to one of the fixed scenarios the
//! invariants were derived from; unit tests alongside each module cover
//! the same ground in isolation, but these exercise the scheduler,
//! clock, fd lifecycle, and monitor tree together the way a real caller
//! would.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use evcore::fd::{Direction, FdKind, ReadyToResult};
use evcore::monitor::Monitor;
use evcore::shutdown::RecordingExiter;
use evcore::{Config, Deferred, Fd, Scheduler};

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

#[test]
fn chained_bind_is_determined_within_the_cycle_it_is_built() {
    let sched = Scheduler::new(Config::default());
    let d = Deferred::ready(1)
        .bind(|x| Deferred::ready(x + 1))
        .bind(|x| Deferred::ready(x * 10));
    sched.run_until_determined(&d).unwrap();
    assert_eq!(d.peek(), Some(20));
}

#[test]
fn sequential_iter_runs_in_input_order_regardless_of_fill_order() {
    use std::cell::RefCell;

    let sched = Scheduler::new(Config::default());
    let (iv1, d1) = Deferred::new_ivar();
    let (iv2, d2) = Deferred::new_ivar();

    let order = Rc::new(RefCell::new(Vec::new()));
    let order2 = order.clone();
    let done = evcore::deferred::iter(vec![d1, d2], evcore::How::Sequential, move |v| {
        order2.borrow_mut().push(v);
    });

    // Fill d2 first; a sequential iter must still visit d1 before d2.
    iv2.fill(20);
    iv1.fill(10);

    sched.run_until_determined(&done).unwrap();
    assert_eq!(*order.borrow(), vec![10, 20]);
}

#[test]
fn readiness_subscription_loses_the_close_race() {
    let sched = Scheduler::new(Config::default());
    let (r, w) = pipe_pair();
    let fd = Fd::create(FdKind::Fifo, r, "pipe-read");

    let ready = fd.ready_to(Direction::Read);
    let close_finished = fd.close();

    sched.run_until_determined(&close_finished).unwrap();
    assert_eq!(ready.peek(), Some(ReadyToResult::Closed));
    assert!(close_finished.is_determined());

    unsafe {
        libc::close(w);
    }
}

#[test]
fn clock_fires_earlier_deadline_first_despite_later_registration() {
    use std::cell::RefCell;

    let sched = Scheduler::new(Config::default());
    let order = Rc::new(RefCell::new(Vec::new()));

    let ten_ms = evcore::scheduler::after(Duration::from_millis(10));
    let five_ms = evcore::scheduler::after(Duration::from_millis(5));

    let order2 = order.clone();
    ten_ms.upon(move |()| order2.borrow_mut().push("10ms"));
    let order3 = order.clone();
    five_ms.upon(move |()| order3.borrow_mut().push("5ms"));

    sched.run_until_shutdown(Duration::from_millis(50));
    assert_eq!(*order.borrow(), vec!["5ms", "10ms"]);
}

#[test]
fn try_with_captures_an_exception_raised_from_a_later_timer_callback() {
    let sched = Scheduler::new(Config::default());
    let root = sched.root_monitor();

    let result = Monitor::try_with(&root, move || {
        let one_ms = evcore::scheduler::after(Duration::from_millis(1));
        one_ms.upon(|()| panic!("boom"));
        Deferred::ready(())
    });

    sched.run_until_determined(&result).unwrap();
    let outcome = result.peek().unwrap();
    assert!(outcome.is_err());
    assert_eq!(outcome.unwrap_err().message, "boom");
}

#[test]
fn every_callback_panic_is_caught_by_its_monitor_without_corrupting_the_clock() {
    use std::cell::Cell;

    let sched = Scheduler::new(Config::default());
    let root = sched.root_monitor();
    let caught = Rc::new(Cell::new(0u32));
    let caught2 = caught.clone();
    root.set_handler(move |_exn| caught2.set(caught2.get() + 1));

    let fires = Rc::new(Cell::new(0u32));
    let fires2 = fires.clone();
    evcore::scheduler::every(Duration::from_millis(5), move || {
        fires2.set(fires2.get() + 1);
        panic!("boom");
    });

    sched.run_until_shutdown(Duration::from_millis(40));
    assert!(fires.get() >= 2, "the timer must keep firing after a panic");
    assert_eq!(caught.get(), fires.get());
}

#[test]
fn every_callback_can_schedule_another_timer_without_a_double_borrow_panic() {
    let sched = Scheduler::new(Config::default());
    evcore::scheduler::every(Duration::from_millis(5), || {
        let _ = evcore::scheduler::after(Duration::from_millis(1));
    });
    sched.run_until_shutdown(Duration::from_millis(30));
}

#[test]
fn shutdown_coalesces_zero_then_nonzero_to_the_nonzero_code() {
    let exiter = Rc::new(RecordingExiter::default());
    let sched = Scheduler::with_exiter(Config::default(), exiter.clone());
    sched.shutdown(0);
    sched.shutdown(2);
    sched.run_until_shutdown(Duration::from_secs(1));
    assert_eq!(*exiter.code.borrow(), Some(2));
}

#[test]
#[should_panic(expected = "conflicting shutdown codes")]
fn shutdown_rejects_two_conflicting_nonzero_codes() {
    let exiter = Rc::new(RecordingExiter::default());
    let sched = Scheduler::with_exiter(Config::default(), exiter);
    sched.shutdown(2);
    sched.shutdown(3);
}

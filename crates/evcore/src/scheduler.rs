// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The scheduler: the single-threaded event loop tying every other
//! module together.
//!
//! There is one scheduler per OS thread, installed lazily behind a
//! thread-local and addressed through free functions (`enqueue`,
//! `current_monitor`, `register_fd`, ...) rather than a value threaded
//! explicitly through every call -- the same "global mutable state
//! behind an explicit runtime handle, lazily initialized" shape the
//! design notes call for. Tests construct a fresh `Scheduler` per test,
//! which replaces whatever was previously installed on that thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, trace_span};

use crate::clock::Clock;
use crate::config::Config;
use crate::deferred::Deferred;
use crate::error::RuntimeError;
use crate::fd::{Direction, Fd, ReadyToResult};
use crate::fd_watcher::{Dir, FdWatcher, ReadyKind};
use crate::ivar::Ivar;
use crate::job::{Job, JobQueue};
use crate::monitor::{Exn, Monitor};
use crate::shutdown::{Exiter, ProcessExiter, ShutdownCoordinator};

thread_local! {
    static CURRENT: RefCell<Option<Rc<SchedulerInner>>> = RefCell::new(None);
}

fn with_current<R>(f: impl FnOnce(&Rc<SchedulerInner>) -> R) -> R {
    CURRENT.with(|cell| {
        let borrow = cell.borrow();
        let inner = borrow
            .as_ref()
            .expect("no evcore Scheduler installed on this thread");
        f(inner)
    })
}

struct SchedulerInner {
    queue: RefCell<JobQueue>,
    clock: RefCell<Clock>,
    watcher: RefCell<FdWatcher>,
    fd_table: RefCell<HashMap<RawFd, Fd>>,
    root_monitor: Monitor,
    current_monitor: RefCell<Monitor>,
    shutdown: Rc<ShutdownCoordinator>,
    cycle: Cell<u64>,
    config: Config,
}

/// The top-level event loop handle. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler(Rc<SchedulerInner>);

impl Scheduler {
    /// Install a fresh scheduler on this thread with the default
    /// (process-exiting) [`Exiter`].
    pub fn new(config: Config) -> Self {
        Self::with_exiter(config, Rc::new(ProcessExiter))
    }

    /// Install a fresh scheduler with an explicit exiter -- the seam
    /// tests use to observe shutdown's exit code instead of terminating
    /// the process.
    pub fn with_exiter(config: Config, exiter: Rc<dyn Exiter>) -> Self {
        let shutdown = Rc::new(ShutdownCoordinator::new(exiter, config.shutdown_timeout));
        let shutdown_for_root = shutdown.clone();
        let root_monitor = Monitor::new_root(move |exn: &Exn| {
            error!(exn = %exn, "uncaught exception reached root monitor");
            shutdown_for_root.shutdown(1);
        });
        let inner = Rc::new(SchedulerInner {
            queue: RefCell::new(JobQueue::new()),
            clock: RefCell::new(Clock::new()),
            watcher: RefCell::new(
                FdWatcher::new(config.fd_watcher_batch).expect("failed to create epoll instance"),
            ),
            fd_table: RefCell::new(HashMap::new()),
            current_monitor: RefCell::new(root_monitor.clone()),
            root_monitor,
            shutdown,
            cycle: Cell::new(0),
            config,
        });
        CURRENT.with(|cell| *cell.borrow_mut() = Some(inner.clone()));
        Scheduler(inner)
    }

    pub fn root_monitor(&self) -> Monitor {
        self.0.root_monitor.clone()
    }

    pub fn shutdown(&self, status: i32) {
        self.0.shutdown.shutdown(status);
    }

    pub fn at_shutdown(&self, hook: impl Fn() -> Deferred<()> + 'static) {
        self.0.shutdown.at_shutdown(hook);
    }

    /// Run cycles until `deferred` is determined, or return
    /// `RuntimeError::Stalled` once the configured cycle budget is
    /// exhausted. Performs no scheduling decisions of its own: each
    /// iteration is exactly one call to the same `run_cycle` step
    /// `run_forever` uses.
    pub fn run_until_determined<T: Clone + 'static>(
        &self,
        deferred: &Deferred<T>,
    ) -> Result<(), RuntimeError> {
        let budget = self.0.config.stall_budget_cycles;
        for _ in 0..budget {
            // Check-then-run, not run-then-check: a deferred already
            // determined before the first cycle (e.g. a chain built
            // entirely out of already-ready values) must not force a
            // cycle on a scheduler that may have nothing else pending.
            // Any job queued ahead of this deferred's own subscribers
            // still gets to run, because it was queued (and so already
            // pending) before this call, not because of this check.
            if deferred.is_determined() && self.0.queue.borrow().is_empty() {
                return Ok(());
            }
            self.run_cycle();
            if deferred.is_determined() {
                return Ok(());
            }
        }
        Err(RuntimeError::Stalled { cycles: budget })
    }

    /// Run cycles until the shutdown coordinator has exited (or
    /// `max_wait` has elapsed). A test-only convenience mirroring
    /// `run_until_determined` for shutdown scenarios, which have no
    /// single deferred to await.
    pub fn run_until_shutdown(&self, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;
        while Instant::now() < deadline {
            self.run_cycle();
        }
    }

    /// Drive cycles forever. Does not return under normal operation --
    /// termination happens via the shutdown coordinator's `Exiter`.
    pub fn run_forever(&self) -> ! {
        loop {
            self.run_cycle();
        }
    }

    fn run_cycle(&self) {
        let n = self.0.cycle.get();
        self.0.cycle.set(n + 1);
        let _span = trace_span!("cycle", n).entered();

        self.drain_queue();

        let timeout = self.compute_timeout();
        match self.0.watcher.borrow().poll(timeout) {
            Ok(events) => {
                for event in events {
                    self.deliver_watcher_event(event);
                }
            }
            Err(e) => {
                error!(error = %e, "fd watcher failed fatally, initiating shutdown");
                self.shutdown(1);
            }
        }

        let now = Instant::now();
        let (due, recurring) = self.0.clock.borrow_mut().drain_due(now);
        for ivar in due {
            ivar.fill(());
        }
        for (monitor, f) in recurring {
            enqueue(monitor, move || f());
        }
    }

    fn drain_queue(&self) {
        loop {
            let job = self.0.queue.borrow_mut().pop();
            let Some(job) = job else { break };
            let depth_before = self.0.queue.borrow().len();
            trace!(monitor = job.monitor.name(), depth_before, "running job");
            self.execute_job(job);
        }
    }

    fn execute_job(&self, job: Job) {
        let prev = self.0.current_monitor.replace(job.monitor.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job.thunk));
        self.0.current_monitor.replace(prev);
        if let Err(payload) = result {
            let exn = Exn::from_panic_payload(payload);
            job.monitor.deliver(&exn);
        }
    }

    fn compute_timeout(&self) -> Option<Duration> {
        if !self.0.queue.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        if let Some(min_time) = self.0.clock.borrow().min_time() {
            let now = Instant::now();
            return Some(min_time.saturating_duration_since(now));
        }
        if self.0.fd_table.borrow().is_empty() {
            // Nothing queued, no timers, nothing to watch: there is no
            // external event that could ever make progress. A zero
            // timeout keeps `run_until_determined`'s cycle budget an
            // accurate stall detector instead of blocking forever.
            return Some(Duration::ZERO);
        }
        None
    }

    fn deliver_watcher_event(&self, event: crate::fd_watcher::Event) {
        let fd = self.0.fd_table.borrow().get(&event.fd).cloned();
        let Some(fd) = fd else { return };
        let dir = match event.dir {
            Dir::Read => Direction::Read,
            Dir::Write => Direction::Write,
        };
        let result = match event.kind {
            ReadyKind::Ready => ReadyToResult::Ready,
            ReadyKind::BadFd => ReadyToResult::BadFd,
            ReadyKind::Interrupted => ReadyToResult::Interrupted,
        };
        debug!(fd = event.fd, ?dir, ?result, "delivering readiness");
        fd.deliver_ready(dir, result);
    }
}

/// Enqueue `thunk` to run under `monitor` on this thread's scheduler.
pub(crate) fn enqueue(monitor: Monitor, thunk: impl FnOnce() + 'static) {
    with_current(|s| {
        s.queue.borrow_mut().push(Job {
            monitor,
            thunk: Box::new(thunk),
        });
    });
}

/// The monitor installed as current on this thread's scheduler.
pub(crate) fn current_monitor() -> Monitor {
    with_current(|s| s.current_monitor.borrow().clone())
}

/// Run `f` synchronously with `monitor` installed as current, catching
/// any panic it raises directly (as opposed to one raised later from a
/// job `f` merely schedules) and delivering it to `monitor`. Used by
/// `Monitor::try_with`.
pub(crate) fn run_under_monitor(monitor: &Monitor, f: impl FnOnce() + 'static) {
    with_current(|s| {
        let prev = s.current_monitor.replace(monitor.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        s.current_monitor.replace(prev);
        if let Err(payload) = result {
            let exn = Exn::from_panic_payload(payload);
            monitor.deliver(&exn);
        }
    });
}

/// Register `fd` for readiness on `dir` with this thread's watcher.
pub(crate) fn register_fd(fd: Fd, dir: Dir) {
    with_current(|s| {
        s.fd_table.borrow_mut().insert(fd.raw_fd(), fd.clone());
        if let Err(e) = s.watcher.borrow_mut().register(fd.raw_fd(), dir) {
            error!(fd = fd.raw_fd(), error = %e, "failed to register fd with watcher");
        }
    });
}

/// Drop every watcher registration (both directions) for `raw_fd`.
pub(crate) fn unregister_fd_all(raw_fd: RawFd) {
    with_current(|s| {
        s.fd_table.borrow_mut().remove(&raw_fd);
        let _ = s.watcher.borrow_mut().unregister_all(raw_fd);
    });
}

/// Drop the watcher registration for one direction of `raw_fd`, leaving
/// the other direction (and the fd_table entry, which a still-pending
/// registration on the other direction may depend on) untouched. Called
/// once a readiness slot is consumed, since the watcher is
/// level-triggered and would otherwise re-fire on every subsequent poll.
pub(crate) fn unregister_fd(raw_fd: RawFd, dir: Dir) {
    with_current(|s| {
        let _ = s.watcher.borrow_mut().unregister(raw_fd, dir);
    });
}

/// A deferred determined `span` from now, backed by the current
/// scheduler's clock.
pub fn after(span: Duration) -> Deferred<()> {
    with_current(|s| {
        let ivar: Ivar<()> = s.clock.borrow_mut().schedule_at(Instant::now() + span);
        Deferred::from_ivar(ivar)
    })
}

/// A deferred determined at the absolute instant `time`.
pub fn at(time: Instant) -> Deferred<()> {
    with_current(|s| {
        let ivar: Ivar<()> = s.clock.borrow_mut().schedule_at(time);
        Deferred::from_ivar(ivar)
    })
}

/// Reschedule `f` to run every `period`, starting one period from now.
/// Each fire runs as its own job under the monitor current at the time
/// `every` was called, the same as any other job -- a panic inside `f`
/// is caught and delivered to that monitor without disturbing the clock
/// or any other pending timer.
pub fn every(period: Duration, f: impl Fn() + 'static) {
    with_current(|s| {
        let monitor = s.current_monitor.borrow().clone();
        s.clock
            .borrow_mut()
            .schedule_every(Instant::now(), period, monitor, Rc::new(f));
    });
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fd: the safe wrapper over a raw descriptor.
//!
//! Bundles the state machine, the two readiness subscription slots, and
//! the in-flight-syscall counter. Every public operation rechecks the
//! invariants in §3/§8 before returning: state matches counts, a full
//! `close_finished` implies `Closed`, readiness slots are empty unless
//! the state is `Open` or `Close_requested`.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::deferred::Deferred;
use crate::error::RuntimeError;
use crate::fd_watcher::Dir;
use crate::ivar::Ivar;
use crate::sexp::{Sexp, ToSexp};

/// What kind of OS object the descriptor names. Determines whether
/// `O_NONBLOCK` is meaningful (files/sockets/fifos: yes; char devices:
/// yes, with care -- ttys in particular tolerate it but some special
/// files don't).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    Socket,
    File,
    Fifo,
    Char,
}

impl FdKind {
    fn supports_nonblock(self) -> bool {
        true
    }
}

/// Direction of a readiness subscription or an in-flight syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl From<Direction> for Dir {
    fn from(d: Direction) -> Dir {
        match d {
            Direction::Read => Dir::Read,
            Direction::Write => Dir::Write,
        }
    }
}

/// The outcome of awaiting `ready_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyToResult {
    Ready,
    BadFd,
    Interrupted,
    /// The fd was closed while this subscription was outstanding.
    Closed,
}

/// Descriptor-level error: always a `Result`, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FdError {
    #[error("fd already closed")]
    AlreadyClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    CloseRequested,
    Closed,
    Replaced,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Open => "Open",
            State::CloseRequested => "Close_requested",
            State::Closed => "Closed",
            State::Replaced => "Replaced",
        }
    }
}

struct Slots {
    read: Option<Ivar<ReadyToResult>>,
    write: Option<Ivar<ReadyToResult>>,
}

struct FdInner {
    name: String,
    kind: FdKind,
    raw_fd: RefCell<RawFd>,
    state: RefCell<State>,
    in_flight: RefCell<i64>,
    nonblock_set: RefCell<bool>,
    slots: RefCell<Slots>,
    close_finished: Ivar<()>,
    registered_dirs: RefCell<Vec<Dir>>,
}

/// A safe, reference-counted wrapper over a raw OS descriptor.
#[derive(Clone)]
pub struct Fd(Rc<FdInner>);

impl PartialEq for Fd {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

fn check_invariants(inner: &FdInner) {
    let state = *inner.state.borrow();
    let in_flight = *inner.in_flight.borrow();
    debug_assert!(in_flight >= 0, "{}", RuntimeError::NegativeInFlight);
    if matches!(state, State::Closed | State::Replaced) {
        debug_assert_eq!(in_flight, 0);
    }
    let close_full = !inner.close_finished.is_empty();
    if close_full {
        debug_assert_eq!(state, State::Closed);
    }
    if !matches!(state, State::Open | State::CloseRequested) {
        let slots = inner.slots.borrow();
        debug_assert!(slots.read.is_none());
        debug_assert!(slots.write.is_none());
    }
}

impl Fd {
    /// Wrap `raw_fd`. Initial state `Open`, `in_flight = 0`, no
    /// readiness subscriptions, `close_finished` empty.
    pub fn create(kind: FdKind, raw_fd: RawFd, name: impl Into<String>) -> Self {
        let fd = Fd(Rc::new(FdInner {
            name: name.into(),
            kind,
            raw_fd: RefCell::new(raw_fd),
            state: RefCell::new(State::Open),
            in_flight: RefCell::new(0),
            nonblock_set: RefCell::new(false),
            slots: RefCell::new(Slots { read: None, write: None }),
            close_finished: Ivar::create(),
            registered_dirs: RefCell::new(Vec::new()),
        }));
        trace!(name = %fd.0.name, raw_fd, "fd: created");
        fd
    }

    pub fn raw_fd(&self) -> RawFd {
        *self.0.raw_fd.borrow()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    fn set_nonblock(&self) -> std::io::Result<()> {
        if *self.0.nonblock_set.borrow() || !self.0.kind.supports_nonblock() {
            return Ok(());
        }
        let fd = self.raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        *self.0.nonblock_set.borrow_mut() = true;
        Ok(())
    }

    /// Synchronous use of the raw fd: does not touch `in_flight`. Fails
    /// with `AlreadyClosed` unless the state is `Open`.
    pub fn with_fd<T>(
        &self,
        nonblocking: bool,
        f: impl FnOnce(RawFd) -> T,
    ) -> Result<T, FdError> {
        if *self.0.state.borrow() != State::Open {
            return Err(FdError::AlreadyClosed);
        }
        if nonblocking {
            let _ = self.set_nonblock();
        }
        Ok(f(self.raw_fd()))
    }

    /// Like `with_fd`, but `f` performs a syscall that may return
    /// `EAGAIN`/`EINTR`; those are retried after the corresponding
    /// readiness direction fires rather than returned to the caller.
    pub fn syscall<T: Clone + 'static>(
        fd: Fd,
        dir: Direction,
        mut f: impl FnMut(RawFd) -> std::io::Result<T> + 'static,
    ) -> Deferred<Result<T, FdError>> {
        if *fd.0.state.borrow() != State::Open {
            return Deferred::ready(Err(FdError::AlreadyClosed));
        }
        let _ = fd.set_nonblock();
        match f(fd.raw_fd()) {
            Ok(v) => Deferred::ready(Ok(v)),
            Err(e) => match e.raw_os_error() {
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    let fd2 = fd.clone();
                    fd.ready_to(dir).bind(move |ready| match ready {
                        // Resubscribing after an interrupted wait is the
                        // documented recovery path; a bad descriptor is
                        // terminal, not a reason to spin.
                        ReadyToResult::Ready | ReadyToResult::Interrupted => {
                            Fd::syscall(fd2, dir, f)
                        }
                        ReadyToResult::Closed | ReadyToResult::BadFd => {
                            Deferred::ready(Err(FdError::AlreadyClosed))
                        }
                    })
                }
                Some(code) if code == libc::EINTR => Fd::syscall(fd, dir, f),
                _ => Deferred::ready(Err(FdError::AlreadyClosed)),
            },
        }
    }

    /// Subscribe to readiness on `dir`. At most one outstanding
    /// subscription per direction: a second call while one is pending
    /// returns the same deferred. Increments `in_flight`; registers with
    /// the watcher on first subscription for either direction.
    pub fn ready_to(&self, dir: Direction) -> Deferred<ReadyToResult> {
        let mut slots = self.0.slots.borrow_mut();
        let slot = match dir {
            Direction::Read => &mut slots.read,
            Direction::Write => &mut slots.write,
        };
        if let Some(existing) = slot {
            return Deferred::from_ivar(existing.clone());
        }
        let ivar = Ivar::create();
        *slot = Some(ivar.clone());
        *self.0.in_flight.borrow_mut() += 1;
        drop(slots);

        let epoll_dir: Dir = dir.into();
        let already_registered = self.0.registered_dirs.borrow().contains(&epoll_dir);
        if !already_registered {
            self.0.registered_dirs.borrow_mut().push(epoll_dir);
            crate::scheduler::register_fd(self.clone(), epoll_dir);
        }
        check_invariants(&self.0);
        Deferred::from_ivar(ivar)
    }

    /// Called by the scheduler when the watcher reports an event for
    /// this fd's direction. Clears the slot, decrements `in_flight`,
    /// unregisters the direction from the watcher (it is level-triggered
    /// and would otherwise keep re-firing for a descriptor that stays
    /// ready, e.g. a writable socket or a readable fd not fully drained),
    /// and if a close is pending with no more in-flight work, begins it.
    ///
    /// A no-op if the slot was already empty: the watcher is
    /// level-triggered, so a stale event can still arrive for a
    /// direction whose subscription was already consumed and
    /// unregistered in an earlier cycle. Treating that as a fresh
    /// delivery would decrement `in_flight` a second time and drive it
    /// negative.
    pub(crate) fn deliver_ready(&self, dir: Direction, result: ReadyToResult) {
        let ivar = {
            let mut slots = self.0.slots.borrow_mut();
            let slot = match dir {
                Direction::Read => &mut slots.read,
                Direction::Write => &mut slots.write,
            };
            slot.take()
        };
        let Some(ivar) = ivar else {
            return;
        };
        *self.0.in_flight.borrow_mut() -= 1;
        let epoll_dir: Dir = dir.into();
        self.0.registered_dirs.borrow_mut().retain(|d| *d != epoll_dir);
        crate::scheduler::unregister_fd(self.raw_fd(), epoll_dir);
        check_invariants(&self.0);
        ivar.fill(result);
        self.maybe_finish_close();
    }

    fn maybe_finish_close(&self) {
        if *self.0.state.borrow() == State::CloseRequested && *self.0.in_flight.borrow() == 0 {
            self.do_close();
        }
    }

    fn do_close(&self) {
        let fd = self.raw_fd();
        unsafe {
            libc::close(fd);
        }
        *self.0.state.borrow_mut() = State::Closed;
        debug!(name = %self.0.name, raw_fd = fd, "fd: closed");
        self.0.close_finished.fill_if_empty(());
        check_invariants(&self.0);
    }

    /// Idempotent close. Awakens both readiness slots with `Closed`,
    /// unregisters from the watcher, and runs the OS close once
    /// `in_flight` reaches zero (immediately, if it already is).
    pub fn close(&self) -> Deferred<()> {
        let state = *self.0.state.borrow();
        if matches!(state, State::Closed | State::CloseRequested) {
            return Deferred::from_ivar(self.0.close_finished.clone());
        }
        if state == State::Replaced {
            return Deferred::ready(());
        }

        *self.0.state.borrow_mut() = State::CloseRequested;

        let mut slots = self.0.slots.borrow_mut();
        let read = slots.read.take();
        let write = slots.write.take();
        drop(slots);
        let mut in_flight = self.0.in_flight.borrow_mut();
        if let Some(iv) = read {
            *in_flight -= 1;
            iv.fill(ReadyToResult::Closed);
        }
        if let Some(iv) = write {
            *in_flight -= 1;
            iv.fill(ReadyToResult::Closed);
        }
        drop(in_flight);

        crate::scheduler::unregister_fd_all(self.raw_fd());
        self.0.registered_dirs.borrow_mut().clear();

        check_invariants(&self.0);
        if *self.0.in_flight.borrow() == 0 {
            self.do_close();
        }
        Deferred::from_ivar(self.0.close_finished.clone())
    }

    /// Transfer ownership of the raw descriptor out of this wrapper.
    /// Transitions `Open -> Replaced`, clearing readiness (filled with
    /// `Closed`), and returns the raw fd for a new wrapper to own.
    pub fn replace(&self) -> RawFd {
        let mut slots = self.0.slots.borrow_mut();
        if let Some(iv) = slots.read.take() {
            iv.fill(ReadyToResult::Closed);
        }
        if let Some(iv) = slots.write.take() {
            iv.fill(ReadyToResult::Closed);
        }
        drop(slots);
        *self.0.in_flight.borrow_mut() = 0;
        *self.0.state.borrow_mut() = State::Replaced;
        crate::scheduler::unregister_fd_all(self.raw_fd());
        self.0.registered_dirs.borrow_mut().clear();
        check_invariants(&self.0);
        self.raw_fd()
    }

    pub fn is_open(&self) -> bool {
        *self.0.state.borrow() == State::Open
    }

    pub fn close_finished(&self) -> Deferred<()> {
        Deferred::from_ivar(self.0.close_finished.clone())
    }
}

impl ToSexp for Fd {
    fn to_sexp(&self) -> Sexp {
        Sexp::tagged(
            "fd",
            vec![
                Sexp::tagged("name", vec![Sexp::atom(self.0.name.clone())]),
                Sexp::tagged("state", vec![Sexp::atom(self.0.state.borrow().name())]),
                Sexp::tagged("in_flight", vec![Sexp::atom(self.0.in_flight.borrow().to_string())]),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn close_is_idempotent_and_closes_os_fd_once() {
        let _sched = Scheduler::new(Default::default());
        let (r, w) = pipe_pair();
        let fd = Fd::create(FdKind::Fifo, r, "pipe-read");
        let d1 = fd.close();
        let d2 = fd.close();
        assert!(d1.same_cell(&d2));
        assert!(!fd.is_open());
        unsafe {
            libc::close(w);
        }
    }

    #[test]
    fn deliver_ready_twice_without_resubscribing_is_a_noop_the_second_time() {
        let _sched = Scheduler::new(Default::default());
        let (r, w) = pipe_pair();
        let fd = Fd::create(FdKind::Fifo, w, "pipe-write");
        let d = fd.ready_to(Direction::Write);
        fd.deliver_ready(Direction::Write, ReadyToResult::Ready);
        assert_eq!(d.peek(), Some(ReadyToResult::Ready));

        // A level-triggered watcher can still hand back a stale event for
        // a direction whose slot was already consumed and unregistered;
        // this must not double-decrement `in_flight` or refill the slot.
        fd.deliver_ready(Direction::Write, ReadyToResult::Ready);

        let d2 = fd.ready_to(Direction::Write);
        assert!(d2.peek().is_none());

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn replace_transfers_ownership_without_closing() {
        let _sched = Scheduler::new(Default::default());
        let (r, w) = pipe_pair();
        let fd = Fd::create(FdKind::Fifo, r, "pipe-read");
        let raw = fd.replace();
        assert_eq!(raw, r);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}

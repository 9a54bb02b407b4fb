// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ivar: a write-once cell.
//!
//! `Ivar<T>` is `Rc<RefCell<..>>`, not an atomic or mutex-guarded cell --
//! the runtime is single-threaded by construction (see the concurrency
//! model), so there is no cross-thread handoff to pay the cost of. `T` is
//! required to be `Clone` because a fill fans its value out to every
//! registered subscriber (see the data-model note on why this differs
//! from the distilled spec's by-value callback signature).

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::monitor::Monitor;
use crate::sexp::{Sexp, ToSexp};

pub(crate) struct Subscriber<T> {
    pub(crate) monitor: Monitor,
    pub(crate) callback: Box<dyn FnOnce(T)>,
}

pub(crate) enum IvarState<T> {
    Empty(Vec<Subscriber<T>>),
    Full(T),
}

struct IvarInner<T> {
    state: RefCell<IvarState<T>>,
}

/// A write-once cell. Initially empty, fills at most once.
pub struct Ivar<T>(Rc<IvarInner<T>>);

impl<T> Clone for Ivar<T> {
    fn clone(&self) -> Self {
        Ivar(self.0.clone())
    }
}

impl<T: Clone + 'static> Ivar<T> {
    /// An empty cell with no subscribers.
    pub fn create() -> Self {
        Ivar(Rc::new(IvarInner {
            state: RefCell::new(IvarState::Empty(Vec::new())),
        }))
    }

    pub fn is_empty(&self) -> bool {
        matches!(&*self.0.state.borrow(), IvarState::Empty(_))
    }

    /// Whether `self` and `other` refer to the same underlying cell.
    pub fn ptr_eq(&self, other: &Ivar<T>) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn peek(&self) -> Option<T> {
        match &*self.0.state.borrow() {
            IvarState::Full(v) => Some(v.clone()),
            IvarState::Empty(_) => None,
        }
    }

    /// Panics if the cell is empty -- callers that reach for this are
    /// asserting the cell is already known to be full.
    pub fn value_exn(&self) -> T {
        self.peek().expect("Ivar::value_exn called on an empty ivar")
    }

    /// Fill the cell. Panics with `RuntimeError::AlreadyFilled` if it is
    /// already full -- a double-fill is a programming error, not a
    /// recoverable condition (see the error-handling design).
    pub fn fill(&self, v: T) {
        let subscribers = {
            let mut state = self.0.state.borrow_mut();
            match &*state {
                IvarState::Full(_) => panic!("{}", RuntimeError::AlreadyFilled),
                IvarState::Empty(_) => {}
            }
            let prev = std::mem::replace(&mut *state, IvarState::Full(v.clone()));
            match prev {
                IvarState::Empty(subs) => subs,
                IvarState::Full(_) => unreachable!(),
            }
        };

        // Subscribers are enqueued in registration order, each under the
        // monitor that was current when it subscribed.
        for sub in subscribers {
            let value = v.clone();
            crate::scheduler::enqueue(sub.monitor, move || (sub.callback)(value));
        }
    }

    /// No-op if already full; otherwise behaves like `fill`.
    pub fn fill_if_empty(&self, v: T) -> bool {
        if self.is_empty() {
            self.fill(v);
            true
        } else {
            false
        }
    }

    /// Register a subscriber. Internal: `Deferred::upon` is the public
    /// surface; this is also used directly by combinators that need to
    /// observe a fill without going through a `Deferred`.
    pub(crate) fn subscribe(&self, monitor: Monitor, callback: Box<dyn FnOnce(T)>) {
        let mut state = self.0.state.borrow_mut();
        match &mut *state {
            IvarState::Full(v) => {
                let value = v.clone();
                drop(state);
                crate::scheduler::enqueue(monitor, move || callback(value));
            }
            IvarState::Empty(subs) => {
                subs.push(Subscriber { monitor, callback });
            }
        }
    }
}

impl<T: Clone + 'static> ToSexp for Ivar<T> {
    fn to_sexp(&self) -> Sexp {
        match &*self.0.state.borrow() {
            IvarState::Full(_) => Sexp::tagged("ivar", vec![Sexp::atom("Full")]),
            IvarState::Empty(subs) => Sexp::tagged(
                "ivar",
                vec![
                    Sexp::atom("Empty"),
                    Sexp::tagged("subscribers", vec![Sexp::atom(subs.len().to_string())]),
                ],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn fill_then_peek() {
        let _sched = Scheduler::new(Default::default());
        let iv: Ivar<i32> = Ivar::create();
        assert!(iv.is_empty());
        iv.fill(42);
        assert_eq!(iv.peek(), Some(42));
    }

    #[test]
    #[should_panic(expected = "already filled")]
    fn double_fill_panics() {
        let _sched = Scheduler::new(Default::default());
        let iv: Ivar<i32> = Ivar::create();
        iv.fill(1);
        iv.fill(2);
    }

    #[test]
    fn fill_if_empty_is_noop_when_full() {
        let _sched = Scheduler::new(Default::default());
        let iv: Ivar<i32> = Ivar::create();
        assert!(iv.fill_if_empty(1));
        assert!(!iv.fill_if_empty(2));
        assert_eq!(iv.peek(), Some(1));
    }
}

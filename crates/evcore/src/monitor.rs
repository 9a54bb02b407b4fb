// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The monitor tree: dynamically-scoped error handlers.
//!
//! Monitors are plain records holding an explicit handler closure, not an
//! inheritance hierarchy (per the design note on dynamic dispatch): the
//! "current" monitor is a field threaded by the scheduler, not a language
//! control-flow construct, because control-flow scoping does not survive
//! `upon`/`bind` across asynchronous boundaries.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::deferred::Deferred;
use crate::ivar::Ivar;
use crate::sexp::{Sexp, ToSexp};

/// A caught exception: the panic payload message plus an optional
/// captured backtrace, rendered together through `tracing::error!` at the
/// root monitor.
#[derive(Clone)]
pub struct Exn {
    pub message: String,
    pub backtrace: Option<Rc<std::backtrace::Backtrace>>,
}

impl Exn {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: None,
        }
    }

    pub(crate) fn from_panic_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self {
            message,
            backtrace: Some(Rc::new(std::backtrace::Backtrace::capture())),
        }
    }
}

impl fmt::Debug for Exn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exn").field("message", &self.message).finish()
    }
}

impl fmt::Display for Exn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

type Handler = Rc<dyn Fn(&Exn)>;

struct MonitorInner {
    name: String,
    parent: RefCell<Option<Monitor>>,
    handler: RefCell<Option<Handler>>,
    children: RefCell<Vec<Weak<MonitorInner>>>,
}

/// A node in the error-handler tree. Cheap to clone (it's a reference-
/// counted handle).
#[derive(Clone)]
pub struct Monitor(Rc<MonitorInner>);

impl PartialEq for Monitor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Monitor {
    /// The monitor active on the calling scheduler right now.
    ///
    /// Panics (via `scheduler::current_monitor`) if called outside a
    /// running scheduler, same as every other current-scheduler accessor.
    pub fn current() -> Monitor {
        crate::scheduler::current_monitor()
    }

    /// Build the distinguished root monitor: its handler prints the
    /// uncaught exception and hands it to the shutdown coordinator with
    /// exit code 1.
    pub(crate) fn new_root(on_uncaught: impl Fn(&Exn) + 'static) -> Self {
        let inner = Rc::new(MonitorInner {
            name: "root".to_string(),
            parent: RefCell::new(None),
            handler: RefCell::new(Some(Rc::new(on_uncaught))),
            children: RefCell::new(Vec::new()),
        });
        Monitor(inner)
    }

    /// Create a monitor. `parent` defaults to `current` when `None`.
    pub fn create(name: impl Into<String>, parent: Option<Monitor>, current: &Monitor) -> Self {
        let parent = parent.unwrap_or_else(|| current.clone());
        let inner = Rc::new(MonitorInner {
            name: name.into(),
            parent: RefCell::new(Some(parent.clone())),
            handler: RefCell::new(None),
            children: RefCell::new(Vec::new()),
        });
        let child = Monitor(inner);
        parent.0.children.borrow_mut().push(Rc::downgrade(&child.0));
        child
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Disconnect this monitor from its parent for handler-lookup
    /// purposes. Exceptions raised under it with no handler of its own
    /// are no longer routed to what used to be its parent.
    pub fn detach(&self) {
        *self.0.parent.borrow_mut() = None;
    }

    pub fn parent(&self) -> Option<Monitor> {
        self.0.parent.borrow().clone()
    }

    /// Install an explicit handler on this monitor.
    pub fn set_handler(&self, handler: impl Fn(&Exn) + 'static) {
        *self.0.handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Deliver an exception: walk up from this monitor, the first one
    /// with a handler installed absorbs it.
    pub fn deliver(&self, exn: &Exn) {
        let mut node = self.clone();
        loop {
            let handler = node.0.handler.borrow().clone();
            if let Some(h) = handler {
                h(exn);
                return;
            }
            match node.parent() {
                Some(p) => node = p,
                None => {
                    // No handler anywhere up the chain and no root reached
                    // (detached chain) -- nothing left to do but drop it.
                    // This only happens if a non-root monitor was detached
                    // from a chain that never reaches the root.
                    return;
                }
            }
        }
    }

    /// Run `f` under a fresh child monitor that absorbs the first
    /// exception raised (directly or via any deferred chained from `f`)
    /// into `Err`. Subsequent exceptions from the same computation are
    /// routed to the enclosing monitor, matching the "first exception
    /// only" rule.
    pub fn try_with<T, F>(current: &Monitor, f: F) -> Deferred<Result<T, Exn>>
    where
        T: Clone + 'static,
        F: FnOnce() -> Deferred<T> + 'static,
    {
        let result_ivar: Ivar<Result<T, Exn>> = Ivar::create();
        let child = Monitor::create("try_with", None, current);
        let parent = current.clone();

        let fill_ivar = result_ivar.clone();
        child.set_handler(move |exn| {
            if fill_ivar.is_empty() {
                fill_ivar.fill(Err(exn.clone()));
            } else {
                // The first exception from this computation was already
                // absorbed into `Err`; every subsequent one escapes to
                // the monitor that was current when `try_with` was
                // called, per the "first exception only" rule.
                parent.deliver(exn);
            }
        });

        let result_ivar2 = result_ivar.clone();
        crate::scheduler::run_under_monitor(&child, move || {
            let d = f();
            let result_ivar3 = result_ivar2.clone();
            d.upon(move |v| {
                let _ = result_ivar3.fill_if_empty(Ok(v));
            });
        });

        Deferred::from_ivar(result_ivar)
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor").field("name", &self.name()).finish()
    }
}

impl ToSexp for Monitor {
    fn to_sexp(&self) -> Sexp {
        let parent = match self.parent() {
            Some(p) => Sexp::atom(p.name().to_string()),
            None => Sexp::atom("none"),
        };
        Sexp::tagged(
            "monitor",
            vec![
                Sexp::tagged("name", vec![Sexp::atom(self.name().to_string())]),
                Sexp::tagged("parent", vec![parent]),
                Sexp::tagged(
                    "has_handler",
                    vec![Sexp::atom(self.0.handler.borrow().is_some().to_string())],
                ),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_removes_parent_link() {
        let root = Monitor::new_root(|_| {});
        let child = Monitor::create("child", None, &root);
        assert!(child.parent().is_some());
        child.detach();
        assert!(child.parent().is_none());
    }

    #[test]
    fn deliver_walks_up_to_handler() {
        use std::cell::Cell;
        use std::rc::Rc;

        let caught = Rc::new(Cell::new(false));
        let root = Monitor::new_root(|_| {});
        let caught2 = caught.clone();
        root.set_handler(move |_| caught2.set(true));
        let child = Monitor::create("child", None, &root);
        let grandchild = Monitor::create("grandchild", None, &child);

        grandchild.deliver(&Exn::new("boom"));
        assert!(caught.get());
    }

    #[test]
    fn handler_on_intermediate_monitor_absorbs_first() {
        use std::cell::Cell;
        use std::rc::Rc;

        let root_caught = Rc::new(Cell::new(false));
        let mid_caught = Rc::new(Cell::new(false));

        let root = Monitor::new_root({
            let root_caught = root_caught.clone();
            move |_| root_caught.set(true)
        });
        let mid = Monitor::create("mid", None, &root);
        mid.set_handler({
            let mid_caught = mid_caught.clone();
            move |_| mid_caught.set(true)
        });
        let leaf = Monitor::create("leaf", None, &mid);

        leaf.deliver(&Exn::new("boom"));
        assert!(mid_caught.get());
        assert!(!root_caught.get());
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deferred: the read side of an Ivar plus its combinator layer.
//!
//! Every combinator here preserves the determinism contract: for a fixed
//! sequence of external events, the order user callbacks run in is a
//! deterministic function of subscription order and event arrival order.
//! `upon` never calls its callback synchronously, even when the deferred
//! is already determined -- it always goes through the job queue, so a
//! callback always runs in its own job frame with bounded stack depth and
//! normal exception routing.

use crate::ivar::Ivar;

enum Repr<T> {
    Ivar(Ivar<T>),
    Determined(T),
}

/// The read-side handle over an `Ivar<T>`, or an already-determined value.
/// Two ivar-backed deferreds are the same (via [`Deferred::same_cell`])
/// iff they share an underlying ivar.
pub struct Deferred<T>(Repr<T>);

impl<T: Clone + 'static> Deferred<T> {
    /// Whether `self` and `other` are views over the same underlying
    /// ivar. Two `Determined` deferreds are never the same cell, even
    /// with equal values, since each allocates no cell at all.
    pub fn same_cell(&self, other: &Deferred<T>) -> bool {
        match (&self.0, &other.0) {
            (Repr::Ivar(a), Repr::Ivar(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// A determined deferred holding `v`. Behaves observationally like a
    /// pre-filled ivar but allocates no cell.
    pub fn ready(v: T) -> Self {
        Deferred(Repr::Determined(v))
    }

    pub(crate) fn from_ivar(iv: Ivar<T>) -> Self {
        Deferred(Repr::Ivar(iv))
    }

    /// An ivar-backed deferred that is not yet determined, plus the ivar
    /// used to fill it.
    pub fn new_ivar() -> (Ivar<T>, Self) {
        let iv = Ivar::create();
        (iv.clone(), Deferred::from_ivar(iv))
    }

    pub fn peek(&self) -> Option<T> {
        match &self.0 {
            Repr::Ivar(iv) => iv.peek(),
            Repr::Determined(v) => Some(v.clone()),
        }
    }

    pub fn is_determined(&self) -> bool {
        self.peek().is_some()
    }

    /// Subscribe `f`. Always dispatched through the job queue, under the
    /// monitor current at the time of subscription -- never called
    /// synchronously, even if `self` is already determined.
    pub fn upon(&self, f: impl FnOnce(T) + 'static) {
        let monitor = crate::scheduler::current_monitor();
        match &self.0 {
            Repr::Ivar(iv) => iv.subscribe(monitor, Box::new(f)),
            Repr::Determined(v) => {
                let value = v.clone();
                crate::scheduler::enqueue(monitor, move || f(value));
            }
        }
    }

    /// Monadic bind.
    pub fn bind<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U> + 'static,
    {
        // Shortcut: both sides already determined, no need to allocate.
        if let Repr::Determined(v) = &self.0 {
            let d2 = f(v.clone());
            if let Repr::Determined(_) = &d2.0 {
                return d2;
            }
            let (result_iv, result_d) = Deferred::new_ivar();
            d2.upon(move |v2| result_iv.fill(v2));
            return result_d;
        }

        let (result_iv, result_d) = Deferred::new_ivar();
        self.upon(move |v| {
            let inner = f(v);
            let result_iv = result_iv.clone();
            inner.upon(move |v2| result_iv.fill(v2));
        });
        result_d
    }

    /// `bind(d, |v| Deferred::ready(f(v)))`.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.bind(move |v| Deferred::ready(f(v)))
    }

    /// Determined with the value of the first input to become
    /// determined. Losing subscriptions are left registered -- `choice`
    /// does not cancel them (see the open question on unbounded leaks).
    pub fn choice(deferreds: Vec<Deferred<T>>) -> Deferred<T> {
        let (result_iv, result_d) = Deferred::new_ivar();
        for d in deferreds {
            let result_iv = result_iv.clone();
            d.upon(move |v| {
                let _ = result_iv.fill_if_empty(v);
            });
        }
        result_d
    }

    /// An ivar that never fills.
    pub fn never() -> Deferred<T> {
        let (_iv, d) = Deferred::new_ivar();
        d
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Determined when every input is; preserves input order.
    pub fn all(deferreds: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
        let n = deferreds.len();
        if n == 0 {
            return Deferred::ready(Vec::new());
        }
        let slots: std::rc::Rc<std::cell::RefCell<Vec<Option<T>>>> =
            std::rc::Rc::new(std::cell::RefCell::new(vec![None; n]));
        let remaining = std::rc::Rc::new(std::cell::Cell::new(n));
        let (result_iv, result_d) = Deferred::new_ivar();

        for (i, d) in deferreds.into_iter().enumerate() {
            let slots = slots.clone();
            let remaining = remaining.clone();
            let result_iv = result_iv.clone();
            d.upon(move |v| {
                slots.borrow_mut()[i] = Some(v);
                let left = remaining.get() - 1;
                remaining.set(left);
                if left == 0 {
                    let values = slots.borrow_mut().drain(..).map(|o| o.unwrap()).collect();
                    result_iv.fill(values);
                }
            });
        }
        result_d
    }
}

/// Value-less variant of [`Deferred::all`].
pub fn all_unit(deferreds: Vec<Deferred<()>>) -> Deferred<()> {
    Deferred::all(deferreds).map(|_| ())
}

/// Enqueue a unit-valued job at the back of the current job queue,
/// riding the normal "fill enqueues subscribers" path rather than a
/// scheduler-private fast path -- giving callbacks already queued ahead
/// of it a chance to run first.
pub fn yield_now() -> Deferred<()> {
    let (iv, d) = Deferred::new_ivar();
    iv.fill(());
    d
}

/// How a sequence combinator drives its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum How {
    /// The next element's callback starts only after the previous
    /// element's deferred has become determined.
    Sequential,
    /// Every element's callback starts immediately; results are gathered
    /// in input order regardless of completion order.
    Parallel,
}

impl Default for How {
    fn default() -> Self {
        How::Sequential
    }
}

/// Apply `f` to every element's value for its side effect, in `how` order.
/// Output order always equals input order (for `Sequential`, trivially;
/// for `Parallel`, because each element is anchored to its own index).
pub fn iter<T, F>(items: Vec<Deferred<T>>, how: How, f: F) -> Deferred<()>
where
    T: Clone + 'static,
    F: Fn(T) + 'static,
{
    let f = std::rc::Rc::new(f);
    match how {
        How::Parallel => {
            let units: Vec<Deferred<()>> = items
                .into_iter()
                .map(|d| {
                    let f = f.clone();
                    d.map(move |v| f(v))
                })
                .collect();
            all_unit(units)
        }
        How::Sequential => sequential_iter(items.into_iter(), f),
    }
}

fn sequential_iter<T, F>(mut items: std::vec::IntoIter<Deferred<T>>, f: std::rc::Rc<F>) -> Deferred<()>
where
    T: Clone + 'static,
    F: Fn(T) + 'static,
{
    match items.next() {
        None => Deferred::ready(()),
        Some(d) => d.bind(move |v| {
            f(v);
            sequential_iter(items, f)
        }),
    }
}

/// `map` over a container: gather `f`'s results in input order.
pub fn map<T, U, F>(items: Vec<Deferred<T>>, how: How, f: F) -> Deferred<Vec<U>>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: Fn(T) -> U + 'static,
{
    let f = std::rc::Rc::new(f);
    match how {
        How::Parallel => {
            let mapped: Vec<Deferred<U>> = items
                .into_iter()
                .map(|d| {
                    let f = f.clone();
                    d.map(move |v| f(v))
                })
                .collect();
            Deferred::all(mapped)
        }
        How::Sequential => sequential_map(items.into_iter(), f),
    }
}

fn sequential_map<T, U, F>(
    mut items: std::vec::IntoIter<Deferred<T>>,
    f: std::rc::Rc<F>,
) -> Deferred<Vec<U>>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: Fn(T) -> U + 'static,
{
    match items.next() {
        None => Deferred::ready(Vec::new()),
        Some(d) => d.bind(move |v| {
            let head = f(v);
            sequential_map(items, f).map(move |mut rest| {
                rest.insert(0, head.clone());
                rest
            })
        }),
    }
}

/// `filter` over a container: keep elements for which `f` returns true,
/// in input order.
pub fn filter<T, F>(items: Vec<Deferred<T>>, how: How, f: F) -> Deferred<Vec<T>>
where
    T: Clone + 'static,
    F: Fn(&T) -> bool + 'static,
{
    filter_map(items, how, move |v| if f(&v) { Some(v) } else { None })
}

/// `filter_map` over a container, in input order.
pub fn filter_map<T, U, F>(items: Vec<Deferred<T>>, how: How, f: F) -> Deferred<Vec<U>>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: Fn(T) -> Option<U> + 'static,
{
    map(items, how, f).map(|opts| opts.into_iter().flatten().collect())
}

/// `fold` over a container. Always sequential in spirit (each step
/// depends on the previous accumulator), regardless of `how`; `how` only
/// controls whether the *element deferreds themselves* are awaited in
/// parallel or one at a time before folding.
pub fn fold<T, Acc, F>(items: Vec<Deferred<T>>, how: How, init: Acc, f: F) -> Deferred<Acc>
where
    T: Clone + 'static,
    Acc: Clone + 'static,
    F: Fn(Acc, T) -> Acc + 'static,
{
    let f = std::rc::Rc::new(f);
    match how {
        How::Sequential => sequential_fold(items.into_iter(), init, f),
        How::Parallel => {
            let mapped: Vec<Deferred<T>> = items;
            let all = Deferred::all(mapped);
            all.map(move |values| values.into_iter().fold(init, |acc, v| f(acc, v)))
        }
    }
}

fn sequential_fold<T, Acc, F>(
    mut items: std::vec::IntoIter<Deferred<T>>,
    acc: Acc,
    f: std::rc::Rc<F>,
) -> Deferred<Acc>
where
    T: Clone + 'static,
    Acc: Clone + 'static,
    F: Fn(Acc, T) -> Acc + 'static,
{
    match items.next() {
        None => Deferred::ready(acc),
        Some(d) => d.bind(move |v| {
            let acc2 = f(acc, v);
            sequential_fold(items, acc2, f)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn chained_bind_determines_within_same_cycle_build() {
        let sched = Scheduler::new(Default::default());
        let d = Deferred::ready(1)
            .bind(|x| Deferred::ready(x + 1))
            .bind(|x| Deferred::ready(x * 10));
        sched.run_until_determined(&d).unwrap();
        assert_eq!(d.peek(), Some(20));
    }

    #[test]
    fn map_round_trips_like_composed_return() {
        let sched = Scheduler::new(Default::default());
        let f = |x: i32| x + 1;
        let g = |x: i32| x * 2;
        let d = Deferred::ready(5).map(f).map(g);
        sched.run_until_determined(&d).unwrap();
        assert_eq!(d.peek(), Some(g(f(5))));
    }

    #[test]
    fn sequential_iter_preserves_input_order_regardless_of_fill_order() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let sched = Scheduler::new(Default::default());
        let (iv1, d1) = Deferred::new_ivar();
        let (iv2, d2) = Deferred::new_ivar();

        let order = Rc::new(RefCell::new(Vec::new()));
        let order2 = order.clone();
        let done = iter(vec![d1, d2], How::Sequential, move |v| {
            order2.borrow_mut().push(v);
        });

        // Fill d2 first, then d1: sequential iter must still call f on
        // d1's value before d2's.
        iv2.fill(20);
        iv1.fill(10);

        sched.run_until_determined(&done).unwrap();
        assert_eq!(*order.borrow(), vec![10, 20]);
    }

    #[test]
    fn choice_takes_first_and_leaves_loser_subscribed() {
        let sched = Scheduler::new(Default::default());
        let (iv1, d1) = Deferred::new_ivar();
        let (_iv2, d2) = Deferred::new_ivar();
        let winner = Deferred::choice(vec![d1, d2]);
        iv1.fill(1);
        sched.run_until_determined(&winner).unwrap();
        assert_eq!(winner.peek(), Some(1));
    }

    #[test]
    fn all_preserves_input_order() {
        let sched = Scheduler::new(Default::default());
        let (iv1, d1) = Deferred::new_ivar();
        let (iv2, d2) = Deferred::new_ivar();
        let (iv3, d3) = Deferred::new_ivar();
        let all = Deferred::all(vec![d1, d2, d3]);
        iv3.fill(3);
        iv1.fill(1);
        iv2.fill(2);
        sched.run_until_determined(&all).unwrap();
        assert_eq!(all.peek(), Some(vec![1, 2, 3]));
    }
}

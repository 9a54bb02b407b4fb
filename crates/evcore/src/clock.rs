// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The timer heap: sorted pending time-triggered jobs.
//!
//! Backed by `BinaryHeap<Reverse<..>>` keyed on `(trigger_time,
//! insertion_seq)`. The insertion sequence is the explicit tie-break: a
//! raw `Instant` tie in a `BinaryHeap` has unspecified order, so without
//! it "ties break by insertion order" would be incidental rather than
//! guaranteed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::ivar::Ivar;
use crate::monitor::Monitor;

struct Timer {
    trigger_time: Instant,
    seq: u64,
    ivar: Ivar<()>,
    /// `None` for a one-shot `after`/`at`; `Some(period)` for `every`,
    /// which reinserts itself on fire.
    period: Option<Duration>,
    /// For `every`: the user callback, and the monitor that was current
    /// when it was registered. Never invoked directly by the clock --
    /// `drain_due` hands both back to the caller so the callback runs as
    /// a proper job (caught and delivered to its monitor on panic)
    /// instead of inline while the clock is borrowed.
    on_fire: Option<(Monitor, std::rc::Rc<dyn Fn()>)>,
}

struct HeapKey {
    trigger_time: Instant,
    seq: u64,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.trigger_time == other.trigger_time && self.seq == other.seq
    }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.trigger_time
            .cmp(&other.trigger_time)
            .then(self.seq.cmp(&other.seq))
    }
}

struct Entry {
    key: HeapKey,
    timer: Timer,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// The scheduler's priority queue of pending timers.
#[derive(Default)]
pub(crate) struct Clock {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.next_seq;
        self.next_seq += 1;
        s
    }

    /// Schedule a one-shot fire at `trigger_time`, returning the ivar to
    /// fill. `after`/`at` both funnel through this.
    pub(crate) fn schedule_at(&mut self, trigger_time: Instant) -> Ivar<()> {
        let ivar = Ivar::create();
        let seq = self.next_seq();
        self.heap.push(Reverse(Entry {
            key: HeapKey { trigger_time, seq },
            timer: Timer {
                trigger_time,
                seq,
                ivar: ivar.clone(),
                period: None,
                on_fire: None,
            },
        }));
        ivar
    }

    /// Schedule a recurring fire every `period`, starting at `now +
    /// period`. `monitor` is the monitor current at registration time;
    /// each fire of `f` is handed back to the caller (via `drain_due`)
    /// paired with `monitor` rather than invoked here, so `every` stops
    /// rescheduling only the one occurrence that panics, under its own
    /// monitor, rather than the whole clock.
    pub(crate) fn schedule_every(
        &mut self,
        now: Instant,
        period: Duration,
        monitor: Monitor,
        f: std::rc::Rc<dyn Fn()>,
    ) {
        let trigger_time = now + period;
        let seq = self.next_seq();
        self.heap.push(Reverse(Entry {
            key: HeapKey { trigger_time, seq },
            timer: Timer {
                trigger_time,
                seq,
                ivar: Ivar::create(),
                period: Some(period),
                on_fire: Some((monitor, f)),
            },
        }));
    }

    /// The earliest pending trigger time, if any.
    pub(crate) fn min_time(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.key.trigger_time)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop every timer whose trigger time has arrived. Returns the
    /// ivars to fill for one-shot timers, plus the (monitor, callback)
    /// pairs due for recurring ones -- the caller is responsible for
    /// running each callback as a job under its monitor. `every` timers
    /// are immediately rescheduled for their next period regardless of
    /// whether the fired callback has run yet.
    pub(crate) fn drain_due(&mut self, now: Instant) -> (Vec<Ivar<()>>, Vec<(Monitor, std::rc::Rc<dyn Fn()>)>) {
        let mut fired = Vec::new();
        let mut recurring = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.key.trigger_time > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            match entry.timer.period {
                None => fired.push(entry.timer.ivar),
                Some(period) => {
                    if let Some(on_fire) = &entry.timer.on_fire {
                        recurring.push(on_fire.clone());
                    }
                    let seq = self.next_seq();
                    let next_time = entry.timer.trigger_time + period;
                    self.heap.push(Reverse(Entry {
                        key: HeapKey {
                            trigger_time: next_time,
                            seq,
                        },
                        timer: Timer {
                            trigger_time: next_time,
                            seq,
                            ivar: Ivar::create(),
                            period: Some(period),
                            on_fire: entry.timer.on_fire.clone(),
                        },
                    }));
                }
            }
        }
        (fired, recurring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earlier_deadline_registered_later_still_fires_first() {
        let mut clock = Clock::new();
        let base = Instant::now();
        let _later_ivar = clock.schedule_at(base + Duration::from_millis(10));
        let earlier_ivar = clock.schedule_at(base + Duration::from_millis(5));

        let (due, recurring) = clock.drain_due(base + Duration::from_millis(7));
        assert_eq!(due.len(), 1);
        assert!(recurring.is_empty());
        assert!(due[0].ptr_eq(&earlier_ivar));
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut clock = Clock::new();
        let t = Instant::now() + Duration::from_millis(1);
        let first = clock.schedule_at(t);
        let second = clock.schedule_at(t);

        let (due, _recurring) = clock.drain_due(t);
        assert_eq!(due.len(), 2);
        assert!(due[0].ptr_eq(&first));
        assert!(due[1].ptr_eq(&second));
    }

    #[test]
    fn min_time_tracks_the_earliest_pending_entry() {
        let mut clock = Clock::new();
        let base = Instant::now();
        assert!(clock.min_time().is_none());
        clock.schedule_at(base + Duration::from_millis(20));
        clock.schedule_at(base + Duration::from_millis(5));
        assert_eq!(clock.min_time(), Some(base + Duration::from_millis(5)));
    }

    #[test]
    fn drain_due_hands_back_recurring_callbacks_instead_of_running_them() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut clock = Clock::new();
        let base = Instant::now();
        let root = Monitor::new_root(|_| {});
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        clock.schedule_every(base, Duration::from_millis(5), root, Rc::new(move || ran2.set(true)));

        let (due, recurring) = clock.drain_due(base + Duration::from_millis(5));
        assert!(due.is_empty());
        assert_eq!(recurring.len(), 1);
        assert!(!ran.get(), "drain_due must not invoke the callback itself");

        recurring[0].1();
        assert!(ran.get());

        // Rescheduled for the next period.
        assert_eq!(clock.min_time(), Some(base + Duration::from_millis(10)));
    }
}

//! MAC Timer API
//
// Copyright 2021 Ryan Kurte

use alloc::collections::BTreeMap;

use crate::Ts;

/// Handle for a scheduled event, unique for the lifetime of a [`Scheduler`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventId(pub u64);

/// Scheduler trait provides a monotonic clock and cancellable wakeups
/// to assist with protocol implementations.
///
/// Implementations must deliver events scheduled for the same instant in the
/// order they were scheduled, and must report each fired [`EventId`] back to
/// the owner (see [`crate::mac::Mac::handle_timeout`]).
pub trait Scheduler {
    /// Returns the current time in microseconds since some unknown epoc
    fn now(&self) -> Ts;

    /// Request a wakeup at `deadline`, returning a handle for the wakeup
    fn schedule(&mut self, deadline: Ts) -> EventId;

    /// Cancel a pending wakeup.
    /// Cancelling a fired or already cancelled handle has no effect.
    fn cancel(&mut self, id: EventId);
}

/// Typed event store on top of a [`Scheduler`].
///
/// Each scheduled event keeps its payload and deadline here until it is
/// either triggered or cancelled, so stale wakeups resolve to `None`.
#[derive(Debug)]
pub struct Timer<E, S> {
    events: BTreeMap<EventId, (Ts, E)>,
    scheduler: S,
}

impl<E, S: Scheduler> Timer<E, S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            events: BTreeMap::new(),
            scheduler,
        }
    }

    pub fn now(&self) -> Ts {
        self.scheduler.now()
    }

    /// Schedule `event` to fire at `deadline`
    pub fn schedule_event(&mut self, deadline: Ts, event: E) -> EventId {
        let id = self.scheduler.schedule(deadline);
        self.events.insert(id, (deadline, event));
        id
    }

    /// Schedule `event` to fire `delay` microseconds from now
    pub fn schedule_after(&mut self, delay: Ts, event: E) -> EventId {
        let deadline = self.now() + delay;
        self.schedule_event(deadline, event)
    }

    pub fn cancel_event(&mut self, id: EventId) {
        if self.events.remove(&id).is_some() {
            self.scheduler.cancel(id);
        }
    }

    pub fn cancel_all(&mut self) {
        let ids: alloc::vec::Vec<_> = self.events.keys().copied().collect();
        for id in ids {
            self.cancel_event(id);
        }
    }

    /// Resolve a fired wakeup to its event, `None` if the event was cancelled
    pub fn triggered(&mut self, id: &EventId) -> Option<E> {
        self.events.remove(id).map(|(_, e)| e)
    }

    pub fn is_pending(&self, id: &EventId) -> bool {
        self.events.contains_key(id)
    }

    /// Deadline of a pending event
    pub fn deadline(&self, id: &EventId) -> Option<Ts> {
        self.events.get(id).map(|(d, _)| *d)
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }
}

#[cfg(any(test, feature = "std"))]
pub mod sim {
    //! Discrete event scheduler for driving one or more MACs on a shared
    //! simulated timeline.

    use std::cmp::Reverse;
    use std::collections::{BinaryHeap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::{EventId, Scheduler};
    use crate::Ts;

    #[derive(Debug, Default)]
    struct Inner {
        now: Ts,
        next_id: u64,
        queue: BinaryHeap<Reverse<(Ts, u64, usize)>>,
        cancelled: HashSet<u64>,
    }

    /// Shared simulation clock and event queue.
    ///
    /// Handles are cheap clones sharing the same timeline, each tagged with
    /// an owner index so a driver can route fired events. Events with equal
    /// deadlines fire in scheduling order.
    #[derive(Clone, Debug)]
    pub struct SimScheduler {
        inner: Arc<Mutex<Inner>>,
        owner: usize,
    }

    impl SimScheduler {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(Inner::default())),
                owner: 0,
            }
        }

        /// Create a handle on the same timeline for another owner
        pub fn handle(&self, owner: usize) -> Self {
            Self {
                inner: self.inner.clone(),
                owner,
            }
        }

        pub fn owner(&self) -> usize {
            self.owner
        }

        /// Pop the next live event, advancing the clock to its deadline
        pub fn next(&self) -> Option<(usize, EventId)> {
            let mut inner = self.inner.lock().unwrap();

            while let Some(Reverse((deadline, id, owner))) = inner.queue.pop() {
                if inner.cancelled.remove(&id) {
                    continue;
                }

                if deadline > inner.now {
                    inner.now = deadline;
                }

                return Some((owner, EventId(id)));
            }

            None
        }

        /// Deadline of the next live event
        pub fn peek(&self) -> Option<Ts> {
            let inner = self.inner.lock().unwrap();
            inner
                .queue
                .iter()
                .filter(|Reverse((_, id, _))| !inner.cancelled.contains(id))
                .map(|Reverse((d, _, _))| *d)
                .min()
        }

        /// Advance the clock without firing events
        pub fn set_now(&self, now: Ts) {
            let mut inner = self.inner.lock().unwrap();
            inner.now = now;
        }
    }

    impl Scheduler for SimScheduler {
        fn now(&self) -> Ts {
            self.inner.lock().unwrap().now
        }

        fn schedule(&mut self, deadline: Ts) -> EventId {
            let mut inner = self.inner.lock().unwrap();

            let id = inner.next_id;
            inner.next_id += 1;

            let deadline = deadline.max(inner.now);
            inner.queue.push(Reverse((deadline, id, self.owner)));

            EventId(id)
        }

        fn cancel(&mut self, id: EventId) {
            let mut inner = self.inner.lock().unwrap();
            inner.cancelled.insert(id.0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::sim::SimScheduler;
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        A,
        B,
        C,
    }

    #[test]
    fn fifo_at_equal_deadlines() {
        let sched = SimScheduler::new();
        let mut timer = Timer::new(sched.clone());

        let c = timer.schedule_event(20, Ev::C);
        let a = timer.schedule_event(10, Ev::A);
        let b = timer.schedule_event(10, Ev::B);

        assert_eq!(sched.next(), Some((0, a)));
        assert_eq!(timer.now(), 10);
        assert_eq!(timer.triggered(&a), Some(Ev::A));

        assert_eq!(sched.next(), Some((0, b)));
        assert_eq!(timer.triggered(&b), Some(Ev::B));

        assert_eq!(sched.next(), Some((0, c)));
        assert_eq!(timer.now(), 20);
        assert_eq!(timer.triggered(&c), Some(Ev::C));

        assert_eq!(sched.next(), None);
    }

    #[test]
    fn cancel_is_idempotent() {
        let sched = SimScheduler::new();
        let mut timer = Timer::new(sched.clone());

        let a = timer.schedule_after(5, Ev::A);
        let b = timer.schedule_after(7, Ev::B);
        assert_eq!(timer.deadline(&b), Some(7));

        timer.cancel_event(a);
        timer.cancel_event(a);
        assert!(!timer.is_pending(&a));

        assert_eq!(sched.next(), Some((0, b)));
        assert_eq!(timer.triggered(&b), Some(Ev::B));

        // Cancelling after firing does nothing
        timer.cancel_event(b);
        assert_eq!(timer.triggered(&b), None);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn owners_share_timeline() {
        let sched = SimScheduler::new();
        let mut s1 = sched.handle(1);
        let mut s2 = sched.handle(2);

        let e2 = s2.schedule(3);
        let e1 = s1.schedule(4);

        assert_eq!(sched.peek(), Some(3));
        assert_eq!(sched.next(), Some((2, e2)));
        assert_eq!(sched.next(), Some((1, e1)));
        assert_eq!(s1.now(), 4);
    }
}

//! Timer min-heap with O(log n) schedule and O(1) cancel (`spec.md` §4.3,
//! §9 — the stronger of the two options the design notes call acceptable).
//!
//! Ties on deadline are broken by insertion order, per `spec.md` §4.3's
//! ordering guarantee. Cancellation is a tombstone: the callback is dropped
//! immediately, and its heap entry is discarded lazily the next time it
//! would otherwise become the earliest pending timer.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::time::Timestamp;

/// Opaque handle returned by [`TimerHeap::schedule`], usable with
/// [`TimerHeap::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct HeapKey {
    deadline: Timestamp,
    seq: u64,
    id: TimerId,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapKey {}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the *earliest*
        // deadline first; ties broken by insertion order (`seq`).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A pending timer's callback, boxed so the heap can hold heterogeneous
/// closures.
type Callback = Box<dyn FnOnce()>;

/// The loop's pending-timer collection.
pub struct TimerHeap {
    heap: BinaryHeap<HeapKey>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap {
            heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            next_id: 0,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Schedule `callback` to run at `deadline`.
    pub fn schedule(&mut self, deadline: Timestamp, callback: impl FnOnce() + 'static) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapKey { deadline, seq, id });
        self.callbacks.insert(id.0, Box::new(callback));
        id
    }

    /// Cancel a pending timer. Returns `true` if it was still pending (and
    /// is now suppressed); `false` if it had already fired or been
    /// cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id.0).is_some()
    }

    fn discard_cancelled_top(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.callbacks.contains_key(&top.id.0) {
                break;
            }
            self.heap.pop();
        }
    }

    /// The deadline of the earliest still-pending timer, if any.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.discard_cancelled_top();
        self.heap.peek().map(|k| k.deadline)
    }

    /// If the earliest still-pending timer's deadline is `<= now`, remove
    /// it and return its callback. Call repeatedly to drain every timer
    /// that has expired by `now`, per `spec.md` §4.3 step 5.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<Callback> {
        self.discard_cancelled_top();
        let top = self.heap.peek()?;
        if top.deadline > now {
            return None;
        }
        let key = self.heap.pop().expect("just peeked");
        self.callbacks.remove(&key.id.0)
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        TimerHeap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn earlier_deadline_fires_before_later_one_even_if_scheduled_second() {
        let now = Timestamp::now();
        let t1 = now.checked_add(Duration::from_millis(5)).unwrap();
        let t2 = now.checked_add(Duration::from_millis(10)).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut timers = TimerHeap::new();
        {
            let order = order.clone();
            timers.schedule(t2, move || order.borrow_mut().push("t2"));
        }
        {
            let order = order.clone();
            timers.schedule(t1, move || order.borrow_mut().push("t1"));
        }

        let far_future = now.checked_add(Duration::from_secs(1)).unwrap();
        while let Some(cb) = timers.pop_expired(far_future) {
            cb();
        }
        assert_eq!(*order.borrow(), vec!["t1", "t2"]);
    }

    #[test]
    fn cancelling_a_timer_before_its_deadline_suppresses_it() {
        let now = Timestamp::now();
        let deadline = now.checked_add(Duration::from_millis(10)).unwrap();
        let fired = Rc::new(RefCell::new(false));

        let mut timers = TimerHeap::new();
        let id = {
            let fired = fired.clone();
            timers.schedule(deadline, move || *fired.borrow_mut() = true)
        };
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id), "cancelling twice is not newly effective");

        let far_future = now.checked_add(Duration::from_secs(1)).unwrap();
        assert!(timers.pop_expired(far_future).is_none());
        assert!(!*fired.borrow());
    }

    #[test]
    fn ties_on_deadline_break_by_insertion_order() {
        let now = Timestamp::now();
        let deadline = now.checked_add(Duration::from_millis(5)).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut timers = TimerHeap::new();
        for label in ["a", "b", "c"] {
            let order = order.clone();
            timers.schedule(deadline, move || order.borrow_mut().push(label));
        }

        let far_future = now.checked_add(Duration::from_secs(1)).unwrap();
        while let Some(cb) = timers.pop_expired(far_future) {
            cb();
        }
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn next_deadline_skips_cancelled_entries() {
        let now = Timestamp::now();
        let t1 = now.checked_add(Duration::from_millis(5)).unwrap();
        let t2 = now.checked_add(Duration::from_millis(10)).unwrap();

        let mut timers = TimerHeap::new();
        let id1 = timers.schedule(t1, || ());
        timers.schedule(t2, || ());
        timers.cancel(id1);

        assert_eq!(timers.next_deadline(), Some(t2));
    }
}

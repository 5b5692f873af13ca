//! Deadline-ordered timer queue with cancellation by handle.
use crate::aodv::TimerHandle;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    /// Live timers. Cancelled ones are removed here and skipped lazily in the heap.
    pending: HashMap<u64, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn schedule(&mut self, deadline: DateTime<Utc>, item: T) -> TimerHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.heap.push(Reverse((deadline, id)));
        self.pending.insert(id, item);
        TimerHandle(id)
    }

    /// Returns the cancelled item, or `None` if the timer already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        self.pending.remove(&handle.0)
    }

    /// Deadline of the earliest live timer.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Removes and returns the earliest timer due at `now`. Timers sharing a deadline
    /// come out in scheduling order.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, T)> {
        self.discard_cancelled();
        match self.heap.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => {}
            _ => return None,
        }
        let Reverse((deadline, id)) = self.heap.pop()?;
        self.pending.remove(&id).map(|item| (deadline, item))
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.pending.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    cell::Cell,
    cmp::Ordering,
    collections::BinaryHeap,
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Timer Queue
///
/// Ordered queue of deferred callables keyed by monotonic deadline. Entries
/// fire strictly in `(deadline, seq)` order, where `seq` is the insertion
/// sequence number breaking ties between equal deadlines. Cancellation uses a
/// tombstone-and-skip strategy: a cancelled entry stays in the heap and is
/// filtered when it surfaces, so cancel is O(1) and never reshapes the heap.

/// Callable fired when a timer entry becomes due.
pub type TimerCallback = Box<dyn FnOnce()>;

/// Handle used to cancel a scheduled entry.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

/// Timer Queue Entry
struct Entry {
    deadline: Instant,
    seq: u64,
    callback: TimerCallback,
    cancelled: Rc<Cell<bool>>,
}

/// Timer Queue
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [TimerHandle].
impl TimerHandle {
    /// Cancels the entry behind the target handle. The entry is skipped when
    /// it reaches the head of the queue.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Returns whether the entry behind the target handle was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Associate functions for [TimerQueue].
impl TimerQueue {
    /// Creates an empty timer queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Schedules a callable to fire at the given deadline.
    pub fn schedule_at(&mut self, deadline: Instant, callback: TimerCallback) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        let entry = Entry {
            deadline,
            seq: self.seq,
            callback,
            cancelled: cancelled.clone(),
        };
        self.seq += 1;
        self.heap.push(entry);
        TimerHandle { cancelled }
    }

    /// Schedules a callable to fire after the given delay.
    pub fn schedule_after(&mut self, delta: Duration, callback: TimerCallback) -> TimerHandle {
        self.schedule_at(Instant::now() + delta, callback)
    }

    /// Returns the deadline of the nearest live entry, purging tombstones
    /// found at the head of the queue. An empty queue yields `None` so the
    /// owning loop may block indefinitely.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if !entry.cancelled.get() {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops every live entry whose deadline is not after `now`, in strict
    /// `(deadline, seq)` order. Cancelled entries are filtered out.
    pub fn drain_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due: Vec<TimerCallback> = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.cancelled.get() {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            match self.heap.pop() {
                Some(entry) => due.push(entry.callback),
                None => break,
            }
        }
        due
    }

    /// Returns the number of entries in the queue, tombstones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns whether the queue holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [TimerQueue].
impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

// BinaryHeap is a max-heap, so entry ordering is reversed to surface the
// smallest `(deadline, seq)` pair first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

//==============================================================================
// Unit Tests
//==============================================================================

//! Fixed-capacity min-heap event scheduler shared by every hardware block in the core.
//!
//! Mirrors the source's `Scheduler`: a binary heap over a fixed-size slab keyed by
//! absolute cycle timestamp, with a monotonic `now` counter advanced independently of
//! event delivery. Unlike the source (which stores `std::function<void(int)>` callbacks
//! directly in each heap slot), events here carry a small `Copy` payload and are drained
//! through a caller-supplied dispatch closure. This avoids every producer of an event
//! (DMA, timers, display timing) needing a back-reference into the component that should
//! handle it; the top-level driver owns that wiring instead.

use std::cell::Cell;
use std::rc::Rc;

/// The source's `kMaxEvents`.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler exceeded its fixed capacity of {capacity} events")]
    Capacity { capacity: usize },
}

/// Stable reference to a live event. Cancelling a handle after its event has already
/// fired is a caller bug (the handle may now alias whatever event occupies its old
/// slot) — callers that want to track firing should clear their own stored handle from
/// within the dispatch callback, the way `TimerChannel::scheduled_overflow_event` does.
#[derive(Clone)]
pub struct EventHandle(Rc<Cell<usize>>);

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandle").field(&self.0.get()).finish()
    }
}

struct Slot<T> {
    timestamp: u64,
    seq: u64,
    payload: T,
    index_cell: Rc<Cell<usize>>,
}

impl<T> Slot<T> {
    fn key(&self) -> (u64, u64) {
        (self.timestamp, self.seq)
    }
}

/// A min-heap of timed events carrying payload `T`, plus the scheduler's own notion of
/// "now". `T` is expected to be a small `Copy` enum identifying which hardware block and
/// which internal event within it should run.
pub struct Scheduler<T> {
    heap: Vec<Slot<T>>,
    capacity: usize,
    now: u64,
    next_seq: u64,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            capacity,
            now: 0,
            next_seq: 0,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    pub fn next_timestamp(&self) -> Option<u64> {
        self.heap.first().map(|s| s.timestamp)
    }

    /// Advances `now`. Never fires events; callers drain with `step_with` afterwards.
    pub fn add_cycles(&mut self, cycles: u64) {
        self.now += cycles;
    }

    /// Inserts an event at `now + delay`. Returns `SchedulerError::Capacity` if the slab
    /// is full — per the design, this is treated by the top-level driver as a fatal
    /// condition, since it indicates a run-away event producer rather than a recoverable
    /// guest-triggerable state.
    pub fn add(&mut self, delay: u64, payload: T) -> Result<EventHandle, SchedulerError> {
        if self.heap.len() >= self.capacity {
            tracing::error!(capacity = self.capacity, "scheduler event heap is full");
            return Err(SchedulerError::Capacity {
                capacity: self.capacity,
            });
        }

        let index_cell = Rc::new(Cell::new(self.heap.len()));
        let slot = Slot {
            timestamp: self.now + delay,
            seq: self.next_seq,
            payload,
            index_cell: index_cell.clone(),
        };
        self.next_seq += 1;
        self.heap.push(slot);
        let n = self.heap.len() - 1;
        self.sift_up(n);
        Ok(EventHandle(index_cell))
    }

    /// Cancels a still-live event in O(log n). A no-op if the handle's slot is out of
    /// range (e.g. the event already fired and the heap has since shrunk).
    pub fn cancel(&mut self, handle: &EventHandle) {
        let idx = handle.0.get();
        if idx >= self.heap.len() {
            return;
        }
        let last = self.heap.len() - 1;
        self.swap_slots(idx, last);
        self.heap.pop();
        if idx < self.heap.len() {
            if idx != 0 && self.heap[Self::parent(idx)].key() > self.heap[idx].key() {
                self.sift_up(idx);
            } else {
                self.sift_down(idx);
            }
        }
    }

    /// Pops the single due event with the lowest (timestamp, insertion-order) key, if
    /// its timestamp has reached `now`. Returns `(payload, cycles_late)`. Prefer this
    /// over `step_with` when the caller needs to interleave scheduler draining with its
    /// own mutable state in a way a single dispatch closure can't borrow-check (e.g. a
    /// bank of channels that must call back into `&mut self` methods).
    pub fn pop_due(&mut self) -> Option<(T, u64)>
    where
        T: Copy,
    {
        let slot = self.heap.first()?;
        if slot.timestamp > self.now {
            return None;
        }
        let now = self.now;
        let cycles_late = now - slot.timestamp;
        let payload = slot.payload;
        self.remove_root();
        Some((payload, cycles_late))
    }

    /// Drains every event whose timestamp has reached `now`, in timestamp order with
    /// ties broken by insertion order, invoking `dispatch(payload, cycles_late)` for
    /// each. `dispatch` may freely call `add`/`cancel` on this scheduler; the popped slot
    /// is reclaimed before `dispatch` runs so re-entrant inserts cannot observe it.
    pub fn step_with(&mut self, mut dispatch: impl FnMut(T, u64))
    where
        T: Copy,
    {
        while let Some((payload, cycles_late)) = self.pop_due() {
            dispatch(payload, cycles_late);
        }
    }

    fn remove_root(&mut self) {
        let last = self.heap.len() - 1;
        self.swap_slots(0, last);
        self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
    }

    fn parent(n: usize) -> usize {
        (n - 1) / 2
    }
    fn left(n: usize) -> usize {
        n * 2 + 1
    }
    fn right(n: usize) -> usize {
        n * 2 + 2
    }

    fn swap_slots(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.heap[i].index_cell.set(i);
        self.heap[j].index_cell.set(j);
    }

    fn sift_up(&mut self, mut n: usize) {
        while n != 0 {
            let p = Self::parent(n);
            if self.heap[p].key() > self.heap[n].key() {
                self.swap_slots(n, p);
                n = p;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut n: usize) {
        loop {
            let l = Self::left(n);
            let r = Self::right(n);
            let mut smallest = n;
            if l < self.heap.len() && self.heap[l].key() < self.heap[smallest].key() {
                smallest = l;
            }
            if r < self.heap.len() && self.heap[r].key() < self.heap[smallest].key() {
                smallest = r;
            }
            if smallest == n {
                break;
            }
            self.swap_slots(n, smallest);
            n = smallest;
        }
    }

    /// Checks the min-heap property: for every non-root index, the parent's key is not
    /// greater than the child's. Exposed for property tests; not used by production code.
    #[doc(hidden)]
    pub fn check_heap_property(&self) -> bool {
        (1..self.heap.len()).all(|i| self.heap[Self::parent(i)].key() <= self.heap[i].key())
    }

    /// Checks that every live event's recorded index equals its current slot. Exposed for
    /// property tests.
    #[doc(hidden)]
    pub fn check_handle_integrity(&self) -> bool {
        self.heap
            .iter()
            .enumerate()
            .all(|(i, s)| s.index_cell.get() == i)
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_timestamp_order() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.add(10, 1).unwrap();
        sched.add(5, 2).unwrap();
        sched.add(20, 3).unwrap();
        sched.add_cycles(25);

        let mut order = Vec::new();
        sched.step_with(|p, _| order.push(p));
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn equal_timestamps_break_ties_by_insertion_order() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.add(10, 1).unwrap();
        sched.add(10, 2).unwrap();
        sched.add(10, 3).unwrap();
        sched.add_cycles(10);

        let mut order = Vec::new();
        sched.step_with(|p, _| order.push(p));
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn cycles_late_reflects_drift() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.add(10, 1).unwrap();
        sched.add_cycles(17);

        let mut late = None;
        sched.step_with(|_, cycles_late| late = Some(cycles_late));
        assert_eq!(late, Some(7));
    }

    #[test]
    fn cancel_removes_without_corrupting_heap() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        let h = sched.add(5, 1).unwrap();
        sched.add(1, 2).unwrap();
        sched.add(3, 3).unwrap();
        sched.add(2, 4).unwrap();
        sched.cancel(&h);

        assert!(sched.check_heap_property());
        assert!(sched.check_handle_integrity());
        assert_eq!(sched.pending(), 3);

        sched.add_cycles(10);
        let mut order = Vec::new();
        sched.step_with(|p, _| order.push(p));
        assert_eq!(order, vec![2, 4, 3]);
    }

    #[test]
    fn capacity_is_enforced_without_corrupting_existing_entries() {
        let mut sched: Scheduler<u32> = Scheduler::with_capacity(4);
        for i in 0..4 {
            sched.add(i, i as u32).unwrap();
        }
        let err = sched.add(100, 99).unwrap_err();
        assert_eq!(err, SchedulerError::Capacity { capacity: 4 });
        assert_eq!(sched.pending(), 4);
        assert!(sched.check_heap_property());

        sched.add_cycles(3);
        let mut order = Vec::new();
        sched.step_with(|p, _| order.push(p));
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn reentrant_add_from_dispatch_is_observed_next_step() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        sched.add(1, 1).unwrap();
        sched.add_cycles(1);

        let mut fired = Vec::new();
        // Can't borrow `sched` mutably inside the closure and from outside at once, so
        // collect requested follow-ups and add them after `step_with` returns for this
        // first pass, then step again.
        let mut follow_ups = Vec::new();
        sched.step_with(|p, _| {
            fired.push(p);
            follow_ups.push(p + 1);
        });
        for f in follow_ups {
            sched.add(0, f).unwrap();
        }
        sched.step_with(|p, _| fired.push(p));
        assert_eq!(fired, vec![1, 2]);
    }
}

use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// Opaque identity of a scheduled timer, used for cancellation. Handles are
///  never reused within one queue.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimerHandle(u64);

/// Priority queue of absolute-deadline timers.
///
/// Entries with equal deadlines fire in insertion order. Cancellation is
///  lazy: a cancelled entry stays in the heap and is skipped when it
///  surfaces, so both `schedule` and `cancel` are O(log n) / O(1).
pub struct TimerQueue<T> {
    heap: BinaryHeap<TimerEntry<T>>,
    pending: FxHashSet<u64>,
    cancelled: FxHashSet<u64>,
    next_seq: u64,
}

struct TimerEntry<T> {
    deadline: Instant,
    seq: u64,
    payload: T,
}

impl<T> PartialEq for TimerEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl<T> Eq for TimerEntry<T> {}

impl<T> PartialOrd for TimerEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for TimerEntry<T> {
    // inverted so the max-heap surfaces the earliest (deadline, seq) first
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> TimerQueue<T> {
        TimerQueue {
            heap: BinaryHeap::new(),
            pending: FxHashSet::default(),
            cancelled: FxHashSet::default(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq);
        self.heap.push(TimerEntry { deadline, seq, payload });
        TimerHandle(seq)
    }

    /// Returns `false` when the timer already fired or was cancelled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.pending.remove(&handle.0) {
            self.cancelled.insert(handle.0);
            true
        }
        else {
            false
        }
    }

    /// Deadline of the earliest live timer, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_cancelled_head();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Detaches and returns the earliest timer that is due at `now` - at most
    ///  one per call, so one loop iteration dispatches one expiry.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        self.drop_cancelled_head();
        if self.heap.peek().is_some_and(|e| e.deadline <= now) {
            let entry = self.heap.pop().expect("peek just succeeded");
            self.pending.remove(&entry.seq);
            Some(entry.payload)
        }
        else {
            None
        }
    }

    pub fn is_empty(&mut self) -> bool {
        self.drop_cancelled_head();
        self.heap.is_empty()
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if !self.cancelled.remove(&entry.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

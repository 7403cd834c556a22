//! Event timer over a monotonic virtual timeline.
//!
//! All timers fire on the single loop thread that owns the `EventTimer`.
//! Time is an offset from loop start; the production driver advances it
//! from a wall `Instant`, tests advance it directly. Entries are keyed by
//! `(name, target)` and at most one live entry exists per key, so
//! re-scheduling replaces the prior entry.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

/// Identifies a callback target (a service, in practice) for keying and
/// cancellation. Stable for the lifetime of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u64);

/// Shared read handle for the timer's notion of "now".
///
/// Cheap to clone; every clone observes the same timeline. This is the
/// single-current-time variable of the loop: services read freshness from
/// the same clock the timer advances.
#[derive(Clone)]
pub struct MonotonicClock(Rc<Cell<Duration>>);

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock(Rc::new(Cell::new(Duration::ZERO)))
    }

    pub fn now(&self) -> Duration {
        self.0.get()
    }

    fn set(&self, t: Duration) {
        self.0.set(t);
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A fired timer entry, handed back to the dispatcher.
pub struct Firing<E> {
    pub name: &'static str,
    pub target: TargetId,
    pub payload: E,
}

struct LiveEntry<E> {
    seq: u64,
    due: Duration,
    repeat: Option<Duration>,
    payload: E,
}

/// Heap order is (due, seq); payloads live in the keyed map so `cancel`
/// releases them immediately instead of waiting for the heap to drain.
struct HeapEntry {
    due: Duration,
    seq: u64,
    name: &'static str,
    target: TargetId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the earliest entry first
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct EventTimer<E> {
    clock: MonotonicClock,
    seq: u64,
    heap: BinaryHeap<HeapEntry>,
    live: HashMap<(&'static str, TargetId), LiveEntry<E>>,
}

impl<E: Clone> EventTimer<E> {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }

    pub fn with_clock(clock: MonotonicClock) -> Self {
        EventTimer {
            clock,
            seq: 0,
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock.clone()
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Schedule `payload` to fire after `delay`, replacing any live entry
    /// with the same `(name, target)` key. A zero delay fires at the next
    /// scheduler turn, never inside the caller. `repeat` re-arms the entry
    /// with the given interval after each firing.
    pub fn schedule(
        &mut self,
        name: &'static str,
        target: TargetId,
        delay: Duration,
        repeat: Option<Duration>,
        payload: E,
    ) {
        let due = self.clock.now() + delay;
        self.seq += 1;
        let seq = self.seq;
        if self.live.contains_key(&(name, target)) {
            trace!(target: "sched", "replacing scheduled {name} for {target:?}");
        }
        self.live.insert(
            (name, target),
            LiveEntry {
                seq,
                due,
                repeat,
                payload,
            },
        );
        self.heap.push(HeapEntry {
            due,
            seq,
            name,
            target,
        });
    }

    /// Idempotent; cancelling a missing timer only leaves a trace line.
    pub fn cancel(&mut self, name: &'static str, target: TargetId) {
        if self.live.remove(&(name, target)).is_none() {
            trace!(target: "sched", "cancel of missing {name} for {target:?}");
        }
        // the heap entry is skipped lazily when it surfaces
    }

    pub fn exists(&self, name: &'static str, target: TargetId) -> bool {
        self.live.contains_key(&(name, target))
    }

    /// Move the clock forward by `dt`. Due entries fire on the next
    /// `pop_due` round.
    pub fn advance(&mut self, dt: Duration) {
        let t = self.clock.now() + dt;
        self.clock.set(t);
    }

    /// Move the clock to the absolute offset `t`; never moves backwards.
    pub fn advance_to(&mut self, t: Duration) {
        if t > self.clock.now() {
            self.clock.set(t);
        }
    }

    /// Earliest live deadline, pruning already-cancelled heap heads.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        loop {
            let head = self.heap.peek()?;
            match self.live.get(&(head.name, head.target)) {
                Some(entry) if entry.seq == head.seq => return Some(head.due),
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Pop the earliest entry that is due at or before "now", skipping
    /// entries cancelled or replaced since they were pushed. Returns None
    /// once nothing else is due.
    pub fn pop_due(&mut self) -> Option<Firing<E>> {
        let now = self.clock.now();
        while matches!(self.heap.peek(), Some(head) if head.due <= now) {
            let Some(head) = self.heap.pop() else { break };
            let key = (head.name, head.target);
            match self.live.get(&key) {
                Some(live) if live.seq == head.seq => {}
                _ => continue, // cancelled or replaced
            }
            let Some(entry) = self.live.remove(&key) else {
                continue;
            };
            if let Some(interval) = entry.repeat {
                self.schedule(
                    head.name,
                    head.target,
                    interval,
                    entry.repeat,
                    entry.payload.clone(),
                );
            }
            return Some(Firing {
                name: head.name,
                target: head.target,
                payload: entry.payload,
            });
        }
        None
    }

    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }
}

impl<E: Clone> Default for EventTimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

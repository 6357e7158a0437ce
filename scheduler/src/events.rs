//! Profiling event stream: `LAUNCH`, `FINISH`, `TASK_BEGIN`, `TASK_END`, and
//! user `TASK_EVENT`s, one ring buffer per worker, merged by timestamp by
//! whoever consumes them.

use crate::task_id::TaskId;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum Event {
    Launch { name: &'static str },
    Finish { name: &'static str, ns: u64 },
    TaskBegin { task_id: TaskId, ns: u64 },
    TaskEnd { task_id: TaskId, ns: u64 },
    TaskEvent { task_id: TaskId, message: String },
}

impl Event {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Event::TaskBegin { task_id, .. }
            | Event::TaskEnd { task_id, .. }
            | Event::TaskEvent { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Where the scheduler measures monotonic time from. Every worker shares
/// the one instance created at scheduler construction, so timestamps across
/// workers are directly comparable.
#[derive(Debug)]
pub struct Clock(Instant);

impl Clock {
    pub fn start() -> Self {
        Clock(Instant::now())
    }

    pub fn now_nanos(&self) -> u64 {
        self.0.elapsed().as_nanos() as u64
    }
}

/// Destination for profiling events. The scheduler calls `record` from
/// whichever worker produced the event; implementations must not block on
/// another worker.
pub trait EventSink: Send + Sync {
    fn record(&self, worker_index: usize, event: Event);
    /// Drain everything recorded for `worker_index`, oldest first. Used by
    /// tests and by any offline consumer merging per-worker streams.
    fn drain(&self, worker_index: usize) -> Vec<Event>;
}

/// Fixed-capacity, single-writer-per-slot ring buffer of events, one per
/// worker. Pushing past capacity silently overwrites the oldest entry —
/// profiling data is best-effort, never a reason to block a worker.
pub struct RingEventSink {
    rings: Vec<EventRing>,
    capacity: usize,
}

struct EventRing {
    slots: Box<[UnsafeCell<Option<Event>>]>,
    write_index: AtomicUsize,
}

// SAFETY: exactly one worker thread ever calls `push` on a given `EventRing`
// (the one it belongs to); `drain` is only called after that worker has
// stopped producing (at shutdown, or under an external synchronization
// point controlled by the caller), so there is never a concurrent
// reader/writer pair.
unsafe impl Sync for EventRing {}

impl EventRing {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| UnsafeCell::new(None)).collect();
        Self { slots, write_index: AtomicUsize::new(0) }
    }

    fn push(&self, event: Event) {
        let idx = self.write_index.fetch_add(1, Ordering::AcqRel);
        let slot = idx % self.slots.len();
        // SAFETY: single writer per ring, see struct-level comment.
        unsafe {
            *self.slots[slot].get() = Some(event);
        }
    }

    fn drain(&self) -> Vec<Event> {
        let written = self.write_index.load(Ordering::Acquire);
        let count = written.min(self.slots.len());
        let start = written.saturating_sub(count);
        (start..written)
            .filter_map(|i| {
                let slot = i % self.slots.len();
                // SAFETY: see struct-level comment; the writer has stopped.
                unsafe { (*self.slots[slot].get()).clone() }
            })
            .collect()
    }
}

impl RingEventSink {
    pub fn new(worker_count: usize, capacity_per_worker: usize) -> Self {
        Self {
            rings: (0..worker_count).map(|_| EventRing::new(capacity_per_worker)).collect(),
            capacity: capacity_per_worker,
        }
    }

    pub fn capacity_per_worker(&self) -> usize {
        self.capacity
    }
}

impl EventSink for RingEventSink {
    fn record(&self, worker_index: usize, event: Event) {
        if let Some(ring) = self.rings.get(worker_index) {
            ring.push(event);
        }
    }

    fn drain(&self, worker_index: usize) -> Vec<Event> {
        self.rings.get(worker_index).map(EventRing::drain).unwrap_or_default()
    }
}

/// Discards every event. Useful when a caller has no profiling consumer.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _worker_index: usize, _event: Event) {}
    fn drain(&self, _worker_index: usize) -> Vec<Event> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_drains_in_order() {
        let sink = RingEventSink::new(2, 8);
        sink.record(0, Event::Launch { name: "a" });
        sink.record(0, Event::Finish { name: "a", ns: 10 });
        let drained = sink.drain(0);
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], Event::Launch { .. }));
        assert!(matches!(drained[1], Event::Finish { .. }));
    }

    #[test]
    fn overflow_keeps_most_recent() {
        let sink = RingEventSink::new(1, 4);
        for i in 0..10u64 {
            sink.record(0, Event::Finish { name: "x", ns: i });
        }
        let drained = sink.drain(0);
        assert_eq!(drained.len(), 4);
        let nss: Vec<u64> = drained
            .iter()
            .map(|e| match e {
                Event::Finish { ns, .. } => *ns,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(nss, vec![6, 7, 8, 9]);
    }

    #[test]
    fn out_of_range_worker_drains_empty() {
        let sink = RingEventSink::new(1, 4);
        assert!(sink.drain(5).is_empty());
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::start();
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }
}

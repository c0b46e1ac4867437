// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! `FrameTimer`/`DelayedFunction` helpers (§4.6 of `SPEC_FULL.md`).
//!
//! `spec.md` §1 names these as peripheral utilities outside the core and
//! explicitly scopes them down to "only the minimal interface specified in
//! §6": enough for `yield_frame`/`yield_ms` to be meaningful to an engine
//! driver, nothing resembling a general-purpose timer wheel.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// A source of "frame" ticks an engine increments once per driver-loop
/// iteration. `Sleep::Frames(n)` is resolved against this by the engine,
/// never by the task core (§5).
pub trait FrameClock: Send + Sync {
    /// The current frame tick. Strictly increasing across calls made from
    /// the same engine's driver thread.
    fn now_frame(&self) -> u64;
}

/// A monotonically-incrementing [`FrameClock`] suitable for a single
/// engine's own driver loop (one tick per call to
/// [`MonotonicFrameClock::advance`]).
#[derive(Debug, Default)]
pub struct MonotonicFrameClock {
    tick: std::sync::atomic::AtomicU64,
}

impl MonotonicFrameClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by one tick and return the new value.
    pub fn advance(&self) -> u64 {
        self.tick.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }
}

impl FrameClock for MonotonicFrameClock {
    fn now_frame(&self) -> u64 {
        self.tick.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// A boxed, one-shot deferred call paired with the [`Instant`] it becomes
/// due, ordered for a min-heap by that deadline.
struct DelayedEntry {
    due: Instant,
    seq: u64,
    func: Box<dyn FnOnce() + Send>,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse: BinaryHeap is a max-heap, we want the earliest deadline first.
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The "delayed-invocation helper" named in §1: a queue of one-shot
/// closures that become runnable once their deadline has passed.
///
/// `ThreadEngine` owns one instance and drains it once per driver tick
/// (§5: "the engine is responsible for refusing to dispatch a task whose
/// `Sleep` is in the future"). This is deliberately not a general-purpose
/// timer wheel: no periodic timers, no cancellation handles beyond
/// dropping the whole queue.
#[derive(Default)]
pub struct DelayedFunctionQueue {
    heap: BinaryHeap<DelayedEntry>,
    next_seq: u64,
}

impl DelayedFunctionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `func` to run no earlier than `due`.
    pub fn schedule(&mut self, due: Instant, func: Box<dyn FnOnce() + Send>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(DelayedEntry { due, seq, func });
    }

    /// Drain and return every closure whose deadline is `<= now`, in
    /// deadline order.
    pub fn poll(&mut self, now: Instant) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.due > now {
                break;
            }
            // Safe to unwrap: we just peeked Some.
            let entry = self.heap.pop().expect("heap non-empty after peek");
            due.push(entry.func);
        }
        due
    }

    /// `true` if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl std::fmt::Debug for DelayedFunctionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedFunctionQueue")
            .field("pending", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn poll_drains_only_due_entries_in_deadline_order() {
        let mut q = DelayedFunctionQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let base = Instant::now();

        let o1 = order.clone();
        q.schedule(base + Duration::from_millis(20), Box::new(move || o1.lock().unwrap().push(2)));
        let o2 = order.clone();
        q.schedule(base + Duration::from_millis(10), Box::new(move || o2.lock().unwrap().push(1)));
        let o3 = order.clone();
        q.schedule(base + Duration::from_millis(30), Box::new(move || o3.lock().unwrap().push(3)));

        let due = q.poll(base + Duration::from_millis(25));
        assert_eq!(due.len(), 2);
        for f in due {
            f();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert!(!q.is_empty());
    }

    #[test]
    fn monotonic_frame_clock_advances() {
        let clock = MonotonicFrameClock::new();
        assert_eq!(clock.now_frame(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.now_frame(), 1);
        let counter = AtomicU32::new(0);
        counter.fetch_add(1, Ordering::Relaxed);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}

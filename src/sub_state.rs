// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! [`SubState`] — the record guarded by the spec's `SubStateLock`: the
//! user-level `run_state` plus the five status bools and the three
//! [`ConditionMask`]s that implement the lost-wakeup-free edge-signalling
//! protocol (§4.3).

use crate::condition::ConditionMask;
use crate::state::RunState;

/// The mutable sub-state record of one task.
///
/// All fields are private; the wait/signal protocol is exposed only through
/// [`SubState::begin_wait`] and [`SubState::signal`], which are the literal
/// transcription of §4.3's formulas. Everything else is plain field access
/// through the crate-internal accessors used by `task.rs`.
#[derive(Debug)]
pub struct SubState {
    pub run_state: RunState,
    pub aborted: bool,
    pub finished: bool,
    pub reset: bool,
    pub wait_called: bool,
    pub need_run: bool,
    pub idle: ConditionMask,
    pub busy: ConditionMask,
    pub skip_wait: ConditionMask,
}

impl SubState {
    pub fn new() -> Self {
        Self {
            run_state: RunState::INITIAL,
            aborted: false,
            finished: false,
            reset: false,
            wait_called: false,
            need_run: false,
            idle: ConditionMask::NONE,
            busy: ConditionMask::NONE,
            skip_wait: ConditionMask::NONE,
        }
    }

    /// `run()`'s `reset()` step (§3 Lifecycle): clears `idle`/`aborted`/
    /// `finished`, sets `reset` and `need_run`. `run_state` is left alone;
    /// `initialize_impl` is responsible for setting it.
    pub fn reset_for_run(&mut self) {
        self.reset = true;
        self.idle = ConditionMask::NONE;
        self.aborted = false;
        self.finished = false;
        self.need_run = true;
    }

    /// `begin_loop()` (§4.2 step 4): clears `need_run` and `wait_called`,
    /// returns the `run_state` snapshot to dispatch against.
    pub fn begin_loop(&mut self) -> RunState {
        self.need_run = false;
        self.wait_called = false;
        self.run_state
    }

    /// `wait(conditions)` (§4.3): consumes any pending edge from `signal`
    /// before parking. `conditions` whose bit is already set in `busy` do
    /// not cause the task to go idle on that bit.
    pub fn begin_wait(&mut self, conditions: ConditionMask) {
        self.wait_called = true;
        self.busy |= self.skip_wait & conditions;
        self.skip_wait &= !conditions;
        self.idle = !self.busy & conditions;
    }

    /// `signal(condition)` (§4.3). Returns `true` iff the task was actually
    /// parked on (at least one bit of) `condition` and has now been woken;
    /// in that case `idle` is cleared and `need_run` is set so the next
    /// `multiplex` dispatch re-evaluates the hook.
    #[must_use]
    pub fn signal(&mut self, condition: ConditionMask) -> bool {
        self.skip_wait = (self.skip_wait & !condition) | (self.busy & condition);
        self.busy |= condition;
        if (self.idle & condition).is_none() {
            return false;
        }
        self.idle = ConditionMask::NONE;
        self.need_run = true;
        true
    }
}

impl Default for SubState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const A: ConditionMask = ConditionMask::bit(0);
    const B: ConditionMask = ConditionMask::bit(1);

    #[test]
    fn wait_then_signal_wakes_exactly_once() {
        let mut s = SubState::new();
        s.begin_wait(A);
        assert_eq!(s.idle, A);
        assert!(s.signal(A));
        assert_eq!(s.idle, ConditionMask::NONE);
        assert!(s.need_run);
    }

    #[test]
    fn signal_on_a_condition_not_waited_on_is_a_noop_return() {
        let mut s = SubState::new();
        s.begin_wait(A);
        assert!(!s.signal(B));
        assert_eq!(s.idle, A, "idle on A must survive an unrelated signal");
    }

    #[test]
    fn signal_before_wait_is_consumed_via_skip_wait_and_does_not_park() {
        let mut s = SubState::new();
        // Signal arrives before the task ever calls wait().
        assert!(!s.signal(A), "no one is idle yet, so signal() reports false");
        assert!(s.busy.intersects(A));
        s.begin_wait(A);
        // The pending busy bit means we never actually go idle on A.
        assert_eq!(s.idle, ConditionMask::NONE);
    }

    #[test]
    fn idle_and_busy_are_always_disjoint() {
        let mut s = SubState::new();
        s.begin_wait(A | B);
        assert!((s.idle & s.busy).is_none());
        s.signal(A);
        assert!((s.idle & s.busy).is_none());
    }
}

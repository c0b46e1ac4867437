// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The base-state graph (§4.1) and the small value types that ride along
//! with it: [`RunState`] (the opaque user-level sub-state id) and [`Sleep`]
//! (the yield-frame / yield-ms deadline, modeled as a sum type rather than
//! the source's sign-encoding trick — see the design notes on why).

use std::time::Instant;

/// The framework-level state of a task. Transitions strictly follow the
/// graph documented on [`next_transition`]; any other transition is a
/// defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum BaseState {
    Reset,
    Initialize,
    Multiplex,
    Abort,
    Finish,
    Callback,
    Killed,
}

/// The opaque, user-defined sub-state id. Only meaningful while
/// [`BaseState::Multiplex`] is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunState(pub u64);

impl RunState {
    /// The conventional first user state. `TaskHooks::initialize_impl`'s
    /// default implementation calls `set_state(RunState::INITIAL)`.
    pub const INITIAL: Self = Self(0);
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task's suspended-until deadline, set by `yield_frame`/`yield_ms` and
/// resolved by the engine driver, never by the task core itself (§5: "the
/// engine is responsible for refusing to dispatch a task whose `Sleep` is
/// in the future").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sleep {
    /// No sleep requested; eligible for dispatch as soon as re-queued.
    None,
    /// Sleep for `n` engine ticks ("frames").
    Frames(u32),
    /// Sleep until this absolute instant.
    Deadline(Instant),
}

impl Default for Sleep {
    fn default() -> Self {
        Sleep::None
    }
}

/// The reason `multiplex` was invoked (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexEvent {
    /// First dispatch after `run()`/`reset()`.
    InitialRun,
    /// A re-run requested by `signal()` from a thread that did not already
    /// hold `MultiplexMutex`.
    ScheduleRun,
    /// A normal tick from an engine's own driver loop.
    NormalRun,
    /// `abort()` waking a task suspended in `MULTIPLEX`.
    InsertAbort,
}

/// Applies the §4.1 transition table to `(base_state, aborted, finished,
/// need_run, idle_is_none, reset)` and returns `(next_state,
/// need_new_run)`.
///
/// This is the single source of truth for the base-state graph; every
/// transition the crate performs goes through this function so the graph
/// can be tested exhaustively in one place (see the `tests` module below).
#[must_use]
pub fn next_transition(
    base: BaseState,
    aborted: bool,
    finished: bool,
    need_run: bool,
    idle_is_none: bool,
    reset: bool,
) -> (BaseState, bool) {
    match base {
        BaseState::Reset => {
            if aborted {
                (BaseState::Killed, false)
            } else {
                (BaseState::Initialize, true)
            }
        }
        BaseState::Initialize => {
            if aborted {
                (BaseState::Abort, true)
            } else {
                (BaseState::Multiplex, need_run || idle_is_none)
            }
        }
        BaseState::Multiplex => {
            if aborted {
                (BaseState::Abort, true)
            } else if finished {
                (BaseState::Finish, true)
            } else {
                (BaseState::Multiplex, need_run || idle_is_none)
            }
        }
        BaseState::Abort => (BaseState::Finish, true),
        BaseState::Finish => (BaseState::Callback, true),
        BaseState::Callback => {
            if reset {
                (BaseState::Reset, true)
            } else {
                (BaseState::Killed, false)
            }
        }
        BaseState::Killed => {
            unreachable!("multiplex must never dispatch while BaseState = Killed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Every `(state, aborted, finished, need_run, idle_is_none, reset)`
    /// row reachable in practice, against the exact `(next, need_new_run)`
    /// the graph promises. `Killed` is exercised separately below since
    /// dispatching into it is a defect, not a table row.
    #[test]
    fn every_reachable_row_matches_the_graph() {
        let cases = [
            (BaseState::Reset, false, false, false, true, false, (BaseState::Initialize, true)),
            (BaseState::Reset, true, false, false, true, false, (BaseState::Killed, false)),
            (BaseState::Initialize, false, false, false, true, false, (BaseState::Multiplex, true)),
            (BaseState::Initialize, false, false, false, false, false, (BaseState::Multiplex, false)),
            (BaseState::Initialize, true, false, false, true, false, (BaseState::Abort, true)),
            (BaseState::Multiplex, false, false, true, true, false, (BaseState::Multiplex, true)),
            (BaseState::Multiplex, false, false, false, false, false, (BaseState::Multiplex, false)),
            (BaseState::Multiplex, false, true, false, true, false, (BaseState::Finish, true)),
            (BaseState::Multiplex, true, false, false, true, false, (BaseState::Abort, true)),
            (BaseState::Multiplex, true, true, false, true, false, (BaseState::Abort, true)),
            (BaseState::Abort, false, false, false, true, false, (BaseState::Finish, true)),
            (BaseState::Abort, true, false, false, true, false, (BaseState::Finish, true)),
            (BaseState::Finish, false, false, false, true, false, (BaseState::Callback, true)),
            (BaseState::Callback, false, false, false, true, true, (BaseState::Reset, true)),
            (BaseState::Callback, false, false, false, true, false, (BaseState::Killed, false)),
            (BaseState::Callback, true, false, false, true, false, (BaseState::Killed, false)),
            (BaseState::Callback, true, false, false, true, true, (BaseState::Reset, true)),
        ];

        for (base, aborted, finished, need_run, idle_is_none, reset, expected) in cases {
            let actual = next_transition(base, aborted, finished, need_run, idle_is_none, reset);
            assert_eq!(
                actual, expected,
                "next_transition({base:?}, aborted={aborted}, finished={finished}, need_run={need_run}, idle_is_none={idle_is_none}, reset={reset})"
            );
        }
    }

    #[test]
    #[should_panic(expected = "must never dispatch")]
    fn dispatching_from_killed_is_a_defect() {
        let _ = next_transition(BaseState::Killed, false, false, false, true, false);
    }

    #[test]
    fn aborted_always_wins_over_finished_in_multiplex() {
        let (next, _) = next_transition(BaseState::Multiplex, true, true, false, true, false);
        assert_eq!(next, BaseState::Abort);
    }
}

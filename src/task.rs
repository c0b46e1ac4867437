// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The task core (§3, §4): the state machine itself. `Task<H>` wraps one
//! user-supplied [`TaskHooks`] implementation and exposes `multiplex`,
//! `run`, `reset`, `set_state`, `wait`, `wait_until`, `signal`, `abort`,
//! `finish`, `kill`, `yield*`, and `target` per §6.
//!
//! Every lock in this module is acquired in the order documented in §5:
//! `StateLock` (here: `state`) then `SubStateLock` (here: `sub`);
//! `MultiplexMutex` is acquired outside both. `RunMutex` doubles as the
//! storage for the user's hooks object (`Mutex<H>`): locking it *is*
//! "entering a hook execution region", which is exactly what `RunMutex` is
//! for, and lets `abort()` rendezvous with an in-flight hook by simply
//! locking and releasing it.
//!
//! All methods here take `&self`; wherever an `Arc<Self>` is genuinely
//! needed (to hand a reference to an engine's queue, or to hold the
//! framework's own strong ref across `INITIALIZE..KILLED`) it is obtained
//! by upgrading an internal `Weak<Task<H>>`, rather than threading an
//! `Arc<Self>` receiver through every call — `&Arc<Self>` is not a
//! receiver type stable Rust accepts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::callback::{CallbackSlot, OnAbort};
use crate::condition::ConditionMask;
use crate::engine::{Engine, EngineId, EngineRegistry};
use crate::state::{next_transition, BaseState, MultiplexEvent, RunState, Sleep};
use crate::sub_state::SubState;

/// A task's identity. `Copy`, address-free, issued from a process-wide
/// counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        use std::sync::atomic::AtomicU64;
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// The object-safe surface every `Task<H>` exposes regardless of its hook
/// type — what engines, parents, and any-thread callers need (§6 "Any-thread
/// controls" plus the engine dispatch contract).
pub trait TaskObject: Send + Sync {
    fn task_id(&self) -> TaskId;

    /// §4.3. Returns `true` iff this call actually woke a parked task.
    fn signal(&self, condition: ConditionMask) -> bool;

    /// §4.4. Callable from any thread, including from inside this task's
    /// own hook (in which case the `RunMutex` rendezvous is skipped — see
    /// `Task::do_abort` for why a literal reading would self-deadlock).
    fn abort(&self);

    /// `idle != ConditionMask::NONE` (invariant 4).
    fn waiting(&self) -> bool;

    /// Waiting, or already marked `aborted` but not yet unwound.
    fn waiting_or_aborting(&self) -> bool;

    /// `BaseState != Killed`.
    fn running(&self) -> bool;

    /// The engine-facing `Sleep` deadline (§5); consumed (reset to `None`)
    /// the moment a dispatch begins.
    fn sleep(&self) -> Sleep;

    /// The engine this task currently belongs to, if any.
    fn current_engine(&self) -> Option<EngineId>;

    /// Re-enter the dispatch loop. `via_engine` is only meaningful for
    /// `NormalRun` (§4.2 step 1's "engine != CurrentEngine" fast path).
    fn multiplex(self: Arc<Self>, event: MultiplexEvent, via_engine: Option<EngineId>);
}

/// User-supplied hook overrides (§6 "Hook overrides").
pub trait TaskHooks: Send + 'static {
    /// Diagnostic rendering of a sub-state, for logging only.
    fn state_str_impl(&self, state: RunState) -> String {
        format!("state({})", state.0)
    }

    /// Must call `ctl.set_state(..)` at least once. The default matches
    /// §6: `set_state(RunState::INITIAL)`.
    fn initialize_impl(&mut self, ctl: &TaskControl<'_, Self>)
    where
        Self: Sized,
    {
        ctl.set_state(RunState::INITIAL);
    }

    fn multiplex_impl(&mut self, state: RunState, ctl: &TaskControl<'_, Self>)
    where
        Self: Sized;

    fn abort_impl(&mut self, _ctl: &TaskControl<'_, Self>)
    where
        Self: Sized,
    {
    }

    fn finish_impl(&mut self, _ctl: &TaskControl<'_, Self>)
    where
        Self: Sized,
    {
    }
}

/// The `StateLock`-guarded record: `BaseState` plus everything that is
/// meaningless outside of `MULTIPLEX` or that names another task/engine.
struct StateRecord {
    base: BaseState,
    wait_condition: Option<Box<dyn Fn() -> bool + Send>>,
    wait_mask: ConditionMask,
    sleep: Sleep,
    current_engine: Option<EngineId>,
    target_engine: Option<EngineId>,
    default_engine: Option<EngineId>,
    parent: Option<Weak<dyn TaskObject>>,
    parent_condition: ConditionMask,
    on_abort: OnAbort,
    callback: Option<CallbackSlot>,
}

impl StateRecord {
    fn new() -> Self {
        Self {
            base: BaseState::Reset,
            wait_condition: None,
            wait_mask: ConditionMask::NONE,
            sleep: Sleep::None,
            current_engine: None,
            target_engine: None,
            default_engine: None,
            parent: None,
            parent_condition: ConditionMask::NONE,
            on_abort: OnAbort::DoNothing,
            callback: None,
        }
    }
}

/// The state machine for one task. `H` is the user's hook type; `Task<H>`
/// is always used behind an `Arc` (construct with [`Task::new`]).
pub struct Task<H: TaskHooks> {
    id: TaskId,
    state: Mutex<StateRecord>,
    sub: Mutex<SubState>,
    multiplex_mutex: Mutex<()>,
    run_mutex: Mutex<H>,
    yield_flag: AtomicBool,
    in_callback: AtomicBool,
    hook_thread: Mutex<Option<ThreadId>>,
    /// The framework's own strong reference, held from `INITIALIZE` to
    /// `KILLED` (invariant 7). `None` otherwise.
    self_hold: Mutex<Option<Arc<Task<H>>>>,
    self_weak: Weak<Task<H>>,
}

impl<H: TaskHooks> std::fmt::Debug for Task<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

impl<H: TaskHooks> Task<H> {
    /// Construct a new task in `BaseState::Reset`, not yet running.
    #[must_use]
    pub fn new(hooks: H) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: TaskId::next(),
            state: Mutex::new(StateRecord::new()),
            sub: Mutex::new(SubState::new()),
            multiplex_mutex: Mutex::new(()),
            run_mutex: Mutex::new(hooks),
            yield_flag: AtomicBool::new(false),
            in_callback: AtomicBool::new(false),
            hook_thread: Mutex::new(None),
            self_hold: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("task outlived its own Arc")
    }

    /// `run(slot, default_engine)` (§6): start (or restart) the task,
    /// invoking `callback(success)` exactly once when it reaches
    /// `CALLBACK`, unless that callback itself issues a restart.
    pub fn run_with_callback(&self, callback: CallbackSlot, default_engine: Option<EngineId>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.callback = Some(callback);
            state.default_engine = default_engine;
        }
        self.kick_off();
    }

    /// `run(parent, condition, on_abort, default_engine)` (§6): start (or
    /// restart) the task with a parent back-reference instead of a slot.
    pub fn run_with_parent(
        &self,
        parent: &Arc<dyn TaskObject>,
        condition: ConditionMask,
        on_abort: OnAbort,
        default_engine: Option<EngineId>,
    ) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.parent = Some(Arc::downgrade(parent));
            state.parent_condition = condition;
            state.on_abort = on_abort;
            state.default_engine = default_engine;
        }
        self.kick_off();
    }

    fn kick_off(&self) {
        {
            let mut sub = self.sub.lock().unwrap_or_else(|e| e.into_inner());
            sub.reset_for_run();
        }
        tracing::debug!(task = %self.id, "run() -> reset(), kicking off initial_run");
        self.dispatch_loop(MultiplexEvent::InitialRun, None);
    }

    /// `kill()` (§4.4): callable only from inside the callback. Voids a
    /// restart that `finish_impl` (or an earlier point) had queued up via
    /// `run()`, so the task actually settles into `KILLED`.
    pub fn kill(&self) {
        assert!(
            self.in_callback.load(Ordering::SeqCst),
            "kill() called outside the callback"
        );
        self.sub.lock().unwrap_or_else(|e| e.into_inner()).reset = false;
    }

    fn currently_in_own_hook(&self) -> bool {
        *self.hook_thread.lock().unwrap_or_else(|e| e.into_inner()) == Some(std::thread::current().id())
    }

    fn assert_in_hook(&self, what: &str) {
        assert!(
            self.currently_in_own_hook(),
            "{what}() called outside of a running hook"
        );
    }

    /// The dispatch loop: §4.2 steps 1-10.
    fn dispatch_loop(&self, event: MultiplexEvent, via_engine: Option<EngineId>) {
        // Step 1: drop-out fast paths.
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if event == MultiplexEvent::InsertAbort && !matches!(state.base, BaseState::Reset | BaseState::Multiplex) {
                // Reset is included alongside Multiplex: a task aborted
                // before it was ever run (spec.md's "abort before
                // initialize") must still collapse RESET -> KILLED with no
                // hook call, which only the ordinary dispatch loop can do
                // safely relative to a concurrent run() (see do_abort).
                tracing::trace!(task = %self.id, "insert_abort arrived after completion, ignoring");
                return;
            }
            if event == MultiplexEvent::NormalRun && via_engine != state.current_engine {
                tracing::trace!(task = %self.id, "normal_run from a stale engine, ignoring");
                return;
            }
        }

        // Step 2: non-blocking acquire of MultiplexMutex.
        let mmx_guard = match self.multiplex_mutex.try_lock() {
            Ok(g) => g,
            Err(_) => {
                tracing::trace!(task = %self.id, ?event, "multiplex contended, piggy-backing on current runner");
                return;
            }
        };

        // Step 3: SCHEDULE_RUN dedup.
        if event == MultiplexEvent::ScheduleRun {
            let sub = self.sub.lock().unwrap_or_else(|e| e.into_inner());
            if !sub.need_run {
                tracing::trace!(task = %self.id, "schedule_run drained by a competitor");
                return;
            }
        }

        let engine_at_entry = self.state.lock().unwrap_or_else(|e| e.into_inner()).current_engine;

        loop {
            // Step 4: snapshot + begin_loop().
            let (base_now, waiting, run_state) = {
                let base_now;
                let waiting;
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    base_now = state.base;
                    waiting = state.wait_condition.is_some();
                    state.sleep = Sleep::None; // consumed the instant dispatch begins
                }
                let run_state = self.sub.lock().unwrap_or_else(|e| e.into_inner()).begin_loop();
                (base_now, waiting, run_state)
            };

            if base_now == BaseState::Killed {
                tracing::trace!(task = %self.id, "multiplex dispatched while Killed, ignoring");
                break;
            }

            // Step 5: dispatch under RunMutex (except the waiting branch,
            // which runs under StateLock with no hook call, per §4.2).
            if base_now == BaseState::Multiplex && waiting {
                self.dispatch_waiting_branch();
            } else {
                self.dispatch_hook(base_now, run_state);
            }

            // Step 6/7: recompute the transition and apply it.
            let (next_base, need_new_run) = {
                let sub = self.sub.lock().unwrap_or_else(|e| e.into_inner());
                next_transition(base_now, sub.aborted, sub.finished, sub.need_run, sub.idle.is_none(), sub.reset)
            };

            let mut left_callback_to_killed = false;
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                debug_assert!(
                    is_legal_transition(state.base, next_base),
                    "illegal base-state transition {:?} -> {:?}",
                    state.base,
                    next_base
                );
                tracing::trace!(task = %self.id, from = %state.base, to = %next_base, "transition");
                state.base = next_base;
                if next_base == BaseState::Killed {
                    state.current_engine = None;
                    left_callback_to_killed = true;
                }
            }

            // Step 8: resolve the next engine (meaningless once Killed).
            if next_base != BaseState::Killed {
                self.resolve_and_enlist_engine();
            }

            if left_callback_to_killed {
                // Step 10: release the framework's own ref, after unlocks.
                *self.self_hold.lock().unwrap_or_else(|e| e.into_inner()) = None;
            }

            // Step 9: loop continuation. Re-read `need_run` fresh here rather
            // than trusting the step 6/7 snapshot: a `signal()` landing after
            // that snapshot was taken, but before this check, sets
            // `need_run` and tries to re-enter via `ScheduleRun` — which
            // fails its own `try_lock` on `multiplex_mutex` (we still hold
            // it) and piggy-backs on us instead. If we broke out here on the
            // stale snapshot, that piggy-backed wakeup would be lost for any
            // task with no engine re-polling it. The exit path after
            // clearing the claim must re-check the flag.
            let yielded = self.yield_flag.swap(false, Ordering::SeqCst);
            let engine_now = self.state.lock().unwrap_or_else(|e| e.into_inner()).current_engine;
            let need_run_now = self.sub.lock().unwrap_or_else(|e| e.into_inner()).need_run;
            if (need_new_run || need_run_now) && !yielded && engine_now == engine_at_entry {
                continue;
            }
            break;
        }

        drop(mmx_guard);
    }

    fn dispatch_waiting_branch(&self) {
        let pred_true = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.wait_condition.as_deref().is_some_and(|pred| pred())
        };
        if pred_true {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).wait_condition = None;
            self.sub.lock().unwrap_or_else(|e| e.into_inner()).idle = ConditionMask::NONE;
        } else {
            let mask = self.state.lock().unwrap_or_else(|e| e.into_inner()).wait_mask;
            self.sub.lock().unwrap_or_else(|e| e.into_inner()).begin_wait(mask);
        }
    }

    fn dispatch_hook(&self, base_now: BaseState, run_state: RunState) {
        *self.hook_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(std::thread::current().id());
        {
            let mut hooks = self.run_mutex.lock().unwrap_or_else(|e| e.into_inner());
            let ctl = TaskControl { task: self };
            match base_now {
                BaseState::Reset => { /* no-op: thread kick-start */ }
                BaseState::Initialize => {
                    *self.self_hold.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.arc());
                    tracing::debug!(task = %self.id, "initialize_impl");
                    hooks.initialize_impl(&ctl);
                }
                BaseState::Multiplex => {
                    let state_str = hooks.state_str_impl(run_state);
                    tracing::trace!(task = %self.id, state = %state_str, "multiplex_impl");
                    hooks.multiplex_impl(run_state, &ctl);
                }
                BaseState::Abort => {
                    tracing::debug!(task = %self.id, "abort_impl");
                    hooks.abort_impl(&ctl);
                }
                BaseState::Finish => {
                    self.sub.lock().unwrap_or_else(|e| e.into_inner()).reset = false;
                    tracing::debug!(task = %self.id, "finish_impl");
                    hooks.finish_impl(&ctl);
                }
                BaseState::Callback => {
                    drop(hooks);
                    self.run_callback();
                }
                BaseState::Killed => unreachable!("handled before dispatch"),
            }
        }
        *self.hook_thread.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// §4.5.
    fn run_callback(&self) {
        self.in_callback.store(true, Ordering::SeqCst);
        let aborted = self.sub.lock().unwrap_or_else(|e| e.into_inner()).aborted;

        let (parent_weak, parent_condition, on_abort) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.parent.clone(), state.parent_condition, state.on_abort)
        };

        let mut parent_cleared = false;
        if let Some(parent_weak) = parent_weak {
            if let Some(parent_arc) = parent_weak.upgrade() {
                if parent_arc.running() {
                    if aborted && on_abort == OnAbort::AbortParent {
                        parent_arc.abort();
                        self.state.lock().unwrap_or_else(|e| e.into_inner()).parent = None;
                        parent_cleared = true;
                    } else if !aborted || on_abort == OnAbort::SignalParent {
                        parent_arc.signal(parent_condition);
                    }
                }
            }
        }

        let callback = self.state.lock().unwrap_or_else(|e| e.into_inner()).callback.take();
        match callback {
            Some(cb) => {
                tracing::debug!(task = %self.id, success = !aborted, "invoking callback slot");
                cb(!aborted);
                let restarted = self.sub.lock().unwrap_or_else(|e| e.into_inner()).reset;
                if !restarted && !parent_cleared {
                    self.state.lock().unwrap_or_else(|e| e.into_inner()).parent = None;
                }
            }
            None => {
                if !parent_cleared {
                    self.state.lock().unwrap_or_else(|e| e.into_inner()).parent = None;
                }
            }
        }
        self.in_callback.store(false, Ordering::SeqCst);
    }

    fn resolve_and_enlist_engine(&self) {
        let preferred = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.target_engine.or(state.current_engine).or(state.default_engine)
        };
        let resolved = preferred.or_else(|| EngineRegistry::auxiliary().ok().map(|e| e.id()));

        let changed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let changed = resolved != state.current_engine;
            state.current_engine = resolved;
            state.target_engine = None;
            changed
        };

        if changed {
            if let Some(id) = resolved {
                if let Ok(engine) = EngineRegistry::resolve(id) {
                    let dyn_self: Arc<dyn TaskObject> = self.arc();
                    engine.enqueue(dyn_self);
                } else {
                    tracing::warn!(task = %self.id, engine = ?id, "resolved engine is not registered");
                }
            }
        }
    }

    /// `abort()` (§4.4). The spec blocks on `RunMutex` unconditionally to
    /// rendezvous with an in-flight hook; a literal reading deadlocks when
    /// a task aborts itself from inside its own hook, so that one case is
    /// special-cased to skip the (meaningless) self-wait. See DESIGN.md.
    fn do_abort(&self) {
        let needs_wake;
        {
            let mut sub = self.sub.lock().unwrap_or_else(|e| e.into_inner());
            sub.aborted = !sub.finished;
            sub.idle = ConditionMask::NONE;
            sub.need_run = true;
        }
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            // Reset is included alongside Multiplex: a task aborted before
            // it was ever run still has to collapse RESET -> KILLED with no
            // hook call (spec's "abort before initialize"). Routing that
            // through the ordinary dispatch loop, rather than mutating
            // `state.base` directly here, keeps it race-free against a
            // concurrent run() that might already hold `multiplex_mutex`:
            // either this call wins the try_lock and drives Reset -> Killed
            // itself, or it loses it and the in-flight run() observes
            // `aborted` at its own next transition and gets there instead.
            needs_wake = matches!(state.base, BaseState::Reset | BaseState::Multiplex);
        }
        if needs_wake {
            // try_lock-based MultiplexMutex makes this safe to call even
            // when the caller already holds it: it just returns early.
            self.dispatch_loop(MultiplexEvent::InsertAbort, None);
        }
        if !self.currently_in_own_hook() {
            drop(self.run_mutex.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }
}

impl<H: TaskHooks> TaskObject for Task<H> {
    fn task_id(&self) -> TaskId {
        self.id
    }

    fn signal(&self, condition: ConditionMask) -> bool {
        let woke = self.sub.lock().unwrap_or_else(|e| e.into_inner()).signal(condition);
        if woke {
            tracing::trace!(task = %self.id, ?condition, "signal woke task");
            self.dispatch_loop(MultiplexEvent::ScheduleRun, None);
        }
        woke
    }

    fn abort(&self) {
        self.do_abort();
    }

    fn waiting(&self) -> bool {
        !self.sub.lock().unwrap_or_else(|e| e.into_inner()).idle.is_none()
    }

    fn waiting_or_aborting(&self) -> bool {
        let sub = self.sub.lock().unwrap_or_else(|e| e.into_inner());
        !sub.idle.is_none() || sub.aborted
    }

    fn running(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).base != BaseState::Killed
    }

    fn sleep(&self) -> Sleep {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).sleep
    }

    fn current_engine(&self) -> Option<EngineId> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).current_engine
    }

    fn multiplex(self: Arc<Self>, event: MultiplexEvent, via_engine: Option<EngineId>) {
        self.dispatch_loop(event, via_engine);
    }
}

fn is_legal_transition(from: BaseState, to: BaseState) -> bool {
    use BaseState::{Abort, Callback, Finish, Initialize, Killed, Multiplex, Reset};
    matches!(
        (from, to),
        (Reset, Initialize)
            | (Reset, Killed)
            | (Initialize, Abort)
            | (Initialize, Multiplex)
            | (Multiplex, Abort)
            | (Multiplex, Finish)
            | (Multiplex, Multiplex)
            | (Abort, Finish)
            | (Finish, Callback)
            | (Callback, Reset)
            | (Callback, Killed)
    )
}

/// The in-hook control surface (§6 "In-hook controls"). Every method here
/// asserts the calling thread is inside this task's own hook (invariant 2);
/// violating that is a protocol error, reported via `assert!`, not a
/// `Result` (§7).
pub struct TaskControl<'a, H: TaskHooks> {
    task: &'a Task<H>,
}

impl<'a, H: TaskHooks> TaskControl<'a, H> {
    /// `set_state(s)` (§4.3): only the last call in one hook invocation
    /// takes effect.
    pub fn set_state(&self, s: RunState) {
        self.task.assert_in_hook("set_state");
        let mut sub = self.task.sub.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(
            sub.wait_called || sub.idle.is_none(),
            "set_state called while idle without an intervening wait()"
        );
        sub.run_state = s;
    }

    /// `wait(conditions)` (§4.3).
    pub fn wait(&self, conditions: ConditionMask) {
        self.task.assert_in_hook("wait");
        self.task.sub.lock().unwrap_or_else(|e| e.into_inner()).begin_wait(conditions);
    }

    /// `wait_until(pred, conditions)` (§4.3): re-evaluated by the
    /// framework at each subsequent `MULTIPLEX` dispatch, not by
    /// re-entering `multiplex_impl`. `pred` must be idempotent and
    /// side-effect-free (§5).
    pub fn wait_until(&self, pred: impl Fn() -> bool + Send + 'static, conditions: ConditionMask) {
        self.task.assert_in_hook("wait_until");
        if pred() {
            return;
        }
        {
            let mut state = self.task.state.lock().unwrap_or_else(|e| e.into_inner());
            state.wait_condition = Some(Box::new(pred));
            state.wait_mask = conditions;
        }
        self.task.sub.lock().unwrap_or_else(|e| e.into_inner()).begin_wait(conditions);
    }

    /// `finish()` (§4.4).
    pub fn finish(&self) {
        self.task.assert_in_hook("finish");
        let mut sub = self.task.sub.lock().unwrap_or_else(|e| e.into_inner());
        sub.finished = true;
        sub.idle = ConditionMask::NONE;
    }

    /// `target(engine)` (§4.4): sets `TargetEngine`, consulted at the next
    /// transition's engine resolution (§4.2 step 8).
    pub fn target(&self, engine: EngineId) {
        self.task.assert_in_hook("target");
        self.task.state.lock().unwrap_or_else(|e| e.into_inner()).target_engine = Some(engine);
    }

    /// `yield()` (§4.4): relinquish after this iteration, requeuing on the
    /// currently-selected engine.
    pub fn yield_now(&self) {
        self.task.assert_in_hook("yield");
        self.task.yield_flag.store(true, Ordering::SeqCst);
    }

    /// `yield(engine)` ≡ `target(engine); yield()`.
    pub fn yield_to(&self, engine: EngineId) {
        self.target(engine);
        self.yield_now();
    }

    /// `yield_if_not(engine)`.
    pub fn yield_if_not(&self, engine: EngineId) -> bool {
        let current = self.task.state.lock().unwrap_or_else(|e| e.into_inner()).current_engine;
        if current != Some(engine) {
            self.yield_to(engine);
            true
        } else {
            false
        }
    }

    /// `yield_frame(n)`: sleep `n` engine ticks, then yield to the
    /// process-wide "main thread" engine.
    pub fn yield_frame(&self, n: u32) {
        self.task.assert_in_hook("yield_frame");
        self.task.state.lock().unwrap_or_else(|e| e.into_inner()).sleep = Sleep::Frames(n);
        self.yield_to_main_thread_engine();
    }

    /// `yield_ms(ms)`: sleep until `now + ms`, then yield to the
    /// process-wide "main thread" engine.
    pub fn yield_ms(&self, ms: u64) {
        self.task.assert_in_hook("yield_ms");
        let deadline = Instant::now() + Duration::from_millis(ms);
        self.task.state.lock().unwrap_or_else(|e| e.into_inner()).sleep = Sleep::Deadline(deadline);
        self.yield_to_main_thread_engine();
    }

    fn yield_to_main_thread_engine(&self) {
        match EngineRegistry::main_thread() {
            Ok(engine) => self.yield_to(engine.id()),
            Err(err) => {
                tracing::warn!(task = %self.task.id, %err, "no main-thread engine configured; yielding in place");
                self.yield_now();
            }
        }
    }
}

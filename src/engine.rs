// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The engine contract (§6) and one concrete, fully-driven implementation,
//! [`ThreadEngine`], so the state machine in `task.rs` is testable
//! end-to-end without every test having to hand-roll a driver loop.
//!
//! An engine owns a queue of tasks and drives them by calling
//! `multiplex(NormalRun, self)`; it removes tasks whose `current_engine`
//! has changed out from under it (§6). Engine identity is a small `Copy`
//! handle resolved through [`EngineRegistry`], never a raw pointer (design
//! notes, §9: "an engine/id registry indexed by a small handle").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::state::{MultiplexEvent, Sleep};
use crate::task::{TaskId, TaskObject};
use crate::timer::{DelayedFunctionQueue, FrameClock, MonotonicFrameClock};

/// A small, `Copy` handle identifying one live [`Engine`]. Never a raw
/// pointer — resolved through [`EngineRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl EngineId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The external contract an engine fulfils (§6): maintain a queue of
/// tasks, dispatch `multiplex(NormalRun, self)` to eligible ones, and drop
/// tasks whose `current_engine` is no longer `self`.
pub trait Engine: Send + Sync + std::fmt::Debug {
    /// This engine's identity, as resolved through [`EngineRegistry`].
    fn id(&self) -> EngineId;

    /// Enqueue `task` for dispatch by this engine's driver thread. Called
    /// both for a brand-new task and when a task's `target_engine`
    /// redirects it here (§4.2 step 8).
    fn enqueue(&self, task: Arc<dyn TaskObject>);
}

/// Process-wide table of live engines, keyed by [`EngineId`].
///
/// Resolves `TargetEngine ?? CurrentEngine ?? DefaultEngine ??
/// gAuxiliaryThreadEngine` (§4.2 step 8); the "auxiliary thread engine"
/// fallback is whatever engine was last installed via
/// [`EngineRegistry::set_auxiliary_engine`].
pub struct EngineRegistry {
    engines: Mutex<std::collections::HashMap<EngineId, Weak<dyn Engine>>>,
    auxiliary: Mutex<Option<Arc<dyn Engine>>>,
    main_thread: Mutex<Option<Arc<dyn Engine>>>,
}

static REGISTRY: OnceLock<EngineRegistry> = OnceLock::new();

impl EngineRegistry {
    fn global() -> &'static EngineRegistry {
        REGISTRY.get_or_init(|| EngineRegistry {
            engines: Mutex::new(std::collections::HashMap::new()),
            auxiliary: Mutex::new(None),
            main_thread: Mutex::new(None),
        })
    }

    /// Register `engine` so it can later be resolved by its [`EngineId`].
    pub fn register(engine: &Arc<dyn Engine>) {
        let registry = Self::global();
        let mut engines = registry.engines.lock().unwrap_or_else(|e| e.into_inner());
        engines.insert(engine.id(), Arc::downgrade(engine));
    }

    /// Resolve `id` to a live engine, or [`EngineError::UnknownEngine`] if
    /// it has shut down or was never registered.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RegistryPoisoned`] if the registry's own
    /// lock was poisoned by a prior panic, or
    /// [`EngineError::UnknownEngine`] if `id` has shut down or was never
    /// registered.
    pub fn resolve(id: EngineId) -> Result<Arc<dyn Engine>, EngineError> {
        let registry = Self::global();
        let engines = registry
            .engines
            .lock()
            .map_err(|_| EngineError::RegistryPoisoned { which: "engines" })?;
        engines
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(EngineError::UnknownEngine(id))
    }

    /// Install the process-wide fallback engine used when a task has no
    /// `target`/`current`/`default` engine of its own.
    pub fn set_auxiliary_engine(engine: Arc<dyn Engine>) {
        let registry = Self::global();
        *registry.auxiliary.lock().unwrap_or_else(|e| e.into_inner()) = Some(engine);
    }

    /// Remove the process-wide fallback engine (test teardown helper).
    pub fn clear_auxiliary_engine() {
        let registry = Self::global();
        *registry.auxiliary.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Resolve the auxiliary engine (§4.2 step 8's dispatch fallback for a
    /// task with no `target`/`current`/`default` engine of its own).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RegistryPoisoned`] if the auxiliary-slot
    /// lock was poisoned by a prior panic, or
    /// [`EngineError::AuxiliaryEngineNotConfigured`] if none was set.
    pub fn auxiliary() -> Result<Arc<dyn Engine>, EngineError> {
        let registry = Self::global();
        registry
            .auxiliary
            .lock()
            .map_err(|_| EngineError::RegistryPoisoned { which: "auxiliary" })?
            .clone()
            .ok_or(EngineError::AuxiliaryEngineNotConfigured)
    }

    /// Install the process-wide "main thread" engine that `yield_frame`/
    /// `yield_ms` target (§4.4), distinct from the auxiliary dispatch
    /// fallback: this one is specifically where frame- and deadline-based
    /// sleeps are expected to be resolved.
    pub fn set_main_thread_engine(engine: Arc<dyn Engine>) {
        let registry = Self::global();
        *registry.main_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(engine);
    }

    /// Remove the process-wide main-thread engine (test teardown helper).
    pub fn clear_main_thread_engine() {
        let registry = Self::global();
        *registry.main_thread.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Resolve the main-thread engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RegistryPoisoned`] if the main-thread-slot
    /// lock was poisoned by a prior panic, or
    /// [`EngineError::MainThreadEngineNotConfigured`] if none was set.
    pub fn main_thread() -> Result<Arc<dyn Engine>, EngineError> {
        let registry = Self::global();
        registry
            .main_thread
            .lock()
            .map_err(|_| EngineError::RegistryPoisoned { which: "main_thread" })?
            .clone()
            .ok_or(EngineError::MainThreadEngineNotConfigured)
    }
}

fn is_due(sleep: Sleep, now: Instant, frame_now: u64, armed_at_frame: Option<u64>) -> bool {
    match sleep {
        Sleep::None => true,
        Sleep::Deadline(at) => now >= at,
        Sleep::Frames(n) => match armed_at_frame {
            Some(armed) => frame_now.saturating_sub(armed) >= u64::from(n),
            None => false,
        },
    }
}

/// A reference engine: one dedicated OS thread driving a FIFO-ish queue of
/// tasks behind a mutex-guarded queue and a condvar, so the driver parks
/// instead of busy-spinning when idle, with a flag-and-join shutdown
/// handshake.
pub struct ThreadEngine {
    id: EngineId,
    queue: Mutex<VecDeque<Arc<dyn TaskObject>>>,
    cond: Condvar,
    shutdown: AtomicBool,
    frame_clock: MonotonicFrameClock,
    delayed: Mutex<DelayedFunctionQueue>,
    armed_frame: Mutex<std::collections::HashMap<TaskId, u64>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for ThreadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadEngine").field("id", &self.id).finish()
    }
}

impl ThreadEngine {
    /// Spawn a new engine thread. `poll_interval` bounds how long the
    /// driver sleeps between checking sleeping tasks and the delayed
    /// function queue; it does not bound wake latency for `signal()`,
    /// which re-enters `multiplex` directly on the signalling thread
    /// (§4.3).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ThreadSpawn`] if the OS failed to start the
    /// driver thread (e.g. the process/thread-count limit was hit).
    pub fn spawn(poll_interval: Duration) -> Result<Arc<Self>, EngineError> {
        let engine = Arc::new(Self {
            id: EngineId::next(),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            frame_clock: MonotonicFrameClock::new(),
            delayed: Mutex::new(DelayedFunctionQueue::new()),
            armed_frame: Mutex::new(std::collections::HashMap::new()),
            handle: Mutex::new(None),
            poll_interval,
        });

        let dyn_engine: Arc<dyn Engine> = engine.clone();
        EngineRegistry::register(&dyn_engine);

        let worker = engine.clone();
        let join = std::thread::Builder::new()
            .name(format!("statetask-engine-{}", engine.id.0))
            .spawn(move || worker.drive())
            .map_err(EngineError::ThreadSpawn)?;
        *engine.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);

        Ok(engine)
    }

    /// Signal the driver thread to exit after its current iteration and
    /// join it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cond.notify_all();
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }

    /// The number of tasks currently queued on this engine, surfaced
    /// without poison recovery: unlike the driver loop's own
    /// `.lock().unwrap_or_else(|e| e.into_inner())` (which keeps driving
    /// best-effort after a panic elsewhere left the queue merely
    /// *unlocked*, not corrupted), a caller asking for a diagnostic
    /// snapshot is told outright that a prior panic poisoned the lock
    /// rather than silently getting a recovered-but-unverified count.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LockPoisoned`] if the queue mutex was
    /// poisoned by a panic while held.
    pub fn queue_depth(&self) -> Result<usize, EngineError> {
        self.queue
            .lock()
            .map(|q| q.len())
            .map_err(|_| EngineError::LockPoisoned(self.id))
    }

    /// Schedule a one-shot closure to run on this engine's driver thread
    /// no earlier than `due` (the `DelayedFunction` helper, §4.6).
    pub fn schedule_delayed(&self, due: Instant, func: Box<dyn FnOnce() + Send>) {
        self.delayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .schedule(due, func);
        self.cond.notify_all();
    }

    fn drive(self: Arc<Self>) {
        tracing::debug!(engine = self.id.0, "engine thread starting");
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            {
                let due = self
                    .delayed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .poll(now);
                for f in due {
                    f();
                }
            }
            let frame_now = self.frame_clock.advance();

            let next_task = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                let mut armed = self.armed_frame.lock().unwrap_or_else(|e| e.into_inner());
                let idx = queue.iter().position(|t| {
                    if t.current_engine() != Some(self.id) {
                        return true; // stale task: pull it out to drop below
                    }
                    if t.waiting() {
                        // Parked on a wait condition: nothing to do until
                        // signal()/abort() re-enters multiplex directly
                        // from the signalling thread (§4.3/§4.4). Polling
                        // it here would re-run the hook with nothing new
                        // to report.
                        return false;
                    }
                    let armed_at = *armed.entry(t.task_id()).or_insert(frame_now);
                    is_due(t.sleep(), now, frame_now, Some(armed_at))
                });
                match idx {
                    Some(i) => {
                        let task = queue.remove(i).expect("index just located");
                        armed.remove(&task.task_id());
                        Some(task)
                    }
                    None => None,
                }
            };

            match next_task {
                Some(task) => {
                    if task.current_engine() != Some(self.id) {
                        tracing::trace!(
                            task = ?task.task_id(),
                            engine = self.id.0,
                            "dropping task that migrated to another engine"
                        );
                        continue;
                    }
                    task.clone().multiplex(MultiplexEvent::NormalRun, Some(self.id));
                    if task.current_engine() == Some(self.id) {
                        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(task);
                    }
                }
                None => {
                    let guard = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                    let _ = self
                        .cond
                        .wait_timeout(guard, self.poll_interval)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        tracing::debug!(engine = self.id.0, "engine thread exiting");
    }
}

impl Engine for ThreadEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn enqueue(&self, task: Arc<dyn TaskObject>) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(task);
        self.cond.notify_all();
    }
}

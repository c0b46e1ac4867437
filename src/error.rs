// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Recoverable errors (§7): engine-registration failures, registry-lock
//! poisoning, and engine-thread spawn failure. Protocol violations (calling
//! in-hook controls outside a hook, reentering `multiplex` on the same
//! thread, calling `kill()` outside the callback) are programmer errors and
//! are reported via `assert!`/`debug_assert!` panics, not this enum —
//! converting them into a `Result` would let caller code treat a framework
//! defect as a recoverable outcome, which §7 explicitly rules out.
//!
//! The `RegistryPoisoned`/`ThreadSpawn` shape here — a `which: &'static str`
//! naming the poisoned lock, and a dedicated spawn-failure variant wrapping
//! the `std::io::Error` from `Builder::spawn` — mirrors
//! `resilient_reactor_thread::SubscribeError` (`rrt_types.rs`): that type
//! propagates the identical two failure modes from `RRT::subscribe()` via
//! `.map_err(|_| SubscribeError::MutexPoisoned { which: "liveness" })?` and
//! `.map_err(SubscribeError::ThreadSpawn)?`, rather than recovering in
//! place. See DESIGN.md for which of this crate's locks follow that
//! propagate-on-poison idiom and which deliberately keep recovering.
//!
//! `SubscribeError` also derives `miette::Diagnostic`, pairing each variant
//! with a diagnostic code and actionable help text rather than leaving
//! callers with just a `Display` string; `EngineError` follows the same
//! shape here.
use crate::engine::EngineId;

/// Errors surfaced by [`crate::engine::EngineRegistry`] and the reference
/// [`crate::engine::ThreadEngine`] driver.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EngineError {
    /// `target`/`signal`/`multiplex` resolved to an [`EngineId`] that is no
    /// longer registered (the engine already shut down).
    #[error("engine {0:?} is not registered")]
    #[diagnostic(
        code(statetask::engine::unknown_engine),
        help("The engine may have shut down. Re-resolve the task's target/default engine or register a new one before retrying.")
    )]
    UnknownEngine(EngineId),

    /// `EngineRegistry` was asked to resolve the `gAuxiliaryThreadEngine`
    /// fallback (§4.2 step 8) before one was configured.
    #[error("no auxiliary engine has been configured via `set_auxiliary_engine`")]
    #[diagnostic(
        code(statetask::engine::auxiliary_not_configured),
        help("Call `EngineRegistry::set_auxiliary_engine` once at startup before running any task that has no target/current/default engine of its own.")
    )]
    AuxiliaryEngineNotConfigured,

    /// `EngineRegistry` was asked to resolve the `gMainThreadEngine` target
    /// of `yield_frame`/`yield_ms` (§4.4) before one was configured.
    #[error("no main-thread engine has been configured via `set_main_thread_engine`")]
    #[diagnostic(
        code(statetask::engine::main_thread_not_configured),
        help("Call `EngineRegistry::set_main_thread_engine` once at startup before any task calls `yield_frame`/`yield_ms`.")
    )]
    MainThreadEngineNotConfigured,

    /// An `EngineRegistry` lock (`engines`, `auxiliary`, or `main_thread`)
    /// was poisoned by a prior panic while held.
    #[error("EngineRegistry internal lock poisoned ({which})")]
    #[diagnostic(
        code(statetask::engine::registry_poisoned),
        help("A prior thread panicked while holding the registry's `{which}` lock. The registry is process-wide; consider restarting the process.")
    )]
    RegistryPoisoned { which: &'static str },

    /// A lock internal to one [`ThreadEngine`](crate::engine::ThreadEngine)
    /// instance (its own task queue) was poisoned by a prior panic while
    /// held. That engine's internal records may be torn; the caller should
    /// treat it as dead and stop driving it.
    #[error("a lock internal to engine {0:?} was poisoned by a prior panic")]
    #[diagnostic(
        code(statetask::engine::lock_poisoned),
        help("A prior thread panicked while holding this engine's own queue lock. Treat this engine as dead: shut it down and spawn a replacement.")
    )]
    LockPoisoned(EngineId),

    /// `std::thread::Builder::spawn` failed to start an engine's driver
    /// thread (e.g. the OS thread-count limit was hit).
    #[error("failed to spawn engine driver thread: {0}")]
    #[diagnostic(
        code(statetask::engine::thread_spawn),
        help("Check the OS thread-count limit (e.g. `ulimit -u` on Linux) before spawning another engine.")
    )]
    ThreadSpawn(#[source] std::io::Error),
}

//! Stop-the-world tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for suspension rounds, marking and fork handling.
//! Without the feature every helper compiles to nothing, except
//! [`warn`], which always reaches stderr.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::time::Duration;

    use tracing::{span, Level};

    /// Span held by a stopped world.
    pub type RoundSpan = span::EnteredSpan;

    /// Create a span covering one stop-the-world round.
    pub fn trace_stop_world(round: u64, threads: usize) -> RoundSpan {
        span!(Level::DEBUG, "stop_world", round, threads).entered()
    }

    /// Log a finished marking generation.
    pub fn log_mark_generation(generation: u64, markers: usize) {
        tracing::debug!(generation, markers, "mark_generation");
    }

    /// Log the outcome of a suspension pass.
    pub fn log_threads_stopped(suspended: usize, blocked: usize, compensated: usize) {
        tracing::debug!(suspended, blocked, compensated, "threads_stopped");
    }

    /// Log that a signal had to be sent again.
    pub fn log_signal_resent(pending: usize) {
        tracing::trace!(pending, "suspend_resent");
    }

    /// Log a restart/re-suspend pass for threads caught in a critical region.
    pub fn log_critical_retry(attempt: usize, threads: usize) {
        tracing::debug!(attempt, threads, "critical_region_retry");
    }

    /// Log the end of a stop-the-world round.
    #[allow(clippy::cast_possible_truncation)]
    pub fn log_world_restarted(round: u64, pause: Duration) {
        tracing::debug!(round, pause_us = pause.as_micros() as u64, "world_restarted");
    }

    /// Log marker helper start-up.
    pub fn log_marker_started(helpers: usize) {
        tracing::debug!(helpers, "markers_started");
    }

    /// Log a fork hook.
    pub fn log_fork(phase: &'static str) {
        tracing::debug!(phase, "fork_hook");
    }

    /// Log a thread entering the registry.
    pub fn log_thread_registered(id: u64, main: bool) {
        tracing::trace!(id, main, "thread_registered");
    }

    /// Log a thread leaving the registry.
    pub fn log_thread_exit(id: u64, detached: bool) {
        tracing::trace!(id, detached, "thread_exit");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    use std::time::Duration;

    /// Stub span when tracing is disabled.
    pub type RoundSpan = ();

    /// Stub function when tracing is disabled.
    pub const fn trace_stop_world(_round: u64, _threads: usize) -> RoundSpan {}

    /// Stub function when tracing is disabled.
    pub const fn log_mark_generation(_generation: u64, _markers: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_threads_stopped(_suspended: usize, _blocked: usize, _compensated: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_signal_resent(_pending: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_critical_retry(_attempt: usize, _threads: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_world_restarted(_round: u64, _pause: Duration) {}

    /// Stub function when tracing is disabled.
    pub const fn log_marker_started(_helpers: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_fork(_phase: &'static str) {}

    /// Stub function when tracing is disabled.
    pub const fn log_thread_registered(_id: u64, _main: bool) {}

    /// Stub function when tracing is disabled.
    pub const fn log_thread_exit(_id: u64, _detached: bool) {}
}

/// Emit a warning the user must see even without a subscriber.
pub fn warn(message: std::fmt::Arguments<'_>) {
    #[cfg(feature = "tracing")]
    tracing::warn!("{message}");
    #[cfg(not(feature = "tracing"))]
    eprintln!("rudo-stw: warning: {message}");
}

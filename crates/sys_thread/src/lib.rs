//! Low-level thread primitives used by the stop-the-world machinery.
//!
//! Everything here is a thin, allocation-free wrapper over the operating
//! system: native thread identity, current-thread stack bounds, processor
//! count and, on unix, the signal and `pthread_atfork` plumbing the signal
//! suspend backend is built from.

use std::fmt;
use std::num::NonZeroUsize;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

#[cfg(unix)]
pub use unix::{
    block_signals, current_signal_mask, default_restart_signal, default_suspend_signal, errno,
    first_realtime_signal, is_reserved_signal, max_signal, register_atfork, send_signal,
    set_errno, set_signal_mask, wait_for_signal, DeliveryError, SignalHandler, SignalSet,
};

#[cfg(unix)]
pub use unix::install_handler;

/// Identity of an OS thread as seen by the thread library.
///
/// On unix this is the `pthread_t` of the thread, on Windows the thread id.
/// Identities are only unique among *live* threads: the thread library is
/// free to hand the same value to a new thread once the old one was joined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeThreadId(u64);

impl NativeThreadId {
    /// Wrap a raw identity value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identity value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NativeThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeThreadId({:#x})", self.0)
    }
}

impl fmt::Display for NativeThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of the calling thread.
#[must_use]
pub fn current_thread_id() -> NativeThreadId {
    NativeThreadId(os::current_thread_id())
}

/// Address range occupied by a thread stack.
///
/// `start` is the lowest usable address and `end` the highest; stacks grow
/// from `end` towards `start` on every supported target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest address of the stack mapping.
    pub start: usize,
    /// Highest address of the stack mapping (the cold end).
    pub end: usize,
}

impl StackBounds {
    /// Returns `true` if `addr` lies within `[start, end]`.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// Size of the range in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` for an empty range.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stack bounds of the calling thread, if the platform can report them.
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    os::current_stack_bounds()
}

/// An address close to the current stack pointer.
///
/// Inlined so the local lives in the caller's frame.
#[inline(always)]
#[must_use]
pub fn approx_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(std::ptr::addr_of!(marker)) as usize
}

/// Number of processors available to this process (at least 1).
#[must_use]
pub fn processor_count() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

//! Atomic cells shared between mutators, the initiator and signal handlers.
//!
//! Everything in this module is lock-free and async-signal-safe. Under
//! `--cfg loom` the two cells are built on loom's atomics so the suspend
//! handshake can be model checked; the word helpers always use std.

#[cfg(loom)]
use loom::sync::atomic::AtomicU8;
#[cfg(not(loom))]
use std::sync::atomic::AtomicU8;

use std::fmt;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Per-thread position in the stop-the-world handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuspendState {
    /// The thread runs freely.
    Running = 0,
    /// The initiator asked the thread to stop.
    SuspendRequested = 1,
    /// The thread captured its context and is parked.
    Suspended = 2,
    /// The initiator asked the parked thread to continue.
    ResumeRequested = 3,
}

impl SuspendState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::SuspendRequested,
            2 => Self::Suspended,
            3 => Self::ResumeRequested,
            _ => Self::Running,
        }
    }
}

/// An atomic [`SuspendState`].
///
/// Every change goes through [`SuspendCell::transition`], so two parties
/// racing on the same record can never both believe they moved it.
pub struct SuspendCell {
    state: AtomicU8,
}

impl SuspendCell {
    /// A cell in [`SuspendState::Running`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SuspendState::Running as u8),
        }
    }

    /// Current state (acquire).
    #[must_use]
    pub fn load(&self) -> SuspendState {
        SuspendState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current state (sequentially consistent), for a load that must not be
    /// reordered before a preceding `SeqCst` store to another flag.
    #[must_use]
    pub fn load_seqcst(&self) -> SuspendState {
        SuspendState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`, returning `false` if the state was not `from`.
    ///
    /// Sequentially consistent on success so it also orders against the
    /// thread's `blocked` flag.
    pub fn transition(&self, from: SuspendState, to: SuspendState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally publish `to` (release).
    pub fn store_release(&self, to: SuspendState) {
        self.state.store(to as u8, Ordering::Release);
    }
}

impl Default for SuspendCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SuspendCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SuspendCell").field(&self.load()).finish()
    }
}

/// Bitset of per-thread flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadFlags(u8);

impl ThreadFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The record is reaped as soon as the thread exits.
    pub const DETACHED: Self = Self(1 << 0);
    /// The record came from the registry's bootstrap slot.
    pub const MAIN_THREAD: Self = Self(1 << 1);
    /// The thread ran to completion but was not joined yet.
    pub const FINISHED: Self = Self(1 << 2);
    /// Collections must not start while set.
    pub const DISABLED_GC: Self = Self(1 << 3);
    /// The thread is unregistering itself.
    pub const EXITING: Self = Self(1 << 4);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for ThreadFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ThreadFlags, &str); 5] = [
            (ThreadFlags::DETACHED, "DETACHED"),
            (ThreadFlags::MAIN_THREAD, "MAIN_THREAD"),
            (ThreadFlags::FINISHED, "FINISHED"),
            (ThreadFlags::DISABLED_GC, "DISABLED_GC"),
            (ThreadFlags::EXITING, "EXITING"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// An atomic [`ThreadFlags`].
pub struct FlagCell {
    bits: AtomicU8,
}

impl FlagCell {
    /// A cell holding `initial`.
    #[must_use]
    pub fn new(initial: ThreadFlags) -> Self {
        Self {
            bits: AtomicU8::new(initial.0),
        }
    }

    /// Snapshot of all flags.
    #[must_use]
    pub fn get(&self) -> ThreadFlags {
        ThreadFlags(self.bits.load(Ordering::Acquire))
    }

    /// Returns `true` if every flag in `flags` is set.
    #[must_use]
    pub fn contains(&self, flags: ThreadFlags) -> bool {
        self.get().contains(flags)
    }

    /// Set `flags`.
    pub fn set(&self, flags: ThreadFlags) {
        self.bits.fetch_or(flags.0, Ordering::AcqRel);
    }

    /// Clear `flags`.
    pub fn clear(&self, flags: ThreadFlags) {
        self.bits.fetch_and(!flags.0, Ordering::AcqRel);
    }
}

impl fmt::Debug for FlagCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}

/// Load with acquire ordering.
#[inline]
pub fn load_acquire(word: &AtomicUsize) -> usize {
    word.load(Ordering::Acquire)
}

/// Store with release ordering.
#[inline]
pub fn store_release(word: &AtomicUsize, value: usize) {
    word.store(value, Ordering::Release);
}

/// Compare-and-swap `old` for `new`, returning whether it succeeded.
#[inline]
pub fn compare_and_swap(word: &AtomicUsize, old: usize, new: usize) -> bool {
    word.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Full memory barrier.
#[inline]
pub fn full_fence() {
    fence(Ordering::SeqCst);
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_from_expected_state() {
        let cell = SuspendCell::new();
        assert_eq!(cell.load(), SuspendState::Running);
        assert!(!cell.transition(SuspendState::Suspended, SuspendState::ResumeRequested));
        assert!(cell.transition(SuspendState::Running, SuspendState::SuspendRequested));
        assert!(!cell.transition(SuspendState::Running, SuspendState::SuspendRequested));
        assert_eq!(cell.load(), SuspendState::SuspendRequested);
        assert_eq!(cell.load_seqcst(), SuspendState::SuspendRequested);
        cell.store_release(SuspendState::Running);
        assert_eq!(cell.load(), SuspendState::Running);
    }

    #[test]
    fn flag_cell_set_and_clear() {
        let flags = FlagCell::new(ThreadFlags::MAIN_THREAD);
        assert!(flags.contains(ThreadFlags::MAIN_THREAD));
        flags.set(ThreadFlags::DETACHED.union(ThreadFlags::EXITING));
        assert!(flags.contains(ThreadFlags::DETACHED));
        assert!(flags.contains(ThreadFlags::EXITING));
        flags.clear(ThreadFlags::EXITING);
        assert!(!flags.contains(ThreadFlags::EXITING));
        assert!(flags.contains(ThreadFlags::MAIN_THREAD.union(ThreadFlags::DETACHED)));
    }

    #[test]
    fn flags_debug_lists_names() {
        let flags = ThreadFlags::FINISHED.union(ThreadFlags::DISABLED_GC);
        assert_eq!(format!("{flags:?}"), "{FINISHED, DISABLED_GC}");
    }

    #[test]
    fn word_helpers() {
        let word = AtomicUsize::new(0);
        store_release(&word, 7);
        assert_eq!(load_acquire(&word), 7);
        assert!(!compare_and_swap(&word, 0, 9));
        assert!(compare_and_swap(&word, 7, 9));
        full_fence();
        assert_eq!(load_acquire(&word), 9);
    }
}

//! # Lock Ordering Discipline
//!
//! The collector takes at most three kinds of locks, always in this order:
//!
//! | Level | Lock Type    | Description                                   |
//! |-------|--------------|-----------------------------------------------|
//! | 1     | `Allocation` | Heap metadata and the thread registry          |
//! | 2     | `MarkLock`   | Mark generation and builder count              |
//! | 3     | `Parker`     | Per-thread park/unpark handshake               |
//!
//! Taking a lock of a lower level while holding a higher one is a bug. In
//! debug builds every acquisition goes through a [`LockGuard`] that checks
//! this against a per-thread stack of held levels and panics with
//! "Lock ordering violation". Release builds compile the checks away.
//!
//! Signal handlers never take any of these locks, so the per-thread stack
//! is never touched from a handler.
//!
//! # Examples
//!
//! ```
//! use rudo_stw::sync::{LockGuard, LockOrder};
//!
//! let _alloc = LockGuard::new(LockOrder::Allocation);
//! let _mark = LockGuard::new(LockOrder::MarkLock);
//! ```

use std::cell::RefCell;

const MAX_LOCK_DEPTH: usize = 16;

thread_local!(static LOCK_ORDER_STACK: RefCell<Vec<u8>> =
    RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// The allocation lock (level 1).
    Allocation = 1,
    /// The mark coordinator lock (level 2).
    MarkLock = 2,
    /// A thread record's parker (level 3).
    Parker = 3,
}

impl LockOrder {
    /// Level of this lock in the acquisition hierarchy.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    const fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Allocation),
            2 => Some(Self::MarkLock),
            3 => Some(Self::Parker),
            _ => None,
        }
    }
}

/// RAII marker for a held lock.
///
/// Create it right after acquiring the lock it describes and drop it right
/// after releasing that lock.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Record that a lock of kind `tag` is now held.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of a higher level is already held.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            if let Some(held) = highest_held() {
                validate_lock_order(tag, held);
            }
            push_level(tag);
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|&level| level == self._tag.level()) {
                stack.remove(pos);
            }
        });
    }
}

/// Check that `tag` may be acquired while `held` is the highest held lock.
///
/// # Panics
///
/// Panics in debug builds on a downgrade.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, held: LockOrder) {
    assert!(
        tag.level() >= held.level(),
        "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding {held:?} (level {})",
        tag.level(),
        held.level(),
    );
}

/// Check that `tag` may be acquired while `held` is the highest held lock.
#[inline]
#[cfg(not(debug_assertions))]
pub const fn validate_lock_order(_tag: LockOrder, _held: LockOrder) {
    // No-op in release builds
}

#[cfg(debug_assertions)]
fn push_level(tag: LockOrder) {
    let _ = LOCK_ORDER_STACK.try_with(|stack| stack.borrow_mut().push(tag.level()));
}

/// Highest lock level held by the current thread, if any.
#[must_use]
pub fn highest_held() -> Option<LockOrder> {
    LOCK_ORDER_STACK
        .try_with(|stack| {
            stack
                .borrow()
                .iter()
                .copied()
                .max()
                .and_then(LockOrder::from_level)
        })
        .ok()
        .flatten()
}

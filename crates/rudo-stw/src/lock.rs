//! The allocation lock.
//!
//! A hybrid lock: a non-blocking attempt first, then a bounded exponential
//! spin, then a blocking wait. Spinning is skipped on a uniprocessor and
//! while the collector says a collection is running, because the holder is
//! then guaranteed to keep the lock for a long time.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::sync::{LockGuard, LockOrder};

/// Longest single spin pause, in spin-loop hints.
pub const SPIN_MAX: u32 = 128;

/// How acquisitions of an [`AllocationLock`] were satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Acquired on the first attempt.
    pub uncontended: u64,
    /// Acquired while spinning.
    pub after_spin: u64,
    /// Acquired after blocking.
    pub after_block: u64,
}

impl LockStats {
    /// Total number of acquisitions.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.uncontended + self.after_spin + self.after_block
    }
}

/// Lock protecting a `T`, normally the thread registry.
pub struct AllocationLock<T> {
    inner: Mutex<T>,
    collecting: AtomicBool,
    uniprocessor: bool,
    uncontended: AtomicU64,
    after_spin: AtomicU64,
    after_block: AtomicU64,
}

impl<T> AllocationLock<T> {
    /// Wrap `value`. `processors` decides whether spinning is worthwhile.
    pub fn new(value: T, processors: usize) -> Self {
        Self {
            inner: Mutex::new(value),
            collecting: AtomicBool::new(false),
            uniprocessor: processors <= 1,
            uncontended: AtomicU64::new(0),
            after_spin: AtomicU64::new(0),
            after_block: AtomicU64::new(0),
        }
    }

    /// Acquire the lock.
    pub fn lock(&self) -> AllocGuard<'_, T> {
        let guard = self.acquire();
        AllocGuard {
            guard,
            _order: LockGuard::new(LockOrder::Allocation),
        }
    }

    /// Acquire the lock only if it is free.
    pub fn try_lock(&self) -> Option<AllocGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        self.uncontended.fetch_add(1, Ordering::Relaxed);
        Some(AllocGuard {
            guard,
            _order: LockGuard::new(LockOrder::Allocation),
        })
    }

    fn acquire(&self) -> MutexGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            self.uncontended.fetch_add(1, Ordering::Relaxed);
            return guard;
        }

        if !self.uniprocessor && !self.collecting.load(Ordering::Relaxed) {
            let mut pause = 1;
            while pause <= SPIN_MAX {
                for _ in 0..pause {
                    std::hint::spin_loop();
                }
                if let Some(guard) = self.inner.try_lock() {
                    self.after_spin.fetch_add(1, Ordering::Relaxed);
                    return guard;
                }
                if self.collecting.load(Ordering::Relaxed) {
                    break;
                }
                pause *= 2;
            }
        }

        let guard = self.inner.lock();
        self.after_block.fetch_add(1, Ordering::Relaxed);
        guard
    }

    /// Acquire without producing a guard; paired with [`Self::unlock_raw`].
    ///
    /// Used by the fork hooks, which hold the lock across callbacks.
    pub fn lock_raw(&self) {
        std::mem::forget(self.acquire());
    }

    /// Release a lock taken with [`Self::lock_raw`].
    ///
    /// # Safety
    ///
    /// The lock must be held through [`Self::lock_raw`] and no guard may be
    /// outstanding.
    pub unsafe fn unlock_raw(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.inner.force_unlock() };
    }

    /// Access the protected value while the lock is held raw.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock through [`Self::lock_raw`] and must not
    /// create overlapping references.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_unchecked(&self) -> &mut T {
        // SAFETY: exclusive access is guaranteed by the held lock.
        unsafe { &mut *self.inner.data_ptr() }
    }

    /// Returns `true` if some thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Hint that a collection is running, so waiters should block at once.
    pub fn set_collecting(&self, collecting: bool) {
        self.collecting.store(collecting, Ordering::Relaxed);
    }

    /// Returns `true` while the collecting hint is set.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Relaxed)
    }

    /// Acquisition statistics.
    #[must_use]
    pub fn stats(&self) -> LockStats {
        LockStats {
            uncontended: self.uncontended.load(Ordering::Relaxed),
            after_spin: self.after_spin.load(Ordering::Relaxed),
            after_block: self.after_block.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for AllocationLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationLock")
            .field("locked", &self.is_locked())
            .field("collecting", &self.is_collecting())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`AllocationLock::lock`].
pub struct AllocGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _order: LockGuard,
}

impl<T> Deref for AllocGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for AllocGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_acquisitions_are_counted() {
        let lock = AllocationLock::new(0u32, 4);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
        assert_eq!(lock.stats().uncontended, 2);
        assert_eq!(lock.stats().total(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = AllocationLock::new((), 4);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn raw_lock_round_trip() {
        let lock = AllocationLock::new(vec![1, 2, 3], 4);
        lock.lock_raw();
        assert!(lock.is_locked());
        // SAFETY: held raw above, no guards exist.
        unsafe {
            lock.data_unchecked().push(4);
            lock.unlock_raw();
        }
        assert_eq!(lock.lock().len(), 4);
    }

    #[test]
    fn contended_counter_stays_consistent() {
        let lock = Arc::new(AllocationLock::new(0u64, 4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
        assert_eq!(lock.stats().total(), 4001);
    }

    #[test]
    fn uniprocessor_skips_spinning() {
        let lock = Arc::new(AllocationLock::new((), 1));
        let guard = lock.lock();
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || drop(lock.lock()))
        };
        thread::sleep(std::time::Duration::from_millis(10));
        drop(guard);
        waiter.join().unwrap();
        assert_eq!(lock.stats().after_spin, 0);
    }
}

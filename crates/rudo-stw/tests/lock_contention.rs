//! Tests for the allocation lock and lock ordering.

use std::sync::{Arc, Barrier};
use std::thread;

use rudo_stw::AllocationLock;
#[cfg(debug_assertions)]
use rudo_stw::sync::{highest_held, LockGuard, LockOrder};

#[test]
fn test_contended_counter_is_exact() {
    const THREADS: usize = 8;
    const ITERS: u64 = 2_000;

    let lock = Arc::new(AllocationLock::new(0u64, 4));
    let start = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..ITERS {
                    *lock.lock() += 1;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*lock.lock(), THREADS as u64 * ITERS);
    let stats = lock.stats();
    assert_eq!(stats.total(), THREADS as u64 * ITERS + 1);
}

#[test]
fn test_uniprocessor_never_spins() {
    let lock = Arc::new(AllocationLock::new(Vec::new(), 1));
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for i in 0..500 {
                    lock.lock().push(n * 1000 + i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(lock.lock().len(), 2000);
    assert_eq!(lock.stats().after_spin, 0);
}

#[test]
fn test_collecting_hint_is_visible() {
    let lock = AllocationLock::new((), 4);
    assert!(!lock.is_collecting());
    lock.set_collecting(true);
    assert!(lock.is_collecting());
    let guard = lock.lock();
    assert!(lock.is_locked());
    assert!(lock.try_lock().is_none());
    drop(guard);
    lock.set_collecting(false);
    assert!(!lock.is_locked());
}

#[cfg(debug_assertions)]
#[test]
fn test_guard_tracks_allocation_level() {
    let lock = AllocationLock::new((), 4);
    assert_eq!(highest_held(), None);
    let guard = lock.lock();
    assert_eq!(highest_held(), Some(LockOrder::Allocation));
    drop(guard);
    assert_eq!(highest_held(), None);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "Lock ordering violation")]
fn test_allocation_after_mark_lock_panics() {
    let lock = AllocationLock::new((), 4);
    let _mark = LockGuard::new(LockOrder::MarkLock);
    let _alloc = lock.lock();
}

#[cfg(debug_assertions)]
#[test]
fn test_ascending_order_is_allowed() {
    let lock = AllocationLock::new((), 4);
    let _alloc = lock.lock();
    let _mark = LockGuard::new(LockOrder::MarkLock);
    let _parker = LockGuard::new(LockOrder::Parker);
    assert_eq!(highest_held(), Some(LockOrder::Parker));
}

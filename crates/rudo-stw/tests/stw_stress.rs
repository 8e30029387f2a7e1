//! Stress tests for repeated stop-the-world rounds.
//!
//! Several mutators build and check small linked lists while another
//! thread stops and restarts the world over and over. Every round must see
//! every mutator exactly once, and no mutator may observe a torn list.
//! A second pair of tests stops mutators that allocate inside critical
//! regions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rudo_stw::{
    CollectorConfig, CollectorState, NoHooks, StopOutcome, SuspendKind, ThreadRoots, Tracer,
};

const MUTATORS: usize = 8;
const ROUNDS: usize = 100;
const LIST_LEN: u64 = 50;

struct Node {
    value: u64,
    next: Option<Box<Node>>,
}

fn build_list(len: u64) -> Option<Box<Node>> {
    let mut head = None;
    for value in (1..=len).rev() {
        head = Some(Box::new(Node { value, next: head }));
    }
    head
}

fn sum(mut node: Option<&Node>) -> u64 {
    let mut total = 0;
    while let Some(n) = node {
        total += n.value;
        node = n.next.as_deref();
    }
    total
}

#[derive(Default)]
struct CheckRoots {
    seen: AtomicUsize,
    bad: AtomicUsize,
}

impl Tracer for CheckRoots {
    fn mark_roots(&self, roots: &ThreadRoots) {
        self.seen.fetch_add(1, Ordering::Relaxed);
        if roots.stack_start == 0 || roots.stack_start > roots.stack_end {
            self.bad.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn run_stress(kind: SuspendKind) {
    let tracer = Arc::new(CheckRoots::default());
    let config = CollectorConfig::default()
        .with_suspend_kind(kind)
        .with_markers(1);
    let collector = CollectorState::new(config, tracer.clone(), Arc::new(NoHooks)).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(MUTATORS + 1));
    let lists_checked = Arc::new(AtomicUsize::new(0));

    let mutators: Vec<_> = (0..MUTATORS)
        .map(|index| {
            let collector = Arc::clone(&collector);
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            let lists_checked = Arc::clone(&lists_checked);
            thread::spawn(move || {
                let mutator = collector.register_current_thread().unwrap();
                ready.wait();
                let mut iteration = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let list = mutator.critical_region(|| build_list(LIST_LEN));
                    mutator.safepoint();
                    assert_eq!(sum(list.as_deref()), LIST_LEN * (LIST_LEN + 1) / 2);
                    mutator.critical_region(|| drop(list));
                    lists_checked.fetch_add(1, Ordering::Relaxed);

                    if index == 0 && iteration % 16 == 0 {
                        mutator.do_blocking(|| thread::sleep(Duration::from_micros(200)));
                    }
                    iteration += 1;
                    mutator.safepoint();
                }
            })
        })
        .collect();

    ready.wait();
    let initiator = {
        let collector = Arc::clone(&collector);
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                let world = collector.stop_world();
                assert_eq!(world.threads().len(), MUTATORS);
                assert_eq!(world.count(StopOutcome::Compensated), 0);
                for roots in world.roots() {
                    assert_ne!(roots.stack_start, 0);
                    assert!(roots.stack_start <= roots.stack_end);
                }
                let metrics = world.resume();
                assert_eq!(metrics.threads_with_roots(), MUTATORS);
            }
        })
    };
    initiator.join().unwrap();

    for _ in 0..5 {
        collector.collect().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for mutator in mutators {
        mutator.join().unwrap();
    }

    assert_eq!(collector.stw_rounds(), (ROUNDS + 5) as u64);
    assert_eq!(tracer.seen.load(Ordering::Relaxed), 5 * MUTATORS);
    assert_eq!(tracer.bad.load(Ordering::Relaxed), 0);
    assert!(lists_checked.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_cooperative_stress() {
    run_stress(SuspendKind::Cooperative);
}

#[cfg(unix)]
#[test]
fn test_signal_stress() {
    run_stress(SuspendKind::Signals);
}

/// Mutators allocating inside critical regions are stopped mid-allocation,
/// let out, and stopped again while the others stay suspended.
fn run_critical_allocation(kind: SuspendKind) {
    const THREADS: usize = 4;
    const STOPS: usize = 200;

    let config = CollectorConfig::default()
        .with_suspend_kind(kind)
        .with_markers(1);
    let collector =
        CollectorState::new(config, Arc::new(CheckRoots::default()), Arc::new(NoHooks)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(THREADS + 1));

    let mutators: Vec<_> = (0..THREADS)
        .map(|_| {
            let collector = Arc::clone(&collector);
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let mutator = collector.register_current_thread().unwrap();
                ready.wait();
                while !stop.load(Ordering::Relaxed) {
                    let boxes =
                        mutator.critical_region(|| (0..64).map(Box::new).collect::<Vec<_>>());
                    assert_eq!(boxes.iter().map(|b| **b).sum::<u64>(), 63 * 64 / 2);
                    mutator.critical_region(|| drop(boxes));
                    mutator.safepoint();
                }
            })
        })
        .collect();

    ready.wait();
    for _ in 0..STOPS {
        let world = collector.stop_world();
        assert_eq!(world.threads().len(), THREADS);
        assert_eq!(world.count(StopOutcome::Compensated), 0);
        assert_eq!(world.resume().threads_with_roots(), THREADS);
    }
    stop.store(true, Ordering::Relaxed);
    for mutator in mutators {
        mutator.join().unwrap();
    }
    assert_eq!(collector.stw_rounds(), STOPS as u64);
}

#[test]
fn test_cooperative_critical_allocation() {
    run_critical_allocation(SuspendKind::Cooperative);
}

#[cfg(unix)]
#[test]
fn test_signal_critical_allocation() {
    run_critical_allocation(SuspendKind::Signals);
}

//! Parallel marking coordinator.
//!
//! Helper threads are started on first use and sleep on `mark_cv` until the
//! collector publishes a new mark generation with help wanted. Each helper
//! then runs one unit of the tracer's work for that generation. The same
//! lock guards the builder count, which [`MarkCoordinator::wait_for_reclaim`]
//! waits on through `builder_cv`.
//!
//! With a single marker (or a single processor) no helper is spawned and
//! the initiator does all marking itself.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(debug_assertions)]
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::atomic::compare_and_swap;
use crate::collector::Tracer;
use crate::error::fatal;
use crate::sync::{LockGuard, LockOrder};
use crate::tracing::internal::log_marker_started;
use crate::tracing::warn;

/// Stack size of a marker helper thread.
pub const MARKER_STACK_SIZE: usize = 1 << 20;

/// Identity of a marker within one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkerId(pub usize);

impl MarkerId {
    /// The thread driving the collection.
    pub const INITIATOR: Self = Self(0);

    /// Returns `true` for a helper thread.
    #[must_use]
    pub const fn is_helper(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "marker-{}", self.0)
    }
}

/// What one mark generation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarkRound {
    pub(crate) generation: u64,
    /// Markers that took part, the initiator included.
    pub(crate) markers: usize,
    pub(crate) parallel: bool,
}

#[derive(Debug)]
struct MarkState {
    generation: u64,
    /// Builders in flight. Goes negative while helpers start up.
    builders: isize,
    help_wanted: bool,
    /// Helpers currently running a unit.
    busy: usize,
    /// Helpers that joined the current generation.
    joined: usize,
    shutdown: bool,
    helpers: Vec<JoinHandle<()>>,
}

struct MarkShared {
    state: Mutex<MarkState>,
    builder_cv: Condvar,
    mark_cv: Condvar,
    #[cfg(debug_assertions)]
    holder: AtomicU64,
}

impl MarkShared {
    fn lock(&self) -> MarkGuard<'_> {
        self.check_not_held();
        let guard = self.state.lock();
        let order = LockGuard::new(LockOrder::MarkLock);
        self.claim();
        MarkGuard {
            guard,
            shared: self,
            _order: order,
        }
    }

    #[cfg(debug_assertions)]
    fn check_not_held(&self) {
        let me = holder_token();
        assert!(
            me == 0 || self.holder.load(Ordering::Relaxed) != me,
            "mark lock acquired recursively"
        );
    }

    #[cfg(debug_assertions)]
    fn claim(&self) {
        self.holder.store(holder_token(), Ordering::Relaxed);
    }

    #[cfg(debug_assertions)]
    fn release(&self) {
        self.holder.store(0, Ordering::Relaxed);
    }

    #[cfg(not(debug_assertions))]
    #[allow(clippy::unused_self)]
    const fn check_not_held(&self) {}

    #[cfg(not(debug_assertions))]
    #[allow(clippy::unused_self)]
    const fn claim(&self) {}

    #[cfg(not(debug_assertions))]
    #[allow(clippy::unused_self)]
    const fn release(&self) {}
}

/// Token identifying the calling thread to the debug holder check.
///
/// Unlike native thread ids these are never handed out twice, so a thread
/// cannot inherit the identity of one that exited holding the lock. Zero
/// once thread-locals are torn down; the check is skipped then.
#[cfg(debug_assertions)]
fn holder_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.try_with(|token| *token).unwrap_or(0)
}

/// Held mark lock.
struct MarkGuard<'a> {
    guard: MutexGuard<'a, MarkState>,
    shared: &'a MarkShared,
    _order: LockGuard,
}

impl MarkGuard<'_> {
    fn wait(&mut self, cv: &Condvar) {
        self.shared.release();
        cv.wait(&mut self.guard);
        self.shared.claim();
    }

    fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.shared.release();
        let result = MutexGuard::unlocked(&mut self.guard, f);
        self.shared.claim();
        result
    }
}

impl std::ops::Deref for MarkGuard<'_> {
    type Target = MarkState;

    fn deref(&self) -> &MarkState {
        &self.guard
    }
}

impl std::ops::DerefMut for MarkGuard<'_> {
    fn deref_mut(&mut self) -> &mut MarkState {
        &mut self.guard
    }
}

impl Drop for MarkGuard<'_> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Owner of the marker helpers and the mark lock.
pub(crate) struct MarkCoordinator {
    shared: Arc<MarkShared>,
    tracer: Arc<dyn Tracer>,
    wanted: usize,
    signals: Option<(i32, i32)>,
    started: AtomicUsize,
    parallel: AtomicBool,
}

impl MarkCoordinator {
    /// A coordinator that will start `helpers` helper threads on first use.
    ///
    /// `signals` are left unblocked in the helpers.
    pub(crate) fn new(
        helpers: usize,
        signals: Option<(i32, i32)>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            shared: Arc::new(MarkShared {
                state: Mutex::new(MarkState {
                    generation: 0,
                    builders: 0,
                    help_wanted: false,
                    busy: 0,
                    joined: 0,
                    shutdown: false,
                    helpers: Vec::new(),
                }),
                builder_cv: Condvar::new(),
                mark_cv: Condvar::new(),
                #[cfg(debug_assertions)]
                holder: AtomicU64::new(0),
            }),
            tracer,
            wanted: helpers,
            signals,
            started: AtomicUsize::new(0),
            parallel: AtomicBool::new(false),
        }
    }

    /// Returns `true` once helpers are running.
    pub(crate) fn is_parallel(&self) -> bool {
        self.parallel.load(Ordering::Acquire)
    }

    /// Number of running helper threads.
    pub(crate) fn helper_count(&self) -> usize {
        self.shared.lock().helpers.len()
    }

    /// Current mark generation.
    pub(crate) fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Spawn the helpers unless that was already attempted.
    pub(crate) fn start(&self) {
        if !compare_and_swap(&self.started, 0, 1) || self.wanted == 0 {
            return;
        }

        let Some(old_mask) = self.block_for_helpers() else {
            return;
        };
        let mut spawned = Vec::with_capacity(self.wanted);
        for n in 1..=self.wanted {
            let shared = Arc::clone(&self.shared);
            let tracer = Arc::clone(&self.tracer);
            let result = thread::Builder::new()
                .name(format!("rudo-marker-{n}"))
                .stack_size(MARKER_STACK_SIZE)
                .spawn(move || helper_loop(&shared, tracer.as_ref(), MarkerId(n)));
            match result {
                Ok(handle) => spawned.push(handle),
                Err(err) => {
                    warn(format_args!(
                        "marker thread {n} failed to start ({err}); continuing with {n} markers"
                    ));
                    break;
                }
            }
        }
        restore_mask(old_mask);

        let count = spawned.len();
        {
            let mut state = self.shared.lock();
            state.builders += isize::try_from(count).unwrap_or(isize::MAX);
            while state.builders > 0 {
                state.wait(&self.shared.builder_cv);
            }
            state.helpers = spawned;
        }
        if count > 0 {
            self.parallel.store(true, Ordering::Release);
            log_marker_started(count);
        }
    }

    /// Block every signal except suspend/restart so spawned helpers inherit
    /// that mask. Returns the mask to restore, `None` if helpers must not
    /// be started.
    #[cfg(unix)]
    fn block_for_helpers(&self) -> Option<sys_thread::SignalSet> {
        let mut set = sys_thread::SignalSet::full();
        if let Some((suspend, restart)) = self.signals {
            if let Err(err) = set.remove(suspend).and_then(|()| set.remove(restart)) {
                warn(format_args!(
                    "cannot build marker signal mask ({err}); parallel marking disabled"
                ));
                return None;
            }
        }
        match sys_thread::block_signals(&set) {
            Ok(old) => Some(old),
            Err(err) => {
                warn(format_args!(
                    "pthread_sigmask failed ({err}); parallel marking disabled"
                ));
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn block_for_helpers(&self) -> Option<()> {
        let _ = self.signals;
        Some(())
    }

    /// Run one mark generation.
    pub(crate) fn mark(&self) -> MarkRound {
        if !self.is_parallel() {
            let generation = {
                let mut state = self.shared.lock();
                state.generation += 1;
                state.generation
            };
            self.tracer.mark_unit(MarkerId::INITIATOR, generation);
            return MarkRound {
                generation,
                markers: 1,
                parallel: false,
            };
        }

        let generation = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.joined = 0;
            state.help_wanted = true;
            self.shared.mark_cv.notify_all();
            state.generation
        };

        self.tracer.mark_unit(MarkerId::INITIATOR, generation);

        let mut state = self.shared.lock();
        state.help_wanted = false;
        while state.busy > 0 {
            state.wait(&self.shared.mark_cv);
        }
        MarkRound {
            generation,
            markers: state.joined + 1,
            parallel: true,
        }
    }

    /// Wait until no builder is in flight.
    pub(crate) fn wait_for_reclaim(&self) {
        let mut state = self.shared.lock();
        while state.builders > 0 {
            state.wait(&self.shared.builder_cv);
        }
    }

    /// Record that a free-list builder started.
    pub(crate) fn begin_build(&self) {
        self.shared.lock().builders += 1;
    }

    /// Record that a free-list builder finished.
    pub(crate) fn end_build(&self) {
        let mut state = self.shared.lock();
        state.builders -= 1;
        if state.builders <= 0 {
            self.shared.builder_cv.notify_all();
        }
    }

    /// Builders in flight.
    pub(crate) fn builders(&self) -> isize {
        self.shared.lock().builders
    }

    /// Wait until no builder is in flight, then keep the mark lock without a
    /// guard; paired with [`Self::unlock_raw`].
    pub(crate) fn lock_raw_quiesced(&self) {
        self.shared.check_not_held();
        let mut state = self.shared.state.lock();
        while state.builders > 0 {
            self.shared.builder_cv.wait(&mut state);
        }
        mem::forget(state);
        self.shared.claim();
    }

    /// Take the mark lock without a guard; paired with [`Self::unlock_raw`].
    pub(crate) fn lock_raw(&self) {
        self.shared.check_not_held();
        mem::forget(self.shared.state.lock());
        self.shared.claim();
    }

    /// Release a lock taken with [`Self::lock_raw`].
    ///
    /// # Safety
    ///
    /// The mark lock must be held through [`Self::lock_raw`].
    pub(crate) unsafe fn unlock_raw(&self) {
        self.shared.release();
        // SAFETY: forwarded to the caller.
        unsafe { self.shared.state.force_unlock() };
    }

    /// Reset the coordinator in a fork child, where no helper survived and
    /// no other builder exists.
    ///
    /// # Safety
    ///
    /// The caller holds the mark lock through [`Self::lock_raw`] or
    /// [`Self::lock_raw_quiesced`].
    pub(crate) unsafe fn reset_after_fork(&self) {
        // SAFETY: the lock is held by the caller, who is the only accessor.
        let state = unsafe { &mut *self.shared.state.data_ptr() };
        mem::forget(mem::take(&mut state.helpers));
        state.builders = 0;
        state.busy = 0;
        state.joined = 0;
        state.help_wanted = false;
        self.parallel.store(false, Ordering::Release);
    }
}

impl Drop for MarkCoordinator {
    fn drop(&mut self) {
        let helpers = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.mark_cv.notify_all();
            mem::take(&mut state.helpers)
        };
        let current = thread::current().id();
        for handle in helpers {
            if handle.thread().id() != current && handle.join().is_err() {
                warn(format_args!("marker thread panicked"));
            }
        }
    }
}

impl fmt::Debug for MarkCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkCoordinator")
            .field("wanted", &self.wanted)
            .field("parallel", &self.is_parallel())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn restore_mask(old: sys_thread::SignalSet) {
    if sys_thread::set_signal_mask(&old).is_err() {
        fatal("pthread_sigmask failed while restoring the marker spawn mask");
    }
}

#[cfg(not(unix))]
const fn restore_mask((): ()) {}

fn helper_loop(shared: &MarkShared, tracer: &dyn Tracer, id: MarkerId) {
    let mut state = shared.lock();
    state.builders -= 1;
    if state.builders <= 0 {
        shared.builder_cv.notify_all();
    }

    let mut next = state.generation;
    loop {
        // Resynchronize after sleeping through rounds or on wraparound.
        if next < state.generation || next > state.generation.saturating_add(2) {
            next = state.generation;
        }
        while !state.shutdown
            && (state.generation < next || (state.generation == next && !state.help_wanted))
        {
            state.wait(&shared.mark_cv);
        }
        if state.shutdown {
            return;
        }
        if state.generation != next {
            // The round we waited for is over.
            continue;
        }

        let generation = next;
        state.busy += 1;
        state.joined += 1;
        state.unlocked(|| tracer.mark_unit(id, generation));
        state.busy -= 1;
        if state.busy == 0 {
            shared.mark_cv.notify_all();
        }
        next = generation + 1;
    }
}

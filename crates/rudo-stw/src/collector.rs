//! The collector facade and per-thread handles.
//!
//! A [`CollectorState`] owns the thread registry (inside the allocation
//! lock), the mark coordinator, the suspend backend and the configuration.
//! Several collectors may live in one process; a thread is registered with
//! at most one of them at a time.
//!
//! # Lock discipline for mutators
//!
//! A registered thread can be stopped anywhere it is not blocked. Whenever
//! it has to wait on a lock the initiator also needs (the allocation lock,
//! the mark lock, the statistics), it waits inside a blocking region so that
//! a stop never catches it holding one.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use sys_thread::NativeThreadId;

use crate::atomic::{SuspendState, ThreadFlags};
use crate::config::{CollectorConfig, SuspendKind};
use crate::context::ThreadRoots;
use crate::error::{fatal, StwError};
use crate::fork;
use crate::lock::{AllocGuard, AllocationLock, LockStats};
use crate::marker::{MarkCoordinator, MarkerId};
use crate::metrics::{RoundStats, StwMetrics};
use crate::registry::{ThreadRecord, ThreadRegistry};
use crate::suspend::{
    clear_current, current_for, enter_blocking, is_registered, leave_blocking, make_backend,
    set_current, suspend_self, SuspendBackend,
};
use crate::tracing::internal::{
    log_fork, log_mark_generation, log_thread_exit, log_thread_registered,
};
use crate::world::WorldStopped;

static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(1);

const FORK_HELD_ALLOC: u8 = 1;
const FORK_HELD_MARK: u8 = 2;

/// The marking side of a collector.
///
/// Called only while the world is stopped.
pub trait Tracer: Send + Sync {
    /// Mark everything reachable from one thread's stack and registers.
    fn mark_roots(&self, roots: &ThreadRoots);

    /// Do one unit of marking work for `generation`.
    ///
    /// Called once by the initiator and at most once by each helper per
    /// generation, concurrently.
    fn mark_unit(&self, marker: MarkerId, generation: u64) {
        let _ = (marker, generation);
    }
}

/// Notifications for the allocator, delivered under the allocation lock.
pub trait AllocatorHooks: Send + Sync {
    /// A collection is about to stop the world.
    fn on_gc_start(&self) {}

    /// Marking finished; the world is still stopped.
    fn on_gc_end(&self) {}
}

/// [`AllocatorHooks`] that ignore every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl AllocatorHooks for NoHooks {}

/// One collector instance.
pub struct CollectorState {
    id: u64,
    config: CollectorConfig,
    alloc: AllocationLock<ThreadRegistry>,
    marker: MarkCoordinator,
    backend: Box<dyn SuspendBackend>,
    poll: Arc<AtomicBool>,
    tracer: Arc<dyn Tracer>,
    hooks: Arc<dyn AllocatorHooks>,
    rounds_started: AtomicU64,
    stats: RoundStats,
    fork_held: AtomicU8,
}

impl CollectorState {
    /// Build a collector.
    ///
    /// Installs the suspend signal handlers when signals are used, and the
    /// fork handlers when `config.handle_fork` is set.
    ///
    /// # Errors
    ///
    /// Signal validation and installation errors, see [`StwError`].
    pub fn new(
        config: CollectorConfig,
        tracer: Arc<dyn Tracer>,
        hooks: Arc<dyn AllocatorHooks>,
    ) -> Result<Arc<Self>, StwError> {
        let id = NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed);
        let poll = Arc::new(AtomicBool::new(false));
        let backend = make_backend(&config, &poll)?;
        let marker = MarkCoordinator::new(
            config.helper_count(),
            backend.signals(),
            Arc::clone(&tracer),
        );
        let collector = Arc::new(Self {
            id,
            alloc: AllocationLock::new(
                ThreadRegistry::for_collector(id),
                config.processor_count(),
            ),
            config,
            marker,
            backend,
            poll,
            tracer,
            hooks,
            rounds_started: AtomicU64::new(0),
            stats: RoundStats::new(),
            fork_held: AtomicU8::new(0),
        });

        if collector.config.handle_fork {
            fork::install_fork_handlers()?;
            fork::track(&collector);
        }
        Ok(collector)
    }

    /// Build a collector from the environment with no allocator hooks.
    ///
    /// # Errors
    ///
    /// See [`CollectorConfig::from_env`] and [`Self::new`].
    pub fn from_env(tracer: Arc<dyn Tracer>) -> Result<Arc<Self>, StwError> {
        Self::new(CollectorConfig::from_env()?, tracer, Arc::new(NoHooks))
    }

    /// Register the calling thread as a mutator.
    ///
    /// # Errors
    ///
    /// [`StwError::AlreadyRegistered`] if the thread is registered with any
    /// collector, [`StwError::OutOfMemory`] if the registry cannot grow.
    pub fn register_current_thread(self: &Arc<Self>) -> Result<MutatorHandle, StwError> {
        let id = sys_thread::current_thread_id();
        if is_registered() {
            return Err(StwError::AlreadyRegistered(id));
        }
        let stack_end =
            sys_thread::current_stack_bounds().map_or_else(sys_thread::approx_sp, |b| b.end);

        let record = self.alloc.lock().register(id, stack_end)?;
        if !set_current(&record) {
            self.alloc.lock().remove_record(&record);
            return Err(StwError::AlreadyRegistered(id));
        }
        log_thread_registered(
            id.as_raw(),
            record.flags().contains(ThreadFlags::MAIN_THREAD),
        );
        Ok(MutatorHandle {
            collector: Arc::clone(self),
            record,
            _not_send: PhantomData,
        })
    }

    /// Stop every registered thread except the caller.
    ///
    /// The world restarts when the returned value is dropped.
    pub fn stop_world(&self) -> WorldStopped<'_> {
        let me = current_for(self.id);
        let registry = self.lock_alloc();
        WorldStopped::stop(self, registry, me.as_ref())
    }

    /// Run one full collection: stop the world, hand every thread's roots
    /// to the tracer, mark, and restart.
    ///
    /// # Errors
    ///
    /// [`StwError::GcDisabled`] if a live thread disabled collection.
    pub fn collect(&self) -> Result<StwMetrics, StwError> {
        self.as_blocked(|| self.marker.start());

        let me = current_for(self.id);
        let registry = self.lock_alloc();
        if registry
            .iter_live()
            .any(|record| record.flags.contains(ThreadFlags::DISABLED_GC))
        {
            return Err(StwError::GcDisabled);
        }
        self.alloc.set_collecting(true);
        self.hooks.on_gc_start();
        self.marker.wait_for_reclaim();

        let mut world = WorldStopped::stop(self, registry, me.as_ref());
        for thread in world.threads() {
            if let Some(roots) = thread.roots() {
                self.tracer.mark_roots(&roots);
            }
        }
        let round = self.marker.mark();
        world.set_markers(round.markers);
        self.hooks.on_gc_end();
        let metrics = world.resume();
        if round.parallel {
            log_mark_generation(round.generation, round.markers);
        }
        Ok(metrics)
    }

    /// Start the marker helpers now instead of at the first collection.
    pub fn start_markers(&self) {
        self.as_blocked(|| self.marker.start());
    }

    /// Mark a thread as detached: its record is reaped as soon as it exits,
    /// or now if it already has.
    ///
    /// # Errors
    ///
    /// [`StwError::NotRegistered`] if no record exists for `id`.
    pub fn detach(&self, id: NativeThreadId) -> Result<(), StwError> {
        let mut registry = self.lock_alloc();
        let record = registry
            .lookup(id)
            .cloned()
            .ok_or(StwError::NotRegistered(id))?;
        if record.is_live() {
            record.flags.set(ThreadFlags::DETACHED);
        } else {
            registry.remove_record(&record);
        }
        Ok(())
    }

    /// Reap the newest finished record of `id`.
    ///
    /// # Errors
    ///
    /// [`StwError::NotRegistered`] if `id` has no finished record.
    pub fn join(&self, id: NativeThreadId) -> Result<(), StwError> {
        let mut registry = self.lock_alloc();
        let record = registry
            .lookup_finished(id)
            .cloned()
            .ok_or(StwError::NotRegistered(id))?;
        registry.remove_record(&record);
        Ok(())
    }

    /// Record that the caller started building a free list.
    pub fn begin_build(&self) {
        self.as_blocked(|| self.marker.begin_build());
    }

    /// Record that the caller finished building a free list.
    pub fn end_build(&self) {
        self.as_blocked(|| self.marker.end_build());
    }

    /// Wait until no free-list builder is in flight.
    pub fn wait_for_reclaim(&self) {
        self.as_blocked(|| self.marker.wait_for_reclaim());
    }

    /// Returns `true` while marker helpers are running.
    #[must_use]
    pub fn is_parallel_marking_active(&self) -> bool {
        self.marker.is_parallel()
    }

    /// Number of running marker helpers.
    #[must_use]
    pub fn helper_count(&self) -> usize {
        self.as_blocked(|| self.marker.helper_count())
    }

    /// Last mark generation started.
    #[must_use]
    pub fn mark_generation(&self) -> u64 {
        self.as_blocked(|| self.marker.generation())
    }

    /// Number of completed stop-the-world rounds.
    #[must_use]
    pub fn stw_rounds(&self) -> u64 {
        self.stats.rounds()
    }

    /// Metrics of the last completed round.
    #[must_use]
    pub fn last_stw_metrics(&self) -> Option<StwMetrics> {
        self.as_blocked(|| self.stats.last())
    }

    /// Recent rounds, oldest first.
    #[must_use]
    pub fn recent_stw_metrics(&self) -> Vec<StwMetrics> {
        self.as_blocked(|| self.stats.recent())
    }

    /// Cumulative round statistics.
    ///
    /// Reading the history from a registered thread can stall a stop; prefer
    /// [`Self::last_stw_metrics`] there.
    #[must_use]
    pub const fn round_stats(&self) -> &RoundStats {
        &self.stats
    }

    /// Allocation lock statistics.
    #[must_use]
    pub fn lock_stats(&self) -> LockStats {
        self.alloc.stats()
    }

    /// Number of live registered threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.lock_alloc().live_count()
    }

    /// Process-unique id of this collector.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Configuration the collector was built with.
    #[must_use]
    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Suspension mechanism in use.
    #[must_use]
    pub fn suspend_kind(&self) -> SuspendKind {
        self.backend.kind()
    }

    /// Suspend and restart signals, if signals are used.
    #[must_use]
    pub fn signals(&self) -> Option<(i32, i32)> {
        self.backend.signals()
    }

    // ------------------------------------------------------------------------
    // Fork hooks
    // ------------------------------------------------------------------------

    /// Quiesce the collector before `fork()`.
    ///
    /// Takes the allocation lock, then the mark lock once no builder is in
    /// flight. Must be followed by [`Self::fork_parent`] or
    /// [`Self::fork_child`] on the same thread.
    pub fn fork_prepare(&self) {
        log_fork("prepare");
        self.as_blocked(|| self.alloc.lock_raw());
        self.marker.lock_raw_quiesced();
        self.fork_held
            .store(FORK_HELD_ALLOC | FORK_HELD_MARK, Ordering::Release);
    }

    /// Release what [`Self::fork_prepare`] took, in reverse order.
    pub fn fork_parent(&self) {
        log_fork("parent");
        let held = self.fork_held.swap(0, Ordering::AcqRel);
        // SAFETY: `fork_prepare` took these raw on this thread.
        unsafe {
            if held & FORK_HELD_MARK != 0 {
                self.marker.unlock_raw();
            }
            if held & FORK_HELD_ALLOC != 0 {
                self.alloc.unlock_raw();
            }
        }
    }

    /// Rebuild the collector in a fork child, where only the calling thread
    /// survives.
    ///
    /// Leaves exactly the caller's record in the registry, forgets the
    /// marker helpers and disables parallel marking. Nothing here logs:
    /// a subscriber's locks may have been held by a thread that is gone.
    pub fn fork_child(&self) {
        let held = self.fork_held.swap(0, Ordering::AcqRel);
        if held & FORK_HELD_ALLOC == 0 {
            self.alloc.lock_raw();
        }
        if held & FORK_HELD_MARK == 0 {
            self.marker.lock_raw();
        }

        let me = sys_thread::current_thread_id();
        // SAFETY: the allocation lock is held raw and no guard exists.
        let survivor = unsafe { self.alloc.data_unchecked() }.retain_only(me);
        if let Some(record) = survivor {
            record.blocked.store(false, Ordering::SeqCst);
            record.in_critical.store(false, Ordering::SeqCst);
        }
        self.poll.store(false, Ordering::SeqCst);
        self.alloc.set_collecting(false);

        // SAFETY: both locks are held raw above, mark lock last.
        unsafe {
            self.marker.reset_after_fork();
            self.marker.unlock_raw();
            self.alloc.unlock_raw();
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Run `f` as a blocked thread if the caller is one of our mutators.
    fn as_blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        match current_for(self.id) {
            Some(record) if !record.is_blocked() => {
                enter_blocking(&record);
                let result = f();
                leave_blocking(&record);
                result
            }
            _ => f(),
        }
    }

    fn lock_alloc(&self) -> AllocGuard<'_, ThreadRegistry> {
        self.as_blocked(|| self.alloc.lock())
    }

    pub(crate) fn backend(&self) -> &dyn SuspendBackend {
        self.backend.as_ref()
    }

    pub(crate) const fn alloc_lock(&self) -> &AllocationLock<ThreadRegistry> {
        &self.alloc
    }

    pub(crate) fn begin_round(&self) -> u64 {
        self.rounds_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn finish_round(&self, metrics: StwMetrics) {
        self.stats.record(metrics);
    }
}

impl fmt::Debug for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorState")
            .field("id", &self.id)
            .field("suspend_kind", &self.backend.kind())
            .field("marker", &self.marker)
            .field("rounds", &self.stats.rounds())
            .finish_non_exhaustive()
    }
}

/// A registered mutator thread. Dropping it unregisters the thread.
///
/// Not `Send`: it describes the thread that created it.
pub struct MutatorHandle {
    collector: Arc<CollectorState>,
    record: Arc<ThreadRecord>,
    _not_send: PhantomData<*const ()>,
}

impl MutatorHandle {
    /// Native id of this thread.
    #[must_use]
    pub fn id(&self) -> NativeThreadId {
        self.record.id()
    }

    /// The collector this thread is registered with.
    #[must_use]
    pub const fn collector(&self) -> &Arc<CollectorState> {
        &self.collector
    }

    /// This thread's record.
    #[must_use]
    pub const fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    /// Stop here if a cooperative stop is pending.
    ///
    /// A single relaxed load when no stop is pending. With signal
    /// suspension this never stops the thread.
    #[inline]
    pub fn safepoint(&self) {
        if self.collector.poll.load(Ordering::Relaxed) {
            self.safepoint_slow();
        }
    }

    #[cold]
    fn safepoint_slow(&self) {
        if self.record.is_blocked() {
            return;
        }
        if self.record.suspend.load() == SuspendState::SuspendRequested {
            suspend_self(&self.record, true);
        }
    }

    /// Run `f` as a blocked thread.
    ///
    /// `f` must not touch the managed heap: the thread counts as stopped
    /// while it runs, with the roots it had on entry. Any stop requested
    /// meanwhile is honored before this returns.
    pub fn do_blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.record.is_blocked() {
            return f();
        }
        enter_blocking(&self.record);
        let result = f();
        leave_blocking(&self.record);
        result
    }

    /// Inside [`Self::do_blocking`], run `f` as an ordinary mutator again.
    pub fn call_with_gc_active<R>(&self, f: impl FnOnce() -> R) -> R {
        if !self.record.is_blocked() {
            return f();
        }
        leave_blocking(&self.record);
        let result = f();
        enter_blocking(&self.record);
        result
    }

    /// Run `f` as an allocator critical region.
    ///
    /// A stop that catches the thread inside restarts it until it has left
    /// the region. A cooperative stop is honored right after `f` returns.
    pub fn critical_region<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.record.in_critical.load(Ordering::Relaxed) {
            return f();
        }
        self.record.in_critical.store(true, Ordering::SeqCst);
        let result = f();
        self.record.in_critical.store(false, Ordering::SeqCst);
        self.safepoint();
        result
    }

    /// Forbid collections until [`Self::enable_gc`].
    pub fn disable_gc(&self) {
        self.record.flags.set(ThreadFlags::DISABLED_GC);
    }

    /// Allow collections again.
    pub fn enable_gc(&self) {
        self.record.flags.clear(ThreadFlags::DISABLED_GC);
    }

    /// Returns `true` while this thread forbids collections.
    #[must_use]
    pub fn is_gc_disabled(&self) -> bool {
        self.record.flags.contains(ThreadFlags::DISABLED_GC)
    }

    /// Reap this thread's record as soon as the handle drops.
    pub fn detach(&self) {
        self.record.flags.set(ThreadFlags::DETACHED);
    }
}

impl Drop for MutatorHandle {
    fn drop(&mut self) {
        let record = &self.record;
        record.flags.set(ThreadFlags::EXITING);
        record.in_critical.store(false, Ordering::SeqCst);

        let detached = {
            let mut registry = self.collector.lock_alloc();
            let detached = record.flags.contains(ThreadFlags::DETACHED);
            if detached {
                if !registry.remove_record(record) {
                    fatal("exiting thread's record is missing from the registry");
                }
            } else {
                record.flags.set(ThreadFlags::FINISHED);
            }
            detached
        };
        clear_current();
        log_thread_exit(record.id().as_raw(), detached);
    }
}

impl fmt::Debug for MutatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorHandle")
            .field("collector", &self.collector.id)
            .field("record", &self.record)
            .finish()
    }
}

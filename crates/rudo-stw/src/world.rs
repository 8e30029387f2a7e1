//! Stopping and restarting the world.
//!
//! [`CollectorState::stop_world`] returns a [`WorldStopped`] holding the
//! allocation lock. Every live thread appears in it exactly once with the
//! way it was brought to rest. Dropping the value (or calling
//! [`WorldStopped::resume`]) restarts every thread and releases the lock.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use sys_thread::NativeThreadId;

use crate::atomic::{full_fence, SuspendState, ThreadFlags};
use crate::collector::CollectorState;
use crate::context::{capture_context, ThreadRoots};
use crate::error::fatal;
use crate::lock::AllocGuard;
use crate::metrics::StwMetrics;
use crate::registry::{ThreadRecord, ThreadRegistry};
use crate::suspend::{Delivery, SuspendBackend};
use crate::tracing::internal::{
    log_critical_retry, log_signal_resent, log_threads_stopped, log_world_restarted,
    trace_stop_world, RoundSpan,
};

/// Sleep added per critical-region retry after the first.
const CRITICAL_RETRY_STEP: Duration = Duration::from_micros(10);

/// Longest sleep between critical-region retries.
const CRITICAL_RETRY_MAX: Duration = Duration::from_micros(240);

/// Sleep used once spinning on a handshake gave up.
const HANDSHAKE_SLEEP: Duration = Duration::from_micros(50);

/// How a thread was brought to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The thread captured its context and parked.
    Suspended,
    /// The thread was in a blocking region; its entry snapshot is used.
    Blocked,
    /// The thread was exiting or gone; it has no roots.
    Compensated,
    /// The thread is the one stopping the world.
    Initiator,
}

/// One live thread of a stopped world.
pub struct StoppedThread {
    record: Arc<ThreadRecord>,
    outcome: StopOutcome,
}

impl StoppedThread {
    /// Native id of the thread.
    #[must_use]
    pub fn id(&self) -> NativeThreadId {
        self.record.id()
    }

    /// How the thread was stopped.
    #[must_use]
    pub const fn outcome(&self) -> StopOutcome {
        self.outcome
    }

    /// The thread's record.
    #[must_use]
    pub const fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    /// Roots to scan, `None` for compensated threads.
    ///
    /// For the initiator the context is captured afresh on every call, so
    /// this must be called on the initiating thread.
    #[must_use]
    pub fn roots(&self) -> Option<ThreadRoots> {
        match self.outcome {
            StopOutcome::Compensated => None,
            StopOutcome::Initiator => Some(initiator_roots(&self.record)),
            StopOutcome::Suspended | StopOutcome::Blocked => Some(self.record.roots()),
        }
    }
}

impl fmt::Debug for StoppedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoppedThread")
            .field("id", &self.id())
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Index buffers for the handshake.
///
/// Sized before the first request and reused until the last resume is
/// acknowledged: a stopped thread may hold the allocator's lock, so the
/// initiator must not allocate in between.
struct Scratch {
    pending: Vec<usize>,
    stuck: Vec<usize>,
    waking: Vec<usize>,
}

impl Scratch {
    fn with_capacity(threads: usize) -> Self {
        Self {
            pending: Vec::with_capacity(threads),
            stuck: Vec::with_capacity(threads),
            waking: Vec::with_capacity(threads),
        }
    }
}

/// A stopped world. Dropping it restarts every thread.
#[must_use = "the world restarts as soon as this is dropped"]
pub struct WorldStopped<'a> {
    collector: &'a CollectorState,
    registry: Option<AllocGuard<'a, ThreadRegistry>>,
    threads: Vec<StoppedThread>,
    scratch: Scratch,
    round: u64,
    started: Instant,
    critical_retries: usize,
    critical_threads: usize,
    resends: usize,
    markers: usize,
    // Entered before the first request, exited after the last resume.
    _span: RoundSpan,
}

impl<'a> WorldStopped<'a> {
    /// Stop every live thread in `registry` except `me`.
    pub(crate) fn stop(
        collector: &'a CollectorState,
        registry: AllocGuard<'a, ThreadRegistry>,
        me: Option<&Arc<ThreadRecord>>,
    ) -> Self {
        let started = Instant::now();
        let round = collector.begin_round();
        let backend = collector.backend();
        let retry_interval = collector.config().retry_interval;
        let live = registry.live_count();
        let span = trace_stop_world(round, live);

        let mut threads = Vec::with_capacity(live);
        let mut scratch = Scratch::with_capacity(live);

        collector.alloc_lock().set_collecting(true);
        backend.begin_stop();

        for record in registry.iter_live() {
            let outcome = if me.is_some_and(|me| Arc::ptr_eq(me, record)) {
                StopOutcome::Initiator
            } else {
                match request_stop(backend, record) {
                    Some(outcome) => outcome,
                    None => {
                        scratch.pending.push(threads.len());
                        // Placeholder until the thread answers.
                        StopOutcome::Compensated
                    }
                }
            };
            threads.push(StoppedThread {
                record: Arc::clone(record),
                outcome,
            });
        }
        let resends = await_stopped(backend, &mut threads, &mut scratch.pending, retry_interval);

        let mut world = Self {
            collector,
            registry: Some(registry),
            threads,
            scratch,
            round,
            started,
            critical_retries: 0,
            critical_threads: 0,
            resends,
            markers: 0,
            _span: span,
        };
        world.settle_critical_regions();
        full_fence();
        world
    }

    /// Restart threads caught inside an allocator critical region, let
    /// them leave it, and stop them again.
    fn settle_critical_regions(&mut self) {
        let backend = self.collector.backend();
        let retry_interval = self.collector.config().retry_interval;
        let Scratch {
            pending,
            stuck,
            waking,
        } = &mut self.scratch;
        let mut attempt = 0usize;

        loop {
            stuck.clear();
            stuck.extend(
                self.threads
                    .iter()
                    .enumerate()
                    .filter(|(_, thread)| {
                        thread.outcome == StopOutcome::Suspended
                            && thread.record.in_critical.load(Ordering::SeqCst)
                    })
                    .map(|(index, _)| index),
            );
            if stuck.is_empty() {
                return;
            }

            attempt += 1;
            self.critical_retries += 1;
            self.critical_threads = self.critical_threads.max(stuck.len());

            waking.clear();
            waking.extend(
                stuck
                    .iter()
                    .copied()
                    .filter(|&index| begin_resume(backend, &self.threads[index].record)),
            );
            await_running(backend, &self.threads, waking, retry_interval);

            if attempt == 1 {
                thread::yield_now();
            } else {
                let steps = u32::try_from(attempt - 2).unwrap_or(u32::MAX);
                thread::sleep(CRITICAL_RETRY_STEP.saturating_mul(steps).min(CRITICAL_RETRY_MAX));
            }

            pending.clear();
            for &index in stuck.iter() {
                match request_stop(backend, &self.threads[index].record) {
                    Some(outcome) => self.threads[index].outcome = outcome,
                    None => pending.push(index),
                }
            }
            self.resends += await_stopped(backend, &mut self.threads, pending, retry_interval);
        }
    }

    /// Every live thread with its outcome.
    #[must_use]
    pub fn threads(&self) -> &[StoppedThread] {
        &self.threads
    }

    /// Number of threads with `outcome`.
    #[must_use]
    pub fn count(&self, outcome: StopOutcome) -> usize {
        self.threads
            .iter()
            .filter(|thread| thread.outcome == outcome)
            .count()
    }

    /// Roots of every thread that has them.
    pub fn roots(&self) -> impl Iterator<Item = ThreadRoots> + '_ {
        self.threads.iter().filter_map(StoppedThread::roots)
    }

    /// Sequence number of this round, starting at 1.
    #[must_use]
    pub const fn round(&self) -> u64 {
        self.round
    }

    /// Number of critical-region retry passes this stop needed.
    #[must_use]
    pub const fn critical_region_retries(&self) -> usize {
        self.critical_retries
    }

    /// The registry, frozen for the duration of the stop.
    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        match &self.registry {
            Some(registry) => registry,
            None => fatal("stopped world without its registry"),
        }
    }

    pub(crate) fn set_markers(&mut self, markers: usize) {
        self.markers = markers;
    }

    /// Restart every thread and report the round's metrics.
    pub fn resume(mut self) -> StwMetrics {
        self.restart()
    }

    fn restart(&mut self) -> StwMetrics {
        let backend = self.collector.backend();
        let retry_interval = self.collector.config().retry_interval;

        let waking = &mut self.scratch.waking;
        waking.clear();
        waking.extend(
            self.threads
                .iter()
                .enumerate()
                .filter(|(_, thread)| thread.outcome != StopOutcome::Initiator)
                .filter(|(_, thread)| begin_resume(backend, &thread.record))
                .map(|(index, _)| index),
        );
        backend.end_stop();
        await_running(backend, &self.threads, waking, retry_interval);

        let pause = self.started.elapsed();
        let metrics = StwMetrics {
            round: self.round,
            pause,
            threads_stopped: self.count(StopOutcome::Suspended),
            blocked: self.count(StopOutcome::Blocked),
            compensated: self.count(StopOutcome::Compensated),
            critical_region_retries: self.critical_retries,
            markers: self.markers,
        };
        self.collector.alloc_lock().set_collecting(false);
        self.collector.finish_round(metrics);

        log_threads_stopped(metrics.threads_stopped, metrics.blocked, metrics.compensated);
        if self.resends > 0 {
            log_signal_resent(self.resends);
        }
        if self.critical_retries > 0 {
            log_critical_retry(self.critical_retries, self.critical_threads);
        }
        log_world_restarted(self.round, pause);
        self.registry = None;
        metrics
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        if self.registry.is_some() {
            self.restart();
        }
    }
}

impl fmt::Debug for WorldStopped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldStopped")
            .field("round", &self.round)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Handshake steps
// ============================================================================

/// Move `record` to `SuspendRequested` and deliver the request.
///
/// Returns the outcome if it is already known, `None` if the initiator has
/// to wait for the thread.
fn request_stop(backend: &dyn SuspendBackend, record: &ThreadRecord) -> Option<StopOutcome> {
    if !record
        .suspend
        .transition(SuspendState::Running, SuspendState::SuspendRequested)
    {
        fatal("thread was not running when the world was stopped");
    }
    // Pairs with the store to `blocked` in `leave_blocking`: either the
    // thread sees the request or we see it blocked.
    if record.is_blocked() {
        return Some(StopOutcome::Blocked);
    }
    match backend.request(record) {
        Delivery::Delivered => None,
        Delivery::Gone => Some(compensate(record)),
    }
}

/// Give up on a thread that cannot answer.
fn compensate(record: &ThreadRecord) -> StopOutcome {
    if record
        .suspend
        .transition(SuspendState::SuspendRequested, SuspendState::Running)
    {
        StopOutcome::Compensated
    } else {
        // It answered after all.
        classify(record).unwrap_or(StopOutcome::Compensated)
    }
}

fn classify(record: &ThreadRecord) -> Option<StopOutcome> {
    match record.suspend.load() {
        SuspendState::Suspended => Some(StopOutcome::Suspended),
        SuspendState::SuspendRequested => {
            if record.flags.contains(ThreadFlags::EXITING)
                && record
                    .suspend
                    .transition(SuspendState::SuspendRequested, SuspendState::Running)
            {
                Some(StopOutcome::Compensated)
            } else if record.is_blocked() {
                Some(StopOutcome::Blocked)
            } else {
                None
            }
        }
        SuspendState::Running => Some(StopOutcome::Compensated),
        SuspendState::ResumeRequested => fatal("thread asked to resume while stopping"),
    }
}

/// Wait until every thread in `pending` has an outcome. Returns the number
/// of times the request had to be sent again.
fn await_stopped(
    backend: &dyn SuspendBackend,
    threads: &mut [StoppedThread],
    pending: &mut Vec<usize>,
    retry_interval: Duration,
) -> usize {
    let backoff = Backoff::new();
    let mut last_request = Instant::now();
    let mut resends = 0;

    while !pending.is_empty() {
        pending.retain(|&index| match classify(&threads[index].record) {
            Some(outcome) => {
                threads[index].outcome = outcome;
                false
            }
            None => true,
        });
        if pending.is_empty() {
            break;
        }

        if last_request.elapsed() >= retry_interval {
            resends += pending.len();
            pending.retain(|&index| {
                let record = &threads[index].record;
                match backend.request(record) {
                    Delivery::Delivered => true,
                    Delivery::Gone => {
                        let outcome = compensate(record);
                        threads[index].outcome = outcome;
                        false
                    }
                }
            });
            last_request = Instant::now();
        }

        if backoff.is_completed() {
            thread::sleep(HANDSHAKE_SLEEP);
        } else {
            backoff.snooze();
        }
    }
    resends
}

/// Ask `record` to resume. Returns `true` if the initiator must wait for
/// the thread to acknowledge.
fn begin_resume(backend: &dyn SuspendBackend, record: &ThreadRecord) -> bool {
    loop {
        match record.suspend.load() {
            SuspendState::Running => return false,
            SuspendState::SuspendRequested => {
                if record
                    .suspend
                    .transition(SuspendState::SuspendRequested, SuspendState::Running)
                {
                    return false;
                }
            }
            SuspendState::Suspended => {
                record.context.clear();
                if record
                    .suspend
                    .transition(SuspendState::Suspended, SuspendState::ResumeRequested)
                {
                    return backend.wake(record) == Delivery::Delivered;
                }
            }
            SuspendState::ResumeRequested => return true,
        }
    }
}

/// Wait until every thread in `waking` is running again. Drains `waking`.
fn await_running(
    backend: &dyn SuspendBackend,
    threads: &[StoppedThread],
    waking: &mut Vec<usize>,
    retry_interval: Duration,
) {
    let backoff = Backoff::new();
    let mut last_wake = Instant::now();

    while !waking.is_empty() {
        waking.retain(|&index| threads[index].record.suspend.load() != SuspendState::Running);
        if waking.is_empty() {
            break;
        }
        if last_wake.elapsed() >= retry_interval {
            waking.retain(|&index| backend.wake(&threads[index].record) == Delivery::Delivered);
            last_wake = Instant::now();
        }
        if backoff.is_completed() {
            thread::sleep(HANDSHAKE_SLEEP);
        } else {
            backoff.snooze();
        }
    }
}

/// Roots of the thread that stopped the world, captured now.
fn initiator_roots(record: &ThreadRecord) -> ThreadRoots {
    let context = capture_context();
    ThreadRoots {
        id: record.id(),
        stack_start: context.sp,
        stack_end: record.stack_end().max(context.sp),
        context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuspendKind;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeBackend {
        gone: bool,
        requests: AtomicUsize,
        wakes: AtomicUsize,
    }

    impl SuspendBackend for FakeBackend {
        fn kind(&self) -> SuspendKind {
            SuspendKind::Cooperative
        }

        fn request(&self, _record: &ThreadRecord) -> Delivery {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.gone {
                Delivery::Gone
            } else {
                Delivery::Delivered
            }
        }

        fn wake(&self, _record: &ThreadRecord) -> Delivery {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            Delivery::Delivered
        }
    }

    fn record(raw: u64) -> Arc<ThreadRecord> {
        ThreadRegistry::new()
            .register(NativeThreadId::from_raw(raw), usize::MAX)
            .unwrap()
    }

    #[test]
    fn blocked_thread_is_not_signalled() {
        let backend = FakeBackend::default();
        let record = record(1);
        record.blocked.store(true, Ordering::SeqCst);
        assert_eq!(request_stop(&backend, &record), Some(StopOutcome::Blocked));
        assert_eq!(backend.requests.load(Ordering::SeqCst), 0);
        assert_eq!(record.suspend_state(), SuspendState::SuspendRequested);

        assert!(!begin_resume(&backend, &record));
        assert_eq!(record.suspend_state(), SuspendState::Running);
    }

    #[test]
    fn vanished_thread_is_compensated() {
        let backend = FakeBackend {
            gone: true,
            ..FakeBackend::default()
        };
        let record = record(2);
        assert_eq!(request_stop(&backend, &record), Some(StopOutcome::Compensated));
        assert_eq!(record.suspend_state(), SuspendState::Running);
    }

    #[test]
    fn exiting_thread_is_compensated_while_pending() {
        let backend = FakeBackend::default();
        let record = record(3);
        assert_eq!(request_stop(&backend, &record), None);
        assert_eq!(classify(&record), None);
        record.flags.set(ThreadFlags::EXITING);
        assert_eq!(classify(&record), Some(StopOutcome::Compensated));
        assert_eq!(record.suspend_state(), SuspendState::Running);
    }

    #[test]
    fn suspended_thread_is_woken_and_context_cleared() {
        let backend = FakeBackend::default();
        let record = record(4);
        assert_eq!(request_stop(&backend, &record), None);
        record.save_context(&capture_context());
        assert!(record
            .suspend
            .transition(SuspendState::SuspendRequested, SuspendState::Suspended));
        assert_eq!(classify(&record), Some(StopOutcome::Suspended));

        assert!(begin_resume(&backend, &record));
        assert_eq!(record.suspend_state(), SuspendState::ResumeRequested);
        assert_eq!(record.context.sp(), 0);
        assert_eq!(backend.wakes.load(Ordering::SeqCst), 1);
        // Still waiting for the thread to acknowledge.
        assert!(begin_resume(&backend, &record));
        assert!(record
            .suspend
            .transition(SuspendState::ResumeRequested, SuspendState::Running));
        assert!(!begin_resume(&backend, &record));
        assert!(!begin_resume(&backend, &record));
    }

    #[test]
    fn handshake_waits_reuse_their_buffers() {
        let backend = FakeBackend::default();
        let mut threads: Vec<StoppedThread> = (10..14)
            .map(|raw| StoppedThread {
                record: record(raw),
                outcome: StopOutcome::Compensated,
            })
            .collect();
        let mut scratch = Scratch::with_capacity(threads.len());
        for (index, thread) in threads.iter().enumerate() {
            assert_eq!(request_stop(&backend, &thread.record), None);
            scratch.pending.push(index);
        }
        for thread in &threads {
            assert!(thread
                .record
                .suspend
                .transition(SuspendState::SuspendRequested, SuspendState::Suspended));
        }

        let buffer = scratch.pending.as_ptr();
        let resends = await_stopped(&backend, &mut threads, &mut scratch.pending, Duration::from_secs(60));
        assert_eq!(resends, 0);
        assert!(scratch.pending.is_empty());
        assert_eq!(scratch.pending.as_ptr(), buffer);
        assert!(threads.iter().all(|thread| thread.outcome == StopOutcome::Suspended));

        scratch
            .waking
            .extend((0..threads.len()).filter(|&index| begin_resume(&backend, &threads[index].record)));
        assert_eq!(scratch.waking.len(), threads.len());
        for thread in &threads {
            assert!(thread
                .record
                .suspend
                .transition(SuspendState::ResumeRequested, SuspendState::Running));
        }
        let buffer = scratch.waking.as_ptr();
        await_running(&backend, &threads, &mut scratch.waking, Duration::from_secs(60));
        assert!(scratch.waking.is_empty());
        assert_eq!(scratch.waking.as_ptr(), buffer);
    }
}

//! Suspend/resume backends and the per-thread side of the handshake.
//!
//! The initiator moves a record from `Running` to `SuspendRequested` and
//! asks the backend to deliver the request. The target thread captures its
//! context, moves itself to `Suspended` and parks. On restart the initiator
//! moves it to `ResumeRequested` and wakes it; the thread acknowledges by
//! moving back to `Running`.
//!
//! Two backends implement delivery: [`signal::SignalBackend`] interrupts the
//! thread wherever it is, [`cooperative::CooperativeBackend`] raises a flag
//! that threads poll at safepoints.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::atomic::SuspendState;
use crate::config::{CollectorConfig, SuspendKind};
use crate::context::capture_context;
use crate::error::{fatal, StwError};
use crate::registry::ThreadRecord;
use crate::sync::{LockGuard, LockOrder};
#[cfg(not(unix))]
use crate::tracing::warn;

pub(crate) mod cooperative;
#[cfg(unix)]
pub(crate) mod signal;

use cooperative::CooperativeBackend;

/// Result of asking a backend to reach a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The request was handed to the thread.
    Delivered,
    /// The thread no longer exists.
    Gone,
}

/// Mechanism used to stop and restart mutator threads.
pub(crate) trait SuspendBackend: Send + Sync {
    /// Which mechanism this is.
    fn kind(&self) -> SuspendKind;

    /// Suspend and restart signal numbers, if signals are used.
    fn signals(&self) -> Option<(i32, i32)> {
        None
    }

    /// Called once before any record is moved to `SuspendRequested`.
    fn begin_stop(&self) {}

    /// Deliver the request to a record already in `SuspendRequested`.
    ///
    /// May be called again for the same record if it is slow to respond.
    fn request(&self, record: &ThreadRecord) -> Delivery;

    /// Called once every thread has been asked to resume.
    fn end_stop(&self) {}

    /// Wake a record that was moved to `ResumeRequested`.
    fn wake(&self, record: &ThreadRecord) -> Delivery;
}

/// Build the backend asked for by `config`, falling back to cooperative
/// suspension where signals are unavailable.
pub(crate) fn make_backend(
    config: &CollectorConfig,
    poll: &Arc<AtomicBool>,
) -> Result<Box<dyn SuspendBackend>, StwError> {
    match config.suspend_kind {
        #[cfg(unix)]
        SuspendKind::Signals => {
            let (suspend, restart) = config.signals()?;
            Ok(Box::new(signal::SignalBackend::install(suspend, restart)?))
        }
        #[cfg(not(unix))]
        SuspendKind::Signals => {
            warn(format_args!(
                "signal suspension is not supported here; using cooperative suspension"
            ));
            Ok(Box::new(CooperativeBackend::new(Arc::clone(poll))))
        }
        SuspendKind::Cooperative => Ok(Box::new(CooperativeBackend::new(Arc::clone(poll)))),
    }
}

// ============================================================================
// Parking
// ============================================================================

/// Mutex and condition variable a self-suspended thread sleeps on.
pub(crate) struct Parker {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Sleep until `done` returns `true`. `done` is evaluated under the lock.
    pub(crate) fn park_until<F>(&self, mut done: F)
    where
        F: FnMut() -> bool,
    {
        let mut guard = self.lock.lock();
        let _order = LockGuard::new(LockOrder::Parker);
        while !done() {
            self.cv.wait(&mut guard);
        }
    }

    /// Wake every thread parked on this parker.
    pub(crate) fn unpark(&self) {
        let _guard = self.lock.lock();
        let _order = LockGuard::new(LockOrder::Parker);
        self.cv.notify_all();
    }
}

/// Stop the calling thread on behalf of a pending request.
///
/// `recapture` is `false` when leaving a blocking region: the snapshot taken
/// on entry still describes everything the thread can reach, and the
/// initiator may already be reading it.
pub(crate) fn suspend_self(record: &ThreadRecord, recapture: bool) {
    if recapture {
        record.save_context(&capture_context());
    }
    if !record
        .suspend
        .transition(SuspendState::SuspendRequested, SuspendState::Suspended)
    {
        return;
    }
    record
        .parker
        .park_until(|| record.suspend.load() == SuspendState::ResumeRequested);
    if !record
        .suspend
        .transition(SuspendState::ResumeRequested, SuspendState::Running)
    {
        fatal("resumed thread left ResumeRequested behind its own back");
    }
}

// ============================================================================
// Blocking regions
// ============================================================================

/// Publish the calling thread's context and mark it blocked.
///
/// From here on the thread is treated as stopped by any initiator, so it
/// must not touch the managed heap until [`leave_blocking`].
pub(crate) fn enter_blocking(record: &ThreadRecord) {
    record.save_context(&capture_context());
    record.blocked.store(true, Ordering::SeqCst);
}

/// Leave a blocking region, stopping first if a request is pending.
pub(crate) fn leave_blocking(record: &ThreadRecord) {
    // Store-then-load against the initiator's request-then-load of `blocked`
    // in `request_stop`: both sides must be `SeqCst`.
    record.blocked.store(false, Ordering::SeqCst);
    if record.suspend.load_seqcst() == SuspendState::SuspendRequested {
        suspend_self(record, false);
    }
    record.context.clear();
}

// ============================================================================
// Current thread
// ============================================================================

thread_local! {
    /// Record of the calling thread, read by the suspend signal handler.
    static CURRENT: Cell<*const ThreadRecord> = const { Cell::new(ptr::null()) };
}

/// Publish `record` as the calling thread's record.
///
/// Returns `false` if the thread already has one.
pub(crate) fn set_current(record: &Arc<ThreadRecord>) -> bool {
    CURRENT
        .try_with(|current| {
            if current.get().is_null() {
                current.set(Arc::as_ptr(record));
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
}

/// Forget the calling thread's record.
pub(crate) fn clear_current() {
    let _ = CURRENT.try_with(|current| current.set(ptr::null()));
}

/// Raw pointer to the calling thread's record, null if unregistered.
///
/// Async-signal-safe.
pub(crate) fn current_ptr() -> *const ThreadRecord {
    CURRENT.try_with(Cell::get).unwrap_or(ptr::null())
}

/// The calling thread's record if it belongs to collector `collector`.
pub(crate) fn current_for(collector: u64) -> Option<Arc<ThreadRecord>> {
    let ptr = current_ptr();
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the pointer was published from a live `Arc` by this thread's
    // `MutatorHandle`, which keeps its own strong reference until it clears
    // the slot. Bumping the count first makes the new `Arc` an owned one.
    let record = unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    };
    (record.collector() == collector).then_some(record)
}

/// Returns `true` if the calling thread has a record in any collector.
#[must_use]
pub(crate) fn is_registered() -> bool {
    !current_ptr().is_null()
}

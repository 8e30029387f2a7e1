//! Signal-based suspension.
//!
//! The suspend handler is process-wide and finds the interrupted thread's
//! record through a thread-local pointer. It only touches atomics, that
//! pointer, `errno` and `sigsuspend`. The restart signal is blocked while
//! the handler runs, so a restart sent before the thread parks stays
//! pending and ends the `sigsuspend` at once.

use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;
use parking_lot::Mutex;
use sys_thread::{DeliveryError, SignalSet};

use super::{current_ptr, Delivery, SuspendBackend};
use crate::atomic::SuspendState;
use crate::config::SuspendKind;
use crate::context::capture_context;
use crate::error::{fatal, StwError};
use crate::registry::ThreadRecord;

/// Signals installed in this process, if any.
static INSTALLED: Mutex<Option<(i32, i32)>> = parking_lot::const_mutex(None);

/// Restart signal, read by the suspend handler.
static RESTART_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Backend that stops threads with `pthread_kill`.
pub(crate) struct SignalBackend {
    suspend: c_int,
    restart: c_int,
}

impl SignalBackend {
    /// Install the handlers for `suspend`/`restart`, once per process.
    ///
    /// # Errors
    ///
    /// [`StwError::SignalConflict`] if different signals are already in
    /// use, [`StwError::SignalInstall`] if `sigaction` fails.
    pub(crate) fn install(suspend: c_int, restart: c_int) -> Result<Self, StwError> {
        let mut installed = INSTALLED.lock();
        match *installed {
            Some(pair) if pair == (suspend, restart) => {}
            Some(pair) => {
                return Err(StwError::SignalConflict {
                    installed: pair,
                    requested: (suspend, restart),
                });
            }
            None => {
                RESTART_SIGNAL.store(restart, Ordering::Release);
                // SAFETY: both handlers are async-signal-safe.
                unsafe {
                    sys_thread::install_handler(restart, restart_handler, &[])?;
                    sys_thread::install_handler(suspend, suspend_handler, &[restart])?;
                }
                *installed = Some((suspend, restart));
            }
        }
        Ok(Self { suspend, restart })
    }

    fn send(&self, record: &ThreadRecord, signal: c_int) -> Delivery {
        match sys_thread::send_signal(record.id(), signal) {
            Ok(()) => Delivery::Delivered,
            Err(DeliveryError::Gone) => Delivery::Gone,
            Err(DeliveryError::Os(_)) => fatal("pthread_kill failed"),
        }
    }
}

impl SuspendBackend for SignalBackend {
    fn kind(&self) -> SuspendKind {
        SuspendKind::Signals
    }

    fn signals(&self) -> Option<(i32, i32)> {
        Some((self.suspend, self.restart))
    }

    fn request(&self, record: &ThreadRecord) -> Delivery {
        self.send(record, self.suspend)
    }

    fn wake(&self, record: &ThreadRecord) -> Delivery {
        // The thread may have parked itself outside the handler.
        record.parker.unpark();
        self.send(record, self.restart)
    }
}

extern "C" fn suspend_handler(_signal: c_int) {
    let saved_errno = sys_thread::errno();
    let record = current_ptr();
    if !record.is_null() {
        // SAFETY: the thread's `MutatorHandle` keeps the record alive while
        // the pointer is published, and the handler runs on that thread.
        suspend_in_handler(unsafe { &*record });
    }
    sys_thread::set_errno(saved_errno);
}

extern "C" fn restart_handler(_signal: c_int) {
    // Only needed to end `sigsuspend`.
}

fn suspend_in_handler(record: &ThreadRecord) {
    // A thread in a blocking region already published its context and
    // honors the request itself when it leaves.
    if record.suspend.load() != SuspendState::SuspendRequested || record.is_blocked() {
        return;
    }

    record.save_context(&capture_context());
    if !record
        .suspend
        .transition(SuspendState::SuspendRequested, SuspendState::Suspended)
    {
        return;
    }

    let mut wait_mask = SignalSet::full();
    let _ = wait_mask.remove(RESTART_SIGNAL.load(Ordering::Acquire));
    while record.suspend.load() != SuspendState::ResumeRequested {
        sys_thread::wait_for_signal(&wait_mask);
    }
    record
        .suspend
        .transition(SuspendState::ResumeRequested, SuspendState::Running);
}

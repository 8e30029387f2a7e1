//! Process-wide fork handlers.
//!
//! [`install_fork_handlers`] registers one set of `pthread_atfork`
//! callbacks for the whole process. They run the hooks of every live
//! collector built with `handle_fork`, in creation order for `prepare` and
//! in reverse order afterwards. The list lock is taken in `prepare` and
//! released in `parent`/`child`, so no collector can be added or dropped
//! across the fork.

#[cfg(unix)]
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::collector::CollectorState;
use crate::error::StwError;

struct ForkList {
    installed: bool,
    collectors: Vec<Weak<CollectorState>>,
    prepared: Vec<Arc<CollectorState>>,
}

static FORK_LIST: Mutex<ForkList> = parking_lot::const_mutex(ForkList {
    installed: false,
    collectors: Vec::new(),
    prepared: Vec::new(),
});

/// Register the process-wide fork handlers. Later calls do nothing.
///
/// Collectors built with `handle_fork` call this themselves.
///
/// # Errors
///
/// [`StwError::SignalInstall`] if `pthread_atfork` fails.
pub fn install_fork_handlers() -> Result<(), StwError> {
    let mut list = FORK_LIST.lock();
    if list.installed {
        return Ok(());
    }
    #[cfg(unix)]
    // SAFETY: the callbacks only take locks that `prepare` leaves in a
    // known state and release them again.
    unsafe {
        sys_thread::register_atfork(prepare, parent, child)?;
    }
    list.installed = true;
    Ok(())
}

/// Include `collector` in the fork handlers.
pub(crate) fn track(collector: &Arc<CollectorState>) {
    let mut list = FORK_LIST.lock();
    list.collectors.retain(|weak| weak.strong_count() > 0);
    list.collectors.push(Arc::downgrade(collector));
}

#[cfg(unix)]
unsafe extern "C" fn prepare() {
    let mut list = FORK_LIST.lock();
    let collectors: Vec<Arc<CollectorState>> =
        list.collectors.iter().filter_map(Weak::upgrade).collect();
    for collector in &collectors {
        collector.fork_prepare();
    }
    list.prepared = collectors;
    // Released by `parent` or `child`.
    mem::forget(list);
}

#[cfg(unix)]
unsafe extern "C" fn parent() {
    // SAFETY: `prepare` left the list locked on this thread.
    let prepared = unsafe { take_prepared() };
    for collector in prepared.iter().rev() {
        collector.fork_parent();
    }
}

#[cfg(unix)]
unsafe extern "C" fn child() {
    // SAFETY: `prepare` left the list locked on this thread, which is the
    // only thread of the child.
    let prepared = unsafe { take_prepared() };
    for collector in prepared.iter().rev() {
        collector.fork_child();
    }
}

/// Take the prepared collectors and unlock the list.
///
/// # Safety
///
/// The list must be locked by a `prepare` on this thread.
#[cfg(unix)]
unsafe fn take_prepared() -> Vec<Arc<CollectorState>> {
    // SAFETY: forwarded to the caller.
    unsafe {
        let prepared = mem::take(&mut (*FORK_LIST.data_ptr()).prepared);
        FORK_LIST.force_unlock();
        prepared
    }
}

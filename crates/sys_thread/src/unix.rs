use std::io;
use std::mem;
use std::ptr;

use libc::c_int;

use crate::StackBounds;

pub fn current_thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    let raw = unsafe { libc::pthread_self() };
    raw as usize as u64
}

#[cfg(all(any(target_os = "linux", target_os = "android"), not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        let start = stackaddr as usize;
        Some(StackBounds {
            start,
            end: start + stacksize,
        })
    }
}

#[cfg(all(target_vendor = "apple", not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    // SAFETY: both calls only read the calling thread's own attributes.
    unsafe {
        let this = libc::pthread_self();
        let end = libc::pthread_get_stackaddr_np(this) as usize;
        let size = libc::pthread_get_stacksize_np(this);
        Some(StackBounds {
            start: end - size,
            end,
        })
    }
}

#[cfg(any(
    miri,
    not(any(target_os = "linux", target_os = "android", target_vendor = "apple"))
))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}

// ============================================================================
// Signals
// ============================================================================

/// Plain `void (*)(int)` signal handler.
pub type SignalHandler = extern "C" fn(c_int);

/// Reason a signal could not be delivered to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The target thread no longer exists.
    Gone,
    /// Any other error number reported by `pthread_kill`.
    Os(c_int),
}

/// A POSIX signal set.
#[derive(Clone, Copy)]
pub struct SignalSet {
    raw: libc::sigset_t,
}

impl SignalSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        // SAFETY: sigemptyset fully initializes the set.
        unsafe {
            let mut raw: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&raw mut raw);
            Self { raw }
        }
    }

    /// The set containing every signal.
    #[must_use]
    pub fn full() -> Self {
        // SAFETY: sigfillset fully initializes the set.
        unsafe {
            let mut raw: libc::sigset_t = mem::zeroed();
            libc::sigfillset(&raw mut raw);
            Self { raw }
        }
    }

    /// Add `signal` to the set.
    ///
    /// # Errors
    ///
    /// Fails for signal numbers the platform does not know.
    pub fn add(&mut self, signal: c_int) -> io::Result<()> {
        // SAFETY: `raw` is an initialized set.
        if unsafe { libc::sigaddset(&raw mut self.raw, signal) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Remove `signal` from the set.
    ///
    /// # Errors
    ///
    /// Fails for signal numbers the platform does not know.
    pub fn remove(&mut self, signal: c_int) -> io::Result<()> {
        // SAFETY: `raw` is an initialized set.
        if unsafe { libc::sigdelset(&raw mut self.raw, signal) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Returns `true` if `signal` is a member.
    #[must_use]
    pub fn contains(&self, signal: c_int) -> bool {
        // SAFETY: `raw` is an initialized set.
        unsafe { libc::sigismember(&raw const self.raw, signal) == 1 }
    }
}

/// Install `handler` for `signal`, blocking `also_block` while it runs.
///
/// # Safety
///
/// `handler` runs asynchronously on whichever thread the signal is delivered
/// to and must restrict itself to async-signal-safe operations.
///
/// # Errors
///
/// Returns the OS error if `sigaction` rejects the request.
pub unsafe fn install_handler(
    signal: c_int,
    handler: SignalHandler,
    also_block: &[c_int],
) -> io::Result<()> {
    let mut mask = SignalSet::empty();
    for &blocked in also_block {
        mask.add(blocked)?;
    }

    // SAFETY: `act` is fully initialized before being handed to sigaction.
    unsafe {
        let mut act: libc::sigaction = mem::zeroed();
        act.sa_sigaction = handler as libc::sighandler_t;
        act.sa_mask = mask.raw;
        act.sa_flags = libc::SA_RESTART;
        if libc::sigaction(signal, &raw const act, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Send `signal` to the thread identified by `id`.
///
/// # Errors
///
/// [`DeliveryError::Gone`] if the thread has already terminated.
pub fn send_signal(id: crate::NativeThreadId, signal: c_int) -> Result<(), DeliveryError> {
    #[allow(clippy::cast_possible_truncation)]
    let thread = id.as_raw() as usize as libc::pthread_t;
    // SAFETY: pthread_kill reports unknown threads through its return value.
    match unsafe { libc::pthread_kill(thread, signal) } {
        0 => Ok(()),
        libc::ESRCH => Err(DeliveryError::Gone),
        other => Err(DeliveryError::Os(other)),
    }
}

/// Add `set` to the calling thread's blocked mask and return the previous mask.
///
/// # Errors
///
/// Returns the error number reported by `pthread_sigmask`.
pub fn block_signals(set: &SignalSet) -> io::Result<SignalSet> {
    let mut old = SignalSet::empty();
    // SAFETY: both sets are initialized.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &raw const set.raw, &raw mut old.raw) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(old)
}

/// Replace the calling thread's blocked mask.
///
/// # Errors
///
/// Returns the error number reported by `pthread_sigmask`.
pub fn set_signal_mask(set: &SignalSet) -> io::Result<()> {
    // SAFETY: `set` is initialized.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &raw const set.raw, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// The calling thread's blocked mask.
///
/// # Errors
///
/// Returns the error number reported by `pthread_sigmask`.
pub fn current_signal_mask() -> io::Result<SignalSet> {
    let mut current = SignalSet::empty();
    // SAFETY: a null `set` only queries the mask.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &raw mut current.raw) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(current)
}

/// Atomically install `mask` and sleep until a signal handler has run.
///
/// Async-signal-safe.
pub fn wait_for_signal(mask: &SignalSet) {
    // SAFETY: sigsuspend always returns -1/EINTR once a handler ran.
    unsafe {
        libc::sigsuspend(&raw const mask.raw);
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_vendor = "apple", target_os = "freebsd", target_os = "dragonfly"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno() }
}

/// The calling thread's `errno`. Async-signal-safe.
#[must_use]
pub fn errno() -> c_int {
    // SAFETY: the location is thread-local and always valid.
    unsafe { *errno_location() }
}

/// Overwrite the calling thread's `errno`. Async-signal-safe.
pub fn set_errno(value: c_int) {
    // SAFETY: the location is thread-local and always valid.
    unsafe {
        *errno_location() = value;
    }
}

/// Highest valid signal number.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[must_use]
pub fn max_signal() -> c_int {
    libc::SIGRTMAX()
}

/// Highest valid signal number.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[must_use]
pub fn max_signal() -> c_int {
    31
}

/// First realtime signal handed out to applications, if the platform has any.
///
/// Signals between the classic range and this value are reserved by libc.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[must_use]
pub fn first_realtime_signal() -> Option<c_int> {
    Some(libc::SIGRTMIN())
}

/// First realtime signal handed out to applications, if the platform has any.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[must_use]
pub fn first_realtime_signal() -> Option<c_int> {
    None
}

/// Returns `true` for signals a collector must never claim.
#[must_use]
pub fn is_reserved_signal(signal: c_int) -> bool {
    const HOST: [c_int; 9] = [
        libc::SIGKILL,
        libc::SIGSTOP,
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGILL,
        libc::SIGFPE,
        libc::SIGABRT,
        libc::SIGCHLD,
        libc::SIGPIPE,
    ];
    if signal < 1 || signal > max_signal() || HOST.contains(&signal) {
        return true;
    }
    // glibc keeps the first few realtime signals for its own thread library.
    matches!(first_realtime_signal(), Some(rtmin) if signal > 31 && signal < rtmin)
}

/// Default signal used to ask a thread to suspend itself.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[must_use]
pub const fn default_suspend_signal() -> c_int {
    libc::SIGPWR
}

/// Default signal used to ask a thread to suspend itself.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[must_use]
pub const fn default_suspend_signal() -> c_int {
    libc::SIGUSR1
}

/// Default signal used to wake a suspended thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[must_use]
pub const fn default_restart_signal() -> c_int {
    libc::SIGXCPU
}

/// Default signal used to wake a suspended thread.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[must_use]
pub const fn default_restart_signal() -> c_int {
    libc::SIGUSR2
}

/// Register process-wide fork callbacks.
///
/// # Safety
///
/// The callbacks run around every `fork()` in the process; `child` runs in a
/// process that has exactly one thread and must not wait for any other.
///
/// # Errors
///
/// Returns the error number reported by `pthread_atfork`.
pub unsafe fn register_atfork(
    prepare: unsafe extern "C" fn(),
    parent: unsafe extern "C" fn(),
    child: unsafe extern "C" fn(),
) -> io::Result<()> {
    // SAFETY: forwarded to the caller.
    let rc = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

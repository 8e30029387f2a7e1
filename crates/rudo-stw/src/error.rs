//! Error types.

use std::fmt;
use std::io;

use sys_thread::NativeThreadId;

/// Recoverable failures reported by the collector.
///
/// Invariant violations that leave the heap in an unknown state are not
/// represented here; they abort the process through [`fatal`].
#[derive(Debug)]
pub enum StwError {
    /// A thread record could not be allocated.
    OutOfMemory,
    /// The thread already has a live record.
    AlreadyRegistered(NativeThreadId),
    /// No record exists for the thread.
    NotRegistered(NativeThreadId),
    /// A configured signal number is reserved, out of range or duplicated.
    InvalidSignal {
        /// Name of the offending setting.
        key: &'static str,
        /// The rejected value, as given.
        value: String,
    },
    /// Another collector in this process already claimed different signals.
    SignalConflict {
        /// Signals already installed (suspend, restart).
        installed: (i32, i32),
        /// Signals this collector asked for (suspend, restart).
        requested: (i32, i32),
    },
    /// `sigaction` rejected a handler.
    SignalInstall(io::Error),
    /// A live thread has collections disabled.
    GcDisabled,
}

impl fmt::Display for StwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory while registering thread"),
            Self::AlreadyRegistered(id) => write!(f, "thread {id} is already registered"),
            Self::NotRegistered(id) => write!(f, "thread {id} is not registered"),
            Self::InvalidSignal { key, value } => {
                write!(f, "{key}={value} is not a usable signal")
            }
            Self::SignalConflict {
                installed,
                requested,
            } => write!(
                f,
                "signals {}/{} requested but {}/{} already installed",
                requested.0, requested.1, installed.0, installed.1
            ),
            Self::SignalInstall(err) => write!(f, "failed to install signal handler: {err}"),
            Self::GcDisabled => f.write_str("collection is disabled by a live thread"),
        }
    }
}

impl std::error::Error for StwError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SignalInstall(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StwError {
    fn from(err: io::Error) -> Self {
        Self::SignalInstall(err)
    }
}

/// Report an unrecoverable invariant violation and abort.
#[cold]
pub(crate) fn fatal(message: &str) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(message, "fatal collector error");
    #[cfg(not(feature = "tracing"))]
    eprintln!("rudo-stw: fatal: {message}");
    std::process::abort()
}

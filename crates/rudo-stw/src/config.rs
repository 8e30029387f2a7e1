//! Collector configuration.
//!
//! Settings come from code (builder-style setters) or from the environment
//! through [`CollectorConfig::from_env`]. Malformed tuning values are
//! reported and ignored; malformed signal numbers are errors because a
//! wrong signal silently breaks suspension.

use std::time::Duration;

use crate::error::StwError;
use crate::tracing::warn;

/// Upper bound on markers, the initiator included.
pub const MAX_MARKERS: usize = 16;

/// Default time before an unacknowledged suspend signal is sent again.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// How mutator threads are brought to a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendKind {
    /// Interrupt threads with a signal and park them in the handler.
    Signals,
    /// Threads poll a flag at safepoints and park themselves.
    Cooperative,
}

impl Default for SuspendKind {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Signals
        } else {
            Self::Cooperative
        }
    }
}

/// Configuration for a [`crate::CollectorState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Requested number of markers (`MARKER_COUNT`), initiator included.
    pub markers: Option<usize>,
    /// Install `pthread_atfork` hooks for this collector (`HANDLE_FORK`).
    pub handle_fork: bool,
    /// Suspend signal override (`SUSPEND_SIGNAL`).
    pub suspend_signal: Option<i32>,
    /// Restart signal override (`RESTART_SIGNAL`).
    pub restart_signal: Option<i32>,
    /// Suspension mechanism.
    pub suspend_kind: SuspendKind,
    /// Processor count override (`NPROCS`).
    pub processors: Option<usize>,
    /// How long to wait before re-sending a suspend signal.
    pub retry_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            markers: None,
            handle_fork: false,
            suspend_signal: None,
            restart_signal: None,
            suspend_kind: SuspendKind::default(),
            processors: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl CollectorConfig {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`StwError::InvalidSignal`] for unusable signal overrides.
    pub fn from_env() -> Result<Self, StwError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`StwError::InvalidSignal`] for unusable signal overrides.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StwError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("NPROCS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.processors = Some(n),
                _ => warn(format_args!("ignoring invalid NPROCS={raw}")),
            }
        }

        if let Some(raw) = lookup("MARKER_COUNT") {
            match raw.trim().parse::<usize>() {
                Ok(n) if (1..=MAX_MARKERS).contains(&n) => config.markers = Some(n),
                Ok(n) if n > MAX_MARKERS => {
                    warn(format_args!(
                        "MARKER_COUNT={n} exceeds the maximum; using {MAX_MARKERS}"
                    ));
                    config.markers = Some(MAX_MARKERS);
                }
                _ => warn(format_args!("ignoring invalid MARKER_COUNT={raw}")),
            }
        }

        if let Some(raw) = lookup("HANDLE_FORK") {
            match parse_bool(&raw) {
                Some(flag) => config.handle_fork = flag,
                None => warn(format_args!("ignoring invalid HANDLE_FORK={raw}")),
            }
        }

        config.suspend_signal = parse_signal(&lookup, "SUSPEND_SIGNAL")?;
        config.restart_signal = parse_signal(&lookup, "RESTART_SIGNAL")?;
        config.signals()?;
        Ok(config)
    }

    /// Set the requested number of markers.
    #[must_use]
    pub const fn with_markers(mut self, markers: usize) -> Self {
        self.markers = Some(markers);
        self
    }

    /// Enable or disable the fork hooks.
    #[must_use]
    pub const fn with_handle_fork(mut self, enabled: bool) -> Self {
        self.handle_fork = enabled;
        self
    }

    /// Override the suspend and restart signals.
    #[must_use]
    pub const fn with_signals(mut self, suspend: i32, restart: i32) -> Self {
        self.suspend_signal = Some(suspend);
        self.restart_signal = Some(restart);
        self
    }

    /// Choose the suspension mechanism.
    #[must_use]
    pub const fn with_suspend_kind(mut self, kind: SuspendKind) -> Self {
        self.suspend_kind = kind;
        self
    }

    /// Override the detected processor count.
    #[must_use]
    pub const fn with_processors(mut self, processors: usize) -> Self {
        self.processors = Some(processors);
        self
    }

    /// Set the suspend signal retry interval.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Processor count used for sizing decisions.
    #[must_use]
    pub fn processor_count(&self) -> usize {
        self.processors
            .unwrap_or_else(sys_thread::processor_count)
            .max(1)
    }

    /// Number of markers, the initiator included, in `1..=MAX_MARKERS`.
    ///
    /// An explicit marker count wins; otherwise one marker per processor.
    #[must_use]
    pub fn effective_markers(&self) -> usize {
        self.markers
            .unwrap_or_else(|| self.processor_count())
            .clamp(1, MAX_MARKERS)
    }

    /// Number of helper threads to spawn. Always 0 on a uniprocessor.
    #[must_use]
    pub fn helper_count(&self) -> usize {
        if self.processor_count() <= 1 {
            return 0;
        }
        self.effective_markers() - 1
    }

    /// Validated `(suspend, restart)` signal pair, defaults applied.
    ///
    /// # Errors
    ///
    /// Returns [`StwError::InvalidSignal`] for reserved or duplicated signals.
    #[cfg(unix)]
    pub fn signals(&self) -> Result<(i32, i32), StwError> {
        let suspend = self
            .suspend_signal
            .unwrap_or_else(sys_thread::default_suspend_signal);
        let restart = self
            .restart_signal
            .unwrap_or_else(sys_thread::default_restart_signal);

        if sys_thread::is_reserved_signal(suspend) {
            return Err(StwError::InvalidSignal {
                key: "SUSPEND_SIGNAL",
                value: suspend.to_string(),
            });
        }
        if sys_thread::is_reserved_signal(restart) || restart == suspend {
            return Err(StwError::InvalidSignal {
                key: "RESTART_SIGNAL",
                value: restart.to_string(),
            });
        }
        Ok((suspend, restart))
    }

    /// Signals are not used on this platform.
    ///
    /// # Errors
    ///
    /// Never fails.
    #[cfg(not(unix))]
    pub const fn signals(&self) -> Result<(i32, i32), StwError> {
        Ok((0, 0))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_signal<F>(lookup: &F, key: &'static str) -> Result<Option<i32>, StwError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|_| StwError::InvalidSignal { key, value: raw })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn markers_follow_processors_by_default() {
        let config = CollectorConfig::default().with_processors(4);
        assert_eq!(config.effective_markers(), 4);
        assert_eq!(config.helper_count(), 3);

        let config = CollectorConfig::default().with_processors(64);
        assert_eq!(config.effective_markers(), MAX_MARKERS);
    }

    #[test]
    fn uniprocessor_is_serial() {
        let config = CollectorConfig::default().with_processors(1);
        assert_eq!(config.helper_count(), 0);
        let config = config.with_markers(4);
        assert_eq!(config.effective_markers(), 4);
        assert_eq!(config.helper_count(), 0);
    }

    #[test]
    fn explicit_markers_win() {
        let config = CollectorConfig::default()
            .with_processors(8)
            .with_markers(2);
        assert_eq!(config.effective_markers(), 2);
        let config = CollectorConfig::default().with_markers(0);
        assert_eq!(config.effective_markers(), 1);
    }
}

//! Stop-the-world metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Statistics of one stop-the-world round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StwMetrics {
    /// Sequence number of the round, starting at 1.
    pub round: u64,
    /// Time from the first suspend request to the last acknowledged restart.
    pub pause: Duration,
    /// Threads that captured their context and parked.
    pub threads_stopped: usize,
    /// Threads found in a blocking region.
    pub blocked: usize,
    /// Threads that were exiting or gone.
    pub compensated: usize,
    /// Restart/re-suspend passes for threads inside a critical region.
    pub critical_region_retries: usize,
    /// Markers that took part in marking, 0 if the round did not mark.
    pub markers: usize,
}

impl StwMetrics {
    /// Threads that contributed roots, the initiator excluded.
    #[must_use]
    pub const fn threads_with_roots(&self) -> usize {
        self.threads_stopped + self.blocked
    }
}

/// Ring buffer size for round history.
const HISTORY_SIZE: usize = 64;

/// Cumulative statistics of one collector.
///
/// Counters are relaxed: they are informational and written only by the
/// thread holding the allocation lock.
#[derive(Debug)]
pub struct RoundStats {
    rounds: AtomicU64,
    pause_ns: AtomicU64,
    critical_region_retries: AtomicUsize,
    history: Mutex<History>,
}

#[derive(Debug)]
struct History {
    buffer: [StwMetrics; HISTORY_SIZE],
    next: usize,
    recorded: u64,
}

impl RoundStats {
    /// Create empty statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rounds: AtomicU64::new(0),
            pause_ns: AtomicU64::new(0),
            critical_region_retries: AtomicUsize::new(0),
            history: parking_lot::const_mutex(History {
                buffer: [StwMetrics {
                    round: 0,
                    pause: Duration::ZERO,
                    threads_stopped: 0,
                    blocked: 0,
                    compensated: 0,
                    critical_region_retries: 0,
                    markers: 0,
                }; HISTORY_SIZE],
                next: 0,
                recorded: 0,
            }),
        }
    }

    /// Record a finished round.
    #[allow(clippy::cast_possible_truncation)]
    pub fn record(&self, metrics: StwMetrics) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        self.pause_ns
            .fetch_add(metrics.pause.as_nanos() as u64, Ordering::Relaxed);
        self.critical_region_retries
            .fetch_add(metrics.critical_region_retries, Ordering::Relaxed);

        let mut history = self.history.lock();
        let slot = history.next;
        history.buffer[slot] = metrics;
        history.next = (slot + 1) % HISTORY_SIZE;
        history.recorded += 1;
    }

    /// Number of completed rounds.
    #[inline]
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Sum of all pauses.
    #[inline]
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    /// Sum of critical-region retry passes over all rounds.
    #[inline]
    #[must_use]
    pub fn total_critical_region_retries(&self) -> usize {
        self.critical_region_retries.load(Ordering::Relaxed)
    }

    /// The most recent round, if any.
    #[must_use]
    pub fn last(&self) -> Option<StwMetrics> {
        let history = self.history.lock();
        (history.recorded > 0)
            .then(|| history.buffer[(history.next + HISTORY_SIZE - 1) % HISTORY_SIZE])
    }

    /// Up to `HISTORY_SIZE` recent rounds, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<StwMetrics> {
        let history = self.history.lock();
        let kept = usize::try_from(history.recorded)
            .unwrap_or(HISTORY_SIZE)
            .min(HISTORY_SIZE);
        (0..kept)
            .map(|age| history.buffer[(history.next + HISTORY_SIZE - kept + age) % HISTORY_SIZE])
            .collect()
    }

    /// Longest pause among the recent rounds.
    #[must_use]
    pub fn max_recent_pause(&self) -> Duration {
        self.recent()
            .iter()
            .map(|metrics| metrics.pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RoundStats {
    fn default() -> Self {
        Self::new()
    }
}

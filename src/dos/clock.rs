//! Time sources.
//!
//! Window and blocking arithmetic runs on the monotonic [`Clock::now`];
//! audit timestamps use [`Clock::utc`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of time for the engine.
pub trait Clock: Send + Sync {
    /// Monotonic time used for rate windows and blocking periods.
    fn now(&self) -> Instant;

    /// Wall-clock time used for audit records.
    fn utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// System clock implementation using `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can hand one clone to the engine
/// and advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    start: Instant,
    start_utc: DateTime<Utc>,
    elapsed: Duration,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                start: Instant::now(),
                start_utc: Utc::now(),
                elapsed: Duration::ZERO,
            })),
        }
    }

    /// Move time forward.
    pub fn advance(&self, duration: Duration) {
        self.inner.lock().elapsed += duration;
    }

    /// Move time backward, never before the clock's creation.
    pub fn rewind(&self, duration: Duration) {
        let mut time = self.inner.lock();
        time.elapsed = time.elapsed.saturating_sub(duration);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let time = self.inner.lock();
        time.start + time.elapsed
    }

    fn utc(&self) -> DateTime<Utc> {
        let time = self.inner.lock();
        let elapsed = chrono::Duration::from_std(time.elapsed).unwrap_or(chrono::Duration::zero());
        time.start_utc + elapsed
    }
}

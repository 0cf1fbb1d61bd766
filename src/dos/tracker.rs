//! Concurrent per-key rate tracking.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::clock::Clock;
use super::threshold::Threshold;
use super::window::{Admission, RateWindow, WindowKey};

/// Point-in-time view of one tracked window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub rule_id: String,
    pub key: String,
    /// Requests counted in the trailing window
    pub current_rate: u32,
    /// Set while the key is blocked
    pub blocked_until: Option<Instant>,
    pub last_seen: Instant,
}

/// Tracks request windows for every (rule, key) pair seen.
///
/// The map is sharded and each window has its own lock, so requests for
/// different keys never contend on a global lock.
pub struct RateTracker {
    windows: DashMap<WindowKey, Arc<Mutex<RateWindow>>>,
    clock: Arc<dyn Clock>,
}

impl RateTracker {
    /// Create a tracker reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Run `f` on the window for `key` under its lock, creating the window if
    /// needed.
    ///
    /// Retries when the window it locked was evicted in the meantime, so no
    /// request is ever counted in a window that is no longer in the map.
    fn with_window<R>(
        &self,
        key: &WindowKey,
        threshold: &Threshold,
        mut f: impl FnMut(&mut RateWindow, Instant) -> R,
    ) -> R {
        loop {
            let window = match self.windows.get(key) {
                Some(window) => Arc::clone(window.value()),
                None => {
                    let entry = self.windows.entry(key.clone()).or_insert_with(|| {
                        debug!(
                            key = %key,
                            threshold = %threshold,
                            "Creating new rate window"
                        );
                        Arc::new(Mutex::new(RateWindow::new(
                            self.clock.now(),
                            threshold.window(),
                        )))
                    });
                    Arc::clone(entry.value())
                }
            };

            let mut guard = window.lock();
            if guard.is_evicted() {
                trace!(key = %key, "Window evicted while waiting, retrying");
                continue;
            }
            let now = self.clock.now();
            return f(&mut guard, now);
        }
    }

    /// Count one request for `key` and report whether its rate is now over
    /// `threshold`. Does not look at or change the blocked state.
    pub fn record_and_check(&self, key: &WindowKey, threshold: &Threshold) -> bool {
        self.with_window(key, threshold, |window, now| {
            let (breached, rate) = window.record_and_check(now, threshold);
            trace!(key = %key, rate = rate, breached = breached, "Recorded request");
            breached
        })
    }

    /// Admit one request for `key`, running the block state machine.
    pub fn admit(
        &self,
        key: &WindowKey,
        threshold: &Threshold,
        repeat_every: Option<Duration>,
    ) -> Admission {
        self.with_window(key, threshold, |window, now| {
            window.admit(now, threshold, repeat_every)
        })
    }

    /// Drop windows that are not blocked and have been idle for at least
    /// `grace`. Windows in use by a concurrent request are left alone.
    ///
    /// Returns the number of windows removed.
    pub fn evict_idle(&self, grace: Duration) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;

        self.windows.retain(|key, window| match window.try_lock() {
            Some(mut guard) if guard.is_idle(now, grace) => {
                guard.mark_evicted();
                evicted += 1;
                trace!(key = %key, "Evicting idle window");
                false
            }
            _ => true,
        });

        if evicted > 0 {
            debug!(
                evicted = evicted,
                remaining = self.windows.len(),
                "Evicted idle rate windows"
            );
        }
        evicted
    }

    /// Forget the window for `key`, lifting any block on it.
    pub fn release(&self, key: &WindowKey) -> bool {
        match self.windows.remove(key) {
            Some((_, window)) => {
                window.lock().mark_evicted();
                true
            }
            None => false,
        }
    }

    /// Forget every window tracked for `rule_id`.
    pub fn release_rule(&self, rule_id: &str) -> usize {
        let mut released = 0;
        self.windows.retain(|key, window| {
            if key.rule_id != rule_id {
                return true;
            }
            window.lock().mark_evicted();
            released += 1;
            false
        });
        released
    }

    /// Number of windows currently tracked.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// View a single window.
    pub fn snapshot(&self, key: &WindowKey) -> Option<WindowSnapshot> {
        let window = self.windows.get(key).map(|w| Arc::clone(w.value()))?;
        let now = self.clock.now();
        let mut guard = window.lock();
        Some(Self::describe(key, &mut guard, now))
    }

    /// View every window.
    pub fn snapshots(&self) -> Vec<WindowSnapshot> {
        let windows: Vec<_> = self
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let now = self.clock.now();
        windows
            .into_iter()
            .filter_map(|(key, window)| {
                let mut guard = window.lock();
                (!guard.is_evicted()).then(|| Self::describe(&key, &mut guard, now))
            })
            .collect()
    }

    fn describe(key: &WindowKey, window: &mut RateWindow, now: Instant) -> WindowSnapshot {
        WindowSnapshot {
            rule_id: key.rule_id.clone(),
            key: key.key.clone(),
            current_rate: window.current_rate(now),
            blocked_until: window.blocked_until(now),
            last_seen: window.last_seen(),
        }
    }
}

impl std::fmt::Debug for RateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateTracker")
            .field("windows", &self.windows.len())
            .finish()
    }
}

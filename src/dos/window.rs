//! Per-key rolling request windows.

use std::fmt;
use std::time::{Duration, Instant};

use super::threshold::Threshold;

/// Number of buckets a window is divided into.
pub const BUCKETS: usize = 10;

/// Upper bound on any single block, whatever the threshold says.
pub const MAX_BLOCKING_PERIOD: Duration = Duration::from_secs(365 * 24 * 3600);

/// Identifies a window: the rule that matched and the runtime key it matched.
///
/// The runtime key may differ from the rule key, e.g. an IP that matched a
/// CIDR rule gets its own window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The matching rule's identifier
    pub rule_id: String,
    /// The runtime key being tracked
    pub key: String,
}

impl WindowKey {
    pub fn new(rule_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.rule_id)
    }
}

/// Outcome of admitting one request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Counted and within the threshold
    Allowed {
        /// Requests in the window, this one included
        rate: u32,
    },
    /// Counted and over the threshold; the key is now blocked
    Breached {
        /// Requests in the window, this one included
        rate: u32,
        blocked_until: Instant,
    },
    /// The key was already blocked; the request was not counted
    StillBlocked {
        blocked_until: Instant,
        /// Rate observed when the block started
        rate: u32,
        /// Whether this repeat should be audited
        audit_due: bool,
    },
}

/// A fixed ring of counters covering the trailing threshold window, plus the
/// blocked-until marker.
#[derive(Debug)]
pub struct RateWindow {
    buckets: [u32; BUCKETS],
    /// Absolute bucket number held by `buckets[head % BUCKETS]`
    head: u64,
    span: Duration,
    epoch: Instant,
    blocked_until: Option<Instant>,
    blocked_rate: u32,
    last_block_audit: Option<Instant>,
    last_seen: Instant,
    evicted: bool,
}

impl RateWindow {
    /// Create an empty window spanning `span`.
    pub fn new(now: Instant, span: Duration) -> Self {
        Self {
            buckets: [0; BUCKETS],
            head: 0,
            span: span.max(Duration::from_millis(BUCKETS as u64)),
            epoch: now,
            blocked_until: None,
            blocked_rate: 0,
            last_block_audit: None,
            last_seen: now,
            evicted: false,
        }
    }

    fn bucket_number(&self, now: Instant) -> u64 {
        let width = self.span.as_nanos() / BUCKETS as u128;
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        (elapsed / width).min(u64::MAX as u128) as u64
    }

    /// Move the ring forward to `now`, clearing buckets that fell out of the
    /// window. A clock going backwards leaves the ring where it is.
    fn rotate(&mut self, now: Instant) {
        let current = self.bucket_number(now);
        if current <= self.head {
            return;
        }
        let gap = current - self.head;
        if gap >= BUCKETS as u64 {
            self.buckets = [0; BUCKETS];
        } else {
            for step in 1..=gap {
                self.buckets[((self.head + step) % BUCKETS as u64) as usize] = 0;
            }
        }
        self.head = current;
    }

    fn reset(&mut self, now: Instant, span: Duration) {
        self.buckets = [0; BUCKETS];
        self.span = span.max(Duration::from_millis(BUCKETS as u64));
        self.epoch = now;
        self.head = 0;
    }

    /// Requests counted in the trailing window.
    pub fn current_rate(&mut self, now: Instant) -> u32 {
        self.rotate(now);
        self.sum()
    }

    fn sum(&self) -> u32 {
        self.buckets.iter().fold(0u32, |acc, b| acc.saturating_add(*b))
    }

    /// Count one request and report whether the window is now over the
    /// threshold's rate, together with the rate including this request.
    ///
    /// A rate of `n` admits `n` requests per window; the `n + 1`th breaches.
    pub fn record_and_check(&mut self, now: Instant, threshold: &Threshold) -> (bool, u32) {
        if self.span != threshold.window() {
            self.reset(now, threshold.window());
        }
        self.rotate(now);
        let slot = (self.head % BUCKETS as u64) as usize;
        self.buckets[slot] = self.buckets[slot].saturating_add(1);
        self.last_seen = self.last_seen.max(now);

        let rate = self.sum();
        (rate > threshold.request_rate(), rate)
    }

    /// Run the blocking state machine for one request.
    ///
    /// While blocked, requests are not counted. Once the block has expired
    /// the window starts over from zero. A repeat is due for audit when
    /// `repeat_every` has passed since the last audit of this block, or on
    /// every repeat when it is `None`.
    pub fn admit(
        &mut self,
        now: Instant,
        threshold: &Threshold,
        repeat_every: Option<Duration>,
    ) -> Admission {
        self.last_seen = self.last_seen.max(now);

        if let Some(blocked_until) = self.blocked_until {
            if now < blocked_until {
                let audit_due = match (repeat_every, self.last_block_audit) {
                    (Some(every), Some(at)) => now.saturating_duration_since(at) >= every,
                    _ => true,
                };
                if audit_due {
                    self.last_block_audit = Some(now);
                }
                return Admission::StillBlocked {
                    blocked_until,
                    rate: self.blocked_rate,
                    audit_due,
                };
            }
            self.unblock(now);
        }

        let (breached, rate) = self.record_and_check(now, threshold);
        if !breached {
            return Admission::Allowed { rate };
        }

        let period = threshold.blocking_period().min(MAX_BLOCKING_PERIOD);
        let blocked_until = now.checked_add(period).unwrap_or(now);
        self.blocked_until = Some(blocked_until);
        self.blocked_rate = rate;
        self.last_block_audit = Some(now);
        Admission::Breached {
            rate,
            blocked_until,
        }
    }

    fn unblock(&mut self, now: Instant) {
        self.blocked_until = None;
        self.blocked_rate = 0;
        self.last_block_audit = None;
        self.reset(now, self.span);
    }

    /// The end of the current block, if the key is blocked at `now`.
    pub fn blocked_until(&self, now: Instant) -> Option<Instant> {
        self.blocked_until.filter(|until| now < *until)
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Whether the window may be dropped: not blocked, and untouched for at
    /// least `grace`.
    pub fn is_idle(&self, now: Instant, grace: Duration) -> bool {
        self.blocked_until(now).is_none() && now.saturating_duration_since(self.last_seen) >= grace
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted
    }
}

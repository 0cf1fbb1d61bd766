//! The admission engine.
//!
//! [`DosEngine::evaluate`] is the request path: find the rule for a key, run
//! the key's window through the block state machine, and hand an audit
//! record to the executor. Everything else on the engine is administration.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::audit::{AuditReason, AuditRecord, Decision};
use super::clock::{Clock, SystemClock};
use super::registry::RuleRegistry;
use super::rule::{canonical_key, normalize_key, parse_ip, Action, Rule, RuleType};
use super::threshold::{self, Threshold};
use super::tracker::{RateTracker, WindowSnapshot};
use super::window::{Admission, WindowKey};
use crate::config::DosConfig;
use crate::error::{DosError, ErrorReporter, LogReporter, Result};
use crate::executor::{InlineExecutor, Task, TaskExecutor};
use crate::store::{AuditSink, MemoryStore, RuleStore};

/// Admission control over a set of rules.
///
/// The engine is shared across request handlers behind an `Arc`; all methods
/// take `&self`.
pub struct DosEngine {
    config: DosConfig,
    registry: RuleRegistry,
    tracker: RateTracker,
    clock: Arc<dyn Clock>,
    rule_store: Arc<dyn RuleStore>,
    audit_sink: Arc<dyn AuditSink>,
    executor: Arc<dyn TaskExecutor>,
    reporter: Arc<dyn ErrorReporter>,
    /// Serializes rule changes so the store and the registry agree
    admin: Mutex<()>,
    last_reload: Mutex<Instant>,
}

/// Collaborators for a [`DosEngine`]. Anything left unset gets an in-memory
/// or inline default.
pub struct EngineBuilder {
    config: DosConfig,
    clock: Option<Arc<dyn Clock>>,
    rule_store: Option<Arc<dyn RuleStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn rule_store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.rule_store = Some(store);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Load the stored rules and start the engine.
    ///
    /// Fails if the rule store cannot be read.
    pub fn start(self) -> Result<DosEngine> {
        self.config.validate()?;

        let memory = Arc::new(MemoryStore::new());
        let rule_store = self
            .rule_store
            .unwrap_or_else(|| Arc::clone(&memory) as Arc<dyn RuleStore>);
        let audit_sink = self
            .audit_sink
            .unwrap_or_else(|| memory as Arc<dyn AuditSink>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let registry = RuleRegistry::with_rules(rule_store.load_rules()?)?;
        info!(
            rules = registry.len(),
            enabled = self.config.enabled,
            track_localhost = self.config.track_localhost,
            "DoS engine started"
        );

        Ok(DosEngine {
            tracker: RateTracker::new(Arc::clone(&clock)),
            last_reload: Mutex::new(clock.now()),
            admin: Mutex::new(()),
            config: self.config,
            registry,
            clock,
            rule_store,
            audit_sink,
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(InlineExecutor) as Arc<dyn TaskExecutor>),
            reporter: self
                .reporter
                .unwrap_or_else(|| Arc::new(LogReporter) as Arc<dyn ErrorReporter>),
        })
    }
}

impl DosEngine {
    pub fn builder(config: DosConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            rule_store: None,
            audit_sink: None,
            executor: None,
            reporter: None,
        }
    }

    /// Start an engine with in-memory storage and inline auditing.
    pub fn start(config: DosConfig) -> Result<Self> {
        Self::builder(config).start()
    }

    /// Decide whether a request for `key` is admitted.
    pub fn evaluate(&self, key: &str) -> Decision {
        if !self.config.enabled {
            return Decision::Allow;
        }

        let key = canonical_key(key);
        if !self.config.track_localhost && is_loopback(&key) {
            trace!(key = %key, "Loopback key, not tracked");
            return Decision::Allow;
        }

        let Some(rule) = self.registry.find_rule(&key) else {
            trace!(key = %key, "No rule matches key");
            return Decision::Allow;
        };

        match rule.action() {
            Action::Allow => {
                debug!(key = %key, rule = %rule, "Key allowed by rule");
                return Decision::Allow;
            }
            Action::Deny => {
                debug!(key = %key, rule = %rule, "Key denied by rule");
                return Decision::Block;
            }
            Action::Auto => {}
        }

        let window_key = WindowKey::new(rule.id(), key.as_str());
        let admission = self.tracker.admit(
            &window_key,
            rule.threshold(),
            self.config.audit.repeat_interval(),
        );

        match admission {
            Admission::Allowed { rate } => {
                trace!(key = %key, rule = %rule, rate = rate, "Request allowed");
                if self.config.audit.audit_allowed {
                    self.audit(
                        AuditRecord::new(&rule, &key, Decision::Allow, self.clock.utc())
                            .with_observed_rate(rate),
                    );
                }
                Decision::Allow
            }
            Admission::Breached {
                rate,
                blocked_until,
            } => {
                info!(
                    key = %key,
                    rule = %rule,
                    rate = rate,
                    threshold = %rule.threshold(),
                    "Threshold exceeded, blocking key"
                );
                self.audit(
                    AuditRecord::new(&rule, &key, Decision::Block, self.clock.utc())
                        .with_reason(AuditReason::ThresholdExceeded)
                        .with_observed_rate(rate)
                        .with_blocked_until(self.to_utc(blocked_until)),
                );
                Decision::Block
            }
            Admission::StillBlocked {
                blocked_until,
                rate,
                audit_due,
            } => {
                debug!(key = %key, rule = %rule, "Key is blocked");
                if audit_due {
                    self.audit(
                        AuditRecord::new(&rule, &key, Decision::Block, self.clock.utc())
                            .with_reason(AuditReason::StillBlocked)
                            .with_observed_rate(rate)
                            .with_blocked_until(self.to_utc(blocked_until)),
                    );
                }
                Decision::Block
            }
        }
    }

    /// Hand an audit record to the executor. Failures are reported, never
    /// returned.
    fn audit(&self, record: AuditRecord) {
        let sink = Arc::clone(&self.audit_sink);
        let reporter = Arc::clone(&self.reporter);
        let task: Task = Box::new(move || {
            if let Err(e) = sink.append_audit(&record) {
                reporter.report(&DosError::Persistence(e));
            }
        });

        if let Err(e) = self.executor.submit(task) {
            warn!(error = %e, "Dropped audit record");
            self.reporter.report(&DosError::Submit(e));
        }
    }

    fn to_utc(&self, instant: Instant) -> DateTime<Utc> {
        let remaining = instant.saturating_duration_since(self.clock.now());
        let remaining =
            chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.utc() + remaining
    }

    /// Persist a rule, then make it visible to lookups.
    ///
    /// If the store fails, the registry is left unchanged. When the rule
    /// replaces one with a different threshold or action, the windows tracked
    /// under the old rule are dropped. Returns the replaced rule, if any.
    pub fn register_rule(&self, rule: Rule) -> Result<Option<Arc<Rule>>> {
        if rule.key().trim().is_empty() {
            return Err(DosError::InvalidRule("rule key must not be empty".to_string()));
        }
        let _admin = self.admin.lock();
        self.rule_store.save_rule(&rule)?;

        let id = rule.id().to_string();
        let threshold = *rule.threshold();
        let action = rule.action();
        let replaced = self.registry.register(rule)?;

        if let Some(previous) = &replaced {
            if *previous.threshold() != threshold || previous.action() != action {
                let released = self.tracker.release_rule(&id);
                debug!(rule = %id, released = released, "Reset windows of replaced rule");
            }
        }
        info!(rule = %id, threshold = %threshold, replaced = replaced.is_some(), "Rule registered");
        Ok(replaced)
    }

    /// Delete a rule from the store and the registry, and forget its windows.
    ///
    /// A key that cannot name a rule of `rule_type` matches nothing, so
    /// removing it is a no-op.
    pub fn remove_rule(&self, rule_type: RuleType, key: &str) -> Result<Option<Arc<Rule>>> {
        let key = match normalize_key(rule_type, key) {
            Ok(key) => key,
            Err(e) => {
                debug!(rule_type = %rule_type, key = %key, error = %e, "No such rule to remove");
                return Ok(None);
            }
        };
        let _admin = self.admin.lock();
        self.rule_store.delete_rule(rule_type, &key)?;

        let removed = self.registry.remove(rule_type, &key);
        if let Some(rule) = &removed {
            self.tracker.release_rule(rule.id());
            info!(rule = %rule, "Rule removed");
        }
        Ok(removed)
    }

    /// The rule that applies to a runtime key, if any.
    pub fn find_rule(&self, key: &str) -> Option<Arc<Rule>> {
        self.registry.find_rule(key)
    }

    /// A rule by type and key, enabled or not.
    pub fn get_rule(&self, rule_type: RuleType, key: &str) -> Option<Arc<Rule>> {
        self.registry.get(rule_type, key)
    }

    /// All rules in registration order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.registry.rules()
    }

    /// Replace the registered rules with the store's contents.
    ///
    /// On failure the current rules stay in place. Returns the number of
    /// rules now registered.
    pub fn reload(&self) -> Result<usize> {
        let _admin = self.admin.lock();
        let rules = self.rule_store.load_rules()?;
        self.registry.replace_all(rules)?;
        let count = self.registry.len();
        info!(rules = count, "Rules reloaded");
        Ok(count)
    }

    /// Drop windows idle for longer than the configured grace period.
    pub fn evict_idle(&self) -> usize {
        self.tracker.evict_idle(self.config.inactivity_grace())
    }

    /// Number of windows currently held in memory.
    pub fn tracked_windows(&self) -> usize {
        self.tracker.len()
    }

    pub fn window_snapshots(&self) -> Vec<WindowSnapshot> {
        self.tracker.snapshots()
    }

    /// Lift the block on one key under one rule.
    pub fn release(&self, rule: &Rule, key: &str) -> bool {
        let window_key = WindowKey::new(rule.id(), canonical_key(key));
        self.tracker.release(&window_key)
    }

    /// Parse a threshold expression such as `"2 r/s, 5m"`.
    pub fn parse_threshold(expression: &str) -> Result<Threshold> {
        Ok(threshold::parse_threshold(expression)?)
    }

    pub fn config(&self) -> &DosConfig {
        &self.config
    }

    /// One maintenance pass: evict idle windows, and reload the rules when
    /// the reload interval has passed since the last attempt.
    ///
    /// A failed reload is reported and the current rules stay in force.
    /// Returns the number of windows evicted.
    pub fn run_maintenance(&self) -> usize {
        let evicted = self.evict_idle();

        if let Some(every) = self.config.reload_interval() {
            let now = self.clock.now();
            let due = {
                let mut last = self.last_reload.lock();
                let due = now.saturating_duration_since(*last) >= every;
                if due {
                    *last = now;
                }
                due
            };
            if due {
                if let Err(e) = self.reload() {
                    warn!(error = %e, "Rule reload failed, keeping current rules");
                    self.reporter.report(&e);
                }
            }
        }
        evicted
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `interval` until
    /// the task is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = engine.run_maintenance();
                debug!(
                    evicted = evicted,
                    tracked = engine.tracked_windows(),
                    "Maintenance pass complete"
                );
            }
        })
    }
}

impl std::fmt::Debug for DosEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DosEngine")
            .field("config", &self.config)
            .field("rules", &self.registry.len())
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// Loopback addresses, including IPv4 loopback mapped into IPv6.
fn is_loopback(key: &str) -> bool {
    parse_ip(key).map_or(false, |ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dos::clock::ManualClock;
    use crate::error::{PersistenceError, SubmitError};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        engine: DosEngine,
        clock: ManualClock,
        store: Arc<MemoryStore>,
        reporter: Arc<RecordingReporter>,
    }

    #[derive(Default)]
    struct RecordingReporter {
        errors: Mutex<Vec<String>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, error: &DosError) {
            self.errors.lock().push(error.to_string());
        }
    }

    /// A store whose writes always fail.
    struct BrokenStore;

    impl RuleStore for BrokenStore {
        fn load_rules(&self) -> std::result::Result<Vec<Rule>, PersistenceError> {
            Ok(Vec::new())
        }

        fn save_rule(&self, _rule: &Rule) -> std::result::Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("disk full".to_string()))
        }

        fn delete_rule(
            &self,
            _rule_type: RuleType,
            _key: &str,
        ) -> std::result::Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("disk full".to_string()))
        }
    }

    impl AuditSink for BrokenStore {
        fn append_audit(&self, _record: &AuditRecord) -> std::result::Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("disk full".to_string()))
        }
    }

    struct SaturatedExecutor;

    impl TaskExecutor for SaturatedExecutor {
        fn submit(&self, _task: Task) -> std::result::Result<(), SubmitError> {
            Err(SubmitError::Saturated)
        }
    }

    fn harness_with(config: DosConfig) -> Harness {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let engine = DosEngine::builder(config)
            .clock(Arc::new(clock.clone()))
            .rule_store(store.clone())
            .audit_sink(store.clone())
            .reporter(reporter.clone())
            .start()
            .unwrap();
        Harness {
            engine,
            clock,
            store,
            reporter,
        }
    }

    fn harness() -> Harness {
        harness_with(DosConfig::default())
    }

    fn ip_rule(key: &str, threshold: &str) -> Rule {
        Rule::builder(RuleType::Ip, key)
            .threshold(threshold::parse_threshold(threshold).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_key_is_allowed_without_tracking() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();

        for _ in 0..100 {
            assert_eq!(h.engine.evaluate("5.6.7.8"), Decision::Allow);
        }
        assert_eq!(h.engine.tracked_windows(), 0);
        assert!(h.store.audit_records().is_empty());
    }

    #[test]
    fn test_register_then_find_round_trip() {
        let h = harness();
        let rule = ip_rule("1.2.3.4", "2 r/s, 5m");
        h.engine.register_rule(rule.clone()).unwrap();

        assert_eq!(*h.engine.find_rule("1.2.3.4").unwrap(), rule);
        assert_eq!(h.store.load_rules().unwrap(), vec![rule]);
    }

    #[test]
    fn test_reregistering_replaces_rule() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 5m")).unwrap();
        let replaced = h
            .engine
            .register_rule(ip_rule("1.2.3.4", "3 r/s, 5m"))
            .unwrap();

        assert_eq!(replaced.unwrap().threshold().request_rate(), 1);
        assert_eq!(h.engine.rules().len(), 1);
        for _ in 0..3 {
            assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
        }
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Block);
    }

    #[test]
    fn test_allow_allow_block() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "2 r/s, 5m")).unwrap();

        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Block);

        let records = h.store.audit_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, Decision::Block);
        assert_eq!(records[0].reason, Some(AuditReason::ThresholdExceeded));
        assert_eq!(records[0].observed_rate, Some(3));
        assert_eq!(records[0].rule_id, "ip:1.2.3.4");
        assert_eq!(
            records[0].blocked_until,
            Some(records[0].timestamp + chrono::Duration::minutes(5))
        );
    }

    #[test]
    fn test_blocked_requests_are_not_counted() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "2 r/s, 5m")).unwrap();
        for _ in 0..3 {
            h.engine.evaluate("1.2.3.4");
        }

        for _ in 0..20 {
            h.clock.advance(Duration::from_millis(10));
            assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Block);
        }

        let snapshots = h.engine.window_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].current_rate, 3);
        assert!(snapshots[0].blocked_until.is_some());
    }

    #[test]
    fn test_block_lifts_after_blocking_period() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "2 r/s, 5m")).unwrap();
        for _ in 0..3 {
            h.engine.evaluate("1.2.3.4");
        }

        h.clock.advance(Duration::from_secs(299));
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Block);

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Block);
    }

    #[test]
    fn test_still_blocked_audit_is_throttled() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();
        h.engine.evaluate("1.2.3.4");
        h.engine.evaluate("1.2.3.4");

        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(1));
            h.engine.evaluate("1.2.3.4");
        }
        assert_eq!(h.store.audit_records().len(), 1);
    }

    #[test]
    fn test_unthrottled_audit_records_every_block() {
        let mut config = DosConfig::default();
        config.audit.throttle_repeats = false;
        config.audit.audit_allowed = true;
        let h = harness_with(config);
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();

        for _ in 0..4 {
            h.engine.evaluate("1.2.3.4");
        }

        let reasons: Vec<_> = h.store.audit_records().iter().map(|r| r.reason).collect();
        assert_eq!(
            reasons,
            vec![
                None,
                Some(AuditReason::ThresholdExceeded),
                Some(AuditReason::StillBlocked),
                Some(AuditReason::StillBlocked),
            ]
        );
    }

    #[test]
    fn test_cidr_rule_tracks_each_address() {
        let h = harness();
        let rule = Rule::builder(RuleType::Cidr, "10.0.0.0/8")
            .threshold(threshold::parse_threshold("1 r/s, 1m").unwrap())
            .build()
            .unwrap();
        h.engine.register_rule(rule).unwrap();

        assert_eq!(h.engine.evaluate("10.0.0.1"), Decision::Allow);
        assert_eq!(h.engine.evaluate("10.0.0.2"), Decision::Allow);
        assert_eq!(h.engine.evaluate("10.0.0.1"), Decision::Block);
        assert_eq!(h.engine.evaluate("10.0.0.2"), Decision::Block);
        assert_eq!(h.engine.tracked_windows(), 2);
    }

    #[test]
    fn test_allow_and_deny_actions_are_untracked() {
        let h = harness();
        let trusted = Rule::builder(RuleType::Ip, "1.1.1.1")
            .action(Action::Allow)
            .build()
            .unwrap();
        let banned = Rule::builder(RuleType::Token, "stolen-key")
            .action(Action::Deny)
            .build()
            .unwrap();
        h.engine.register_rule(trusted).unwrap();
        h.engine.register_rule(banned).unwrap();

        for _ in 0..10 {
            assert_eq!(h.engine.evaluate("1.1.1.1"), Decision::Allow);
            assert_eq!(h.engine.evaluate("stolen-key"), Decision::Block);
        }
        assert_eq!(h.engine.tracked_windows(), 0);
        assert!(h.store.audit_records().is_empty());
    }

    #[test]
    fn test_localhost_is_not_tracked_by_default() {
        let h = harness();
        h.engine
            .register_rule(
                Rule::builder(RuleType::Cidr, "0.0.0.0/0")
                    .threshold(threshold::parse_threshold("1 r/s, 1m").unwrap())
                    .build()
                    .unwrap(),
            )
            .unwrap();

        for _ in 0..5 {
            assert_eq!(h.engine.evaluate("127.0.0.1"), Decision::Allow);
        }
        assert_eq!(h.engine.tracked_windows(), 0);

        let mut config = DosConfig::default();
        config.track_localhost = true;
        let tracking = harness_with(config);
        tracking
            .engine
            .register_rule(ip_rule("127.0.0.1", "1 r/s, 1m"))
            .unwrap();
        tracking.engine.evaluate("127.0.0.1");
        assert_eq!(tracking.engine.evaluate("127.0.0.1"), Decision::Block);
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("127.10.0.1"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("::ffff:127.0.0.1"));
        assert!(!is_loopback("10.0.0.1"));
        assert!(!is_loopback("localhost"));
    }

    #[test]
    fn test_disabled_engine_allows_everything() {
        let mut config = DosConfig::default();
        config.enabled = false;
        let h = harness_with(config);
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();

        for _ in 0..5 {
            assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
        }
        assert_eq!(h.engine.tracked_windows(), 0);
    }

    #[test]
    fn test_concurrent_evaluations_do_not_lose_increments() {
        let h = harness();
        h.engine
            .register_rule(ip_rule("9.9.9.9", "500 r/h, 1h"))
            .unwrap();
        let engine = Arc::new(h.engine);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| engine.evaluate("9.9.9.9").is_allowed())
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // Exactly the threshold is admitted, however the calls interleave
        assert_eq!(allowed, 500);
        assert_eq!(h.store.audit_records().len(), 1);
    }

    #[test]
    fn test_idle_windows_are_evicted() {
        let mut config = DosConfig::default();
        config.inactivity_grace_secs = 60;
        let h = harness_with(config);
        h.engine.register_rule(ip_rule("1.2.3.4", "5 r/s, 1m")).unwrap();
        h.engine
            .register_rule(ip_rule("5.6.7.8", "5 r/s, 1m"))
            .unwrap();

        h.engine.evaluate("1.2.3.4");
        h.clock.advance(Duration::from_secs(30));
        h.engine.evaluate("5.6.7.8");
        assert_eq!(h.engine.tracked_windows(), 2);

        h.clock.advance(Duration::from_secs(30));
        assert_eq!(h.engine.evict_idle(), 1);
        let remaining: Vec<_> = h
            .engine
            .window_snapshots()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(remaining, vec!["5.6.7.8".to_string()]);

        h.clock.advance(Duration::from_secs(60));
        assert_eq!(h.engine.evict_idle(), 1);
        assert_eq!(h.engine.tracked_windows(), 0);
        assert!(h.engine.window_snapshots().is_empty());
    }

    #[test]
    fn test_store_failure_leaves_registry_unchanged() {
        let engine = DosEngine::builder(DosConfig::default())
            .rule_store(Arc::new(BrokenStore))
            .start()
            .unwrap();

        let err = engine
            .register_rule(ip_rule("1.2.3.4", "1 r/s, 1m"))
            .unwrap_err();
        assert!(matches!(err, DosError::Persistence(_)));
        assert!(engine.find_rule("1.2.3.4").is_none());
        assert!(engine.rules().is_empty());
    }

    #[test]
    fn test_audit_failures_do_not_change_decisions() {
        let reporter = Arc::new(RecordingReporter::default());
        let engine = DosEngine::builder(DosConfig::default())
            .audit_sink(Arc::new(BrokenStore))
            .reporter(reporter.clone())
            .start()
            .unwrap();
        engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();

        assert_eq!(engine.evaluate("1.2.3.4"), Decision::Allow);
        assert_eq!(engine.evaluate("1.2.3.4"), Decision::Block);
        assert_eq!(reporter.errors.lock().len(), 1);
    }

    #[test]
    fn test_saturated_executor_drops_audits() {
        let h = harness();
        let engine = DosEngine::builder(DosConfig::default())
            .executor(Arc::new(SaturatedExecutor))
            .audit_sink(h.store.clone())
            .reporter(h.reporter.clone())
            .start()
            .unwrap();
        engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();

        engine.evaluate("1.2.3.4");
        assert_eq!(engine.evaluate("1.2.3.4"), Decision::Block);
        assert!(h.store.audit_records().is_empty());
        assert_eq!(
            h.reporter.errors.lock().clone(),
            vec!["submit error: task queue is full".to_string()]
        );
    }

    #[test]
    fn test_start_loads_rules_and_fails_fast() {
        let store = Arc::new(MemoryStore::with_rules(vec![ip_rule("1.2.3.4", "1 r/s, 1m")]));
        let engine = DosEngine::builder(DosConfig::default())
            .rule_store(store)
            .start()
            .unwrap();
        assert!(engine.find_rule("1.2.3.4").is_some());

        struct Unreadable;
        impl RuleStore for Unreadable {
            fn load_rules(&self) -> std::result::Result<Vec<Rule>, PersistenceError> {
                Err(PersistenceError::Unavailable("offline".to_string()))
            }
            fn save_rule(&self, _rule: &Rule) -> std::result::Result<(), PersistenceError> {
                Ok(())
            }
            fn delete_rule(
                &self,
                _rule_type: RuleType,
                _key: &str,
            ) -> std::result::Result<(), PersistenceError> {
                Ok(())
            }
        }
        let result = DosEngine::builder(DosConfig::default())
            .rule_store(Arc::new(Unreadable))
            .start();
        assert!(matches!(result, Err(DosError::Persistence(_))));
    }

    #[test]
    fn test_remove_rule_forgets_windows() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();
        h.engine.evaluate("1.2.3.4");
        h.engine.evaluate("1.2.3.4");
        assert_eq!(h.engine.tracked_windows(), 1);

        let removed = h.engine.remove_rule(RuleType::Ip, "1.2.3.4").unwrap();
        assert!(removed.is_some());
        assert_eq!(h.engine.tracked_windows(), 0);
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
        assert!(h.store.load_rules().unwrap().is_empty());

        assert!(h.engine.remove_rule(RuleType::Ip, "1.2.3.4").unwrap().is_none());
        assert!(h.engine.remove_rule(RuleType::Ip, "not-an-ip").unwrap().is_none());
        assert!(h.engine.remove_rule(RuleType::Path, "").unwrap().is_none());
    }

    #[test]
    fn test_reload_picks_up_store_changes() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")).unwrap();
        h.store.save_rule(&ip_rule("5.6.7.8", "1 r/s, 1m")).unwrap();
        assert!(h.engine.find_rule("5.6.7.8").is_none());

        assert_eq!(h.engine.reload().unwrap(), 2);
        assert!(h.engine.find_rule("5.6.7.8").is_some());
    }

    #[test]
    fn test_release_lifts_block() {
        let h = harness();
        let rule = ip_rule("1.2.3.4", "1 r/s, 1h");
        h.engine.register_rule(rule.clone()).unwrap();
        h.engine.evaluate("1.2.3.4");
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Block);

        assert!(h.engine.release(&rule, "1.2.3.4"));
        assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Allow);
    }

    #[test]
    fn test_parse_threshold() {
        let threshold = DosEngine::parse_threshold("10 r/s, 1h").unwrap();
        assert_eq!(threshold.request_rate(), 10);
        assert!(matches!(
            DosEngine::parse_threshold("bad"),
            Err(DosError::Parse(_))
        ));
    }

    #[test]
    fn test_v4_mapped_key_matches_ipv4_rules() {
        let h = harness();
        h.engine.register_rule(ip_rule("10.0.0.1", "1 r/s, 1h")).unwrap();
        h.engine
            .register_rule(
                Rule::builder(RuleType::Cidr, "192.168.0.0/16")
                    .threshold(threshold::parse_threshold("1 r/s, 1h").unwrap())
                    .build()
                    .unwrap(),
            )
            .unwrap();

        assert_eq!(h.engine.find_rule("::ffff:10.0.0.1").unwrap().id(), "ip:10.0.0.1");
        assert_eq!(h.engine.evaluate("10.0.0.1"), Decision::Allow);
        assert_eq!(h.engine.evaluate("::ffff:10.0.0.1"), Decision::Block);

        assert_eq!(h.engine.evaluate("::ffff:192.168.1.1"), Decision::Allow);
        assert_eq!(h.engine.evaluate("::ffff:192.168.1.1"), Decision::Block);
        assert_eq!(h.engine.evaluate("192.168.1.1"), Decision::Block);

        // Both spellings share one window per address
        assert_eq!(h.engine.tracked_windows(), 2);
    }

    /// A store whose first write stalls, widening any gap between the store
    /// write and the registry update.
    struct StallingStore {
        inner: MemoryStore,
        stalled: AtomicBool,
    }

    impl RuleStore for StallingStore {
        fn load_rules(&self) -> std::result::Result<Vec<Rule>, PersistenceError> {
            self.inner.load_rules()
        }

        fn save_rule(&self, rule: &Rule) -> std::result::Result<(), PersistenceError> {
            let result = self.inner.save_rule(rule);
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            result
        }

        fn delete_rule(
            &self,
            rule_type: RuleType,
            key: &str,
        ) -> std::result::Result<(), PersistenceError> {
            self.inner.delete_rule(rule_type, key)
        }
    }

    #[test]
    fn test_concurrent_registrations_keep_store_and_registry_in_step() {
        let store = Arc::new(StallingStore {
            inner: MemoryStore::new(),
            stalled: AtomicBool::new(false),
        });
        let engine = Arc::new(
            DosEngine::builder(DosConfig::default())
                .rule_store(store.clone())
                .start()
                .unwrap(),
        );

        let first = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 1m")))
        };
        std::thread::sleep(Duration::from_millis(50));
        let second = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.register_rule(ip_rule("1.2.3.4", "9 r/s, 1m")))
        };
        first.join().unwrap().unwrap();
        second.join().unwrap().unwrap();

        let stored = store.load_rules().unwrap();
        assert_eq!(stored.len(), 1);
        let live = engine.get_rule(RuleType::Ip, "1.2.3.4").unwrap();
        assert_eq!(*live, stored[0]);
        assert_eq!(live.threshold().request_rate(), 9);
    }

    #[test]
    fn test_still_blocked_audits_repeat_every_interval() {
        let h = harness();
        h.engine.register_rule(ip_rule("1.2.3.4", "1 r/s, 10m")).unwrap();
        h.engine.evaluate("1.2.3.4");
        h.engine.evaluate("1.2.3.4");

        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(30));
            assert_eq!(h.engine.evaluate("1.2.3.4"), Decision::Block);
        }

        let reasons: Vec<_> = h.store.audit_records().iter().map(|r| r.reason).collect();
        assert_eq!(reasons.len(), 6);
        assert_eq!(reasons[0], Some(AuditReason::ThresholdExceeded));
        assert!(reasons[1..]
            .iter()
            .all(|r| *r == Some(AuditReason::StillBlocked)));
    }

    /// A memory store whose reads can be switched off.
    struct FlakyStore {
        inner: MemoryStore,
        offline: AtomicBool,
    }

    impl RuleStore for FlakyStore {
        fn load_rules(&self) -> std::result::Result<Vec<Rule>, PersistenceError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("offline".to_string()));
            }
            self.inner.load_rules()
        }

        fn save_rule(&self, rule: &Rule) -> std::result::Result<(), PersistenceError> {
            self.inner.save_rule(rule)
        }

        fn delete_rule(
            &self,
            rule_type: RuleType,
            key: &str,
        ) -> std::result::Result<(), PersistenceError> {
            self.inner.delete_rule(rule_type, key)
        }
    }

    #[test]
    fn test_maintenance_reloads_rules_when_due() {
        let h = harness();
        h.store.save_rule(&ip_rule("5.6.7.8", "1 r/s, 1m")).unwrap();

        h.clock.advance(Duration::from_secs(899));
        h.engine.run_maintenance();
        assert!(h.engine.find_rule("5.6.7.8").is_none());

        h.clock.advance(Duration::from_secs(1));
        h.engine.run_maintenance();
        assert!(h.engine.find_rule("5.6.7.8").is_some());

        // The next reload is a full interval away
        h.store.save_rule(&ip_rule("9.9.9.9", "1 r/s, 1m")).unwrap();
        h.clock.advance(Duration::from_secs(600));
        h.engine.run_maintenance();
        assert!(h.engine.find_rule("9.9.9.9").is_none());
        h.clock.advance(Duration::from_secs(300));
        h.engine.run_maintenance();
        assert!(h.engine.find_rule("9.9.9.9").is_some());
    }

    #[test]
    fn test_failed_reload_keeps_rules_and_reports() {
        let clock = ManualClock::new();
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::with_rules(vec![ip_rule("1.2.3.4", "1 r/s, 1m")]),
            offline: AtomicBool::new(false),
        });
        let reporter = Arc::new(RecordingReporter::default());
        let engine = DosEngine::builder(DosConfig::default())
            .clock(Arc::new(clock.clone()))
            .rule_store(store.clone())
            .reporter(reporter.clone())
            .start()
            .unwrap();

        store.offline.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(900));
        engine.run_maintenance();

        assert!(engine.find_rule("1.2.3.4").is_some());
        assert_eq!(
            reporter.errors.lock().clone(),
            vec!["persistence error: store unavailable: offline".to_string()]
        );
    }

    #[test]
    fn test_periodic_reload_can_be_turned_off() {
        let mut config = DosConfig::default();
        config.reload_interval_secs = 0;
        let h = harness_with(config);
        h.store.save_rule(&ip_rule("5.6.7.8", "1 r/s, 1m")).unwrap();

        h.clock.advance(Duration::from_secs(24 * 3600));
        h.engine.run_maintenance();
        assert!(h.engine.find_rule("5.6.7.8").is_none());
    }

    #[tokio::test]
    async fn test_maintenance_task_evicts() {
        let mut config = DosConfig::default();
        config.inactivity_grace_secs = 0;
        let engine = Arc::new(DosEngine::start(config).unwrap());
        engine.register_rule(ip_rule("1.2.3.4", "5 r/s, 1m")).unwrap();
        engine.evaluate("1.2.3.4");
        assert_eq!(engine.tracked_windows(), 1);

        let handle = engine.spawn_maintenance(Duration::from_millis(10));
        for _ in 0..100 {
            if engine.tracked_windows() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(engine.tracked_windows(), 0);
    }
}

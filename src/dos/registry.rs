//! The rule registry.
//!
//! Rules are published as immutable snapshots: every change builds a new
//! [`RuleSet`] and swaps it in atomically, so lookups on the request path
//! never take a lock and never observe a half-applied update.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::rule::{canonical_key, Rule, RuleType};
use crate::error::{DosError, Result};

/// One immutable version of the registered rules.
#[derive(Debug, Default)]
struct RuleSet {
    /// Rules in registration order
    rules: Vec<Arc<Rule>>,
    /// Enabled exact-match rules by key; the first registered wins
    exact: HashMap<String, usize>,
    /// Enabled pattern rules (CIDR, path), in registration order
    patterns: Vec<usize>,
}

impl RuleSet {
    fn from_rules(rules: Vec<Arc<Rule>>) -> Self {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            if !rule.is_enabled() {
                continue;
            }
            if rule.rule_type().is_exact() {
                exact.entry(rule.key().to_string()).or_insert(index);
            } else {
                patterns.push(index);
            }
        }

        Self {
            rules,
            exact,
            patterns,
        }
    }

    fn position(&self, rule_type: RuleType, key: &str) -> Option<usize> {
        self.rules
            .iter()
            .position(|r| r.rule_type() == rule_type && r.key() == key)
    }

    /// A copy of this set with `rule` inserted, or replacing the rule with
    /// the same type and key in place.
    fn with(&self, rule: Arc<Rule>) -> Self {
        let mut rules = self.rules.clone();
        match self.position(rule.rule_type(), rule.key()) {
            Some(index) => rules[index] = rule,
            None => rules.push(rule),
        }
        Self::from_rules(rules)
    }

    fn without(&self, index: usize) -> Self {
        let mut rules = self.rules.clone();
        rules.remove(index);
        Self::from_rules(rules)
    }

    fn find(&self, key: &str) -> Option<&Arc<Rule>> {
        if let Some(&index) = self.exact.get(key) {
            return Some(&self.rules[index]);
        }

        let mut best: Option<&Arc<Rule>> = None;
        for &index in &self.patterns {
            let rule = &self.rules[index];
            if !rule.matches(key) {
                continue;
            }
            // Strictly greater, so the earlier registration keeps a tie
            if best.map_or(true, |b| rule.specificity() > b.specificity()) {
                best = Some(rule);
            }
        }
        best
    }
}

/// A concurrently readable catalog of rules keyed by `(type, key)`.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    current: ArcSwap<RuleSet>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with `rules`.
    pub fn with_rules(rules: impl IntoIterator<Item = Rule>) -> Result<Self> {
        let registry = Self::new();
        registry.replace_all(rules)?;
        Ok(registry)
    }

    /// Insert a rule, or replace the one with the same type and key.
    ///
    /// A replaced rule keeps its registration position, which matters for
    /// tie-breaking in [`find_rule`](Self::find_rule). Returns the replaced
    /// rule, if any.
    pub fn register(&self, rule: Rule) -> Result<Option<Arc<Rule>>> {
        validate(&rule)?;
        let rule = Arc::new(rule);
        let previous = self.current.rcu(|set| set.with(rule.clone()));
        let replaced = previous
            .position(rule.rule_type(), rule.key())
            .map(|index| previous.rules[index].clone());

        debug!(
            rule = %rule,
            replaced = replaced.is_some(),
            "Registered rule"
        );
        Ok(replaced)
    }

    /// Find the rule applying to a runtime key.
    ///
    /// Exact rules (`ip`, `token`) win over patterns. Among patterns the most
    /// specific match wins (longest CIDR prefix, deepest path prefix); ties go
    /// to the rule registered first. Disabled rules never match.
    pub fn find_rule(&self, key: &str) -> Option<Arc<Rule>> {
        let key = canonical_key(key);
        self.current.load().find(&key).cloned()
    }

    /// Look up a rule by type and key, whether or not it is enabled.
    pub fn get(&self, rule_type: RuleType, key: &str) -> Option<Arc<Rule>> {
        let lookup = Rule::builder(rule_type, key).build().ok()?;
        let set = self.current.load();
        set.position(rule_type, lookup.key())
            .map(|index| set.rules[index].clone())
    }

    /// A snapshot of all rules in registration order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.current.load().rules.clone()
    }

    /// Remove a rule. Removing a rule that is not registered is a no-op.
    pub fn remove(&self, rule_type: RuleType, key: &str) -> Option<Arc<Rule>> {
        let lookup = Rule::builder(rule_type, key).build().ok()?;
        let previous = self.current.rcu(|set| match set.position(rule_type, lookup.key()) {
            Some(index) => Arc::new(set.without(index)),
            None => Arc::clone(set),
        });
        let removed = previous
            .position(rule_type, lookup.key())
            .map(|index| previous.rules[index].clone());

        if let Some(ref rule) = removed {
            debug!(rule = %rule, "Removed rule");
        }
        removed
    }

    /// Atomically replace every rule, for example after a reload.
    ///
    /// Duplicate `(type, key)` pairs resolve as if registered one by one.
    pub fn replace_all(&self, rules: impl IntoIterator<Item = Rule>) -> Result<()> {
        let mut set = RuleSet::default();
        for rule in rules {
            validate(&rule)?;
            set = set.with(Arc::new(rule));
        }
        self.current.store(Arc::new(set));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.current.load().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate(rule: &Rule) -> Result<()> {
    if rule.key().trim().is_empty() {
        return Err(DosError::InvalidRule("rule key must not be empty".to_string()));
    }
    Ok(())
}

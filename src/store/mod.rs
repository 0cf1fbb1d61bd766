//! Rule persistence and the audit trail.
//!
//! The engine only sees the [`RuleStore`] and [`AuditSink`] traits; the
//! implementations here cover in-memory use and plain files.

mod file;
mod memory;

pub use file::{JsonLinesAuditLog, YamlRuleStore};
pub use memory::MemoryStore;

use crate::dos::audit::AuditRecord;
use crate::dos::rule::{Rule, RuleType};
use crate::error::PersistenceError;

/// Durable storage for rules.
pub trait RuleStore: Send + Sync {
    /// Load every stored rule, in stored order.
    fn load_rules(&self) -> Result<Vec<Rule>, PersistenceError>;

    /// Insert a rule, or replace the one with the same type and key.
    fn save_rule(&self, rule: &Rule) -> Result<(), PersistenceError>;

    /// Delete a rule by its canonical key. Deleting a missing rule succeeds.
    fn delete_rule(&self, rule_type: RuleType, key: &str) -> Result<(), PersistenceError>;
}

/// Append-only destination for audit records.
pub trait AuditSink: Send + Sync {
    fn append_audit(&self, record: &AuditRecord) -> Result<(), PersistenceError>;
}

/// Upsert `rule` into an ordered list, keeping the position of a replaced
/// rule.
pub(crate) fn upsert(rules: &mut Vec<Rule>, rule: &Rule) {
    match rules
        .iter_mut()
        .find(|r| r.rule_type() == rule.rule_type() && r.key() == rule.key())
    {
        Some(existing) => *existing = rule.clone(),
        None => rules.push(rule.clone()),
    }
}

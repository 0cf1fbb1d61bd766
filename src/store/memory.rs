//! In-memory store.

use parking_lot::{Mutex, RwLock};

use super::{upsert, AuditSink, RuleStore};
use crate::dos::audit::AuditRecord;
use crate::dos::rule::{Rule, RuleType};
use crate::error::PersistenceError;

/// Keeps rules and audit records in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rules: RwLock<Vec<Rule>>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that starts out holding `rules`.
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Audit records appended so far.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().clone()
    }
}

impl RuleStore for MemoryStore {
    fn load_rules(&self) -> Result<Vec<Rule>, PersistenceError> {
        Ok(self.rules.read().clone())
    }

    fn save_rule(&self, rule: &Rule) -> Result<(), PersistenceError> {
        upsert(&mut self.rules.write(), rule);
        Ok(())
    }

    fn delete_rule(&self, rule_type: RuleType, key: &str) -> Result<(), PersistenceError> {
        self.rules
            .write()
            .retain(|r| !(r.rule_type() == rule_type && r.key() == key));
        Ok(())
    }
}

impl AuditSink for MemoryStore {
    fn append_audit(&self, record: &AuditRecord) -> Result<(), PersistenceError> {
        self.audit.lock().push(record.clone());
        Ok(())
    }
}

//! Admission decisions and their audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::rule::Rule;

/// The outcome of evaluating a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Block,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    /// The request pushed the key over its threshold
    ThresholdExceeded,
    /// The key was already blocked
    StillBlocked,
}

/// One entry in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub rule_id: String,
    pub rule_key: String,
    /// The runtime key the decision was made for
    pub key: String,
    pub decision: Decision,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<AuditReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
}

impl AuditRecord {
    /// Start a record for a decision taken under `rule`.
    pub fn new(rule: &Rule, key: &str, decision: Decision, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id().to_string(),
            rule_key: rule.key().to_string(),
            key: key.to_string(),
            decision,
            timestamp,
            reason: None,
            observed_rate: None,
            blocked_until: None,
        }
    }

    pub fn with_reason(mut self, reason: AuditReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_observed_rate(mut self, rate: u32) -> Self {
        self.observed_rate = Some(rate);
        self
    }

    pub fn with_blocked_until(mut self, blocked_until: DateTime<Utc>) -> Self {
        self.blocked_until = Some(blocked_until);
        self
    }
}

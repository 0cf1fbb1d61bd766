//! Admission rules.
//!
//! A rule ties a match key (an IP, a network, an opaque token or a path
//! prefix) to a [`Threshold`] and an [`Action`].

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use super::threshold::Threshold;
use crate::error::DosError;

/// What kind of runtime key a rule matches, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// A single IP address, matched exactly
    Ip,
    /// A network in CIDR notation, matched by containment
    Cidr,
    /// An opaque string such as a header value or API key, matched exactly
    Token,
    /// A path prefix, matched on segment boundaries
    Path,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Ip => "ip",
            RuleType::Cidr => "cidr",
            RuleType::Token => "token",
            RuleType::Path => "path",
        }
    }

    /// Whether keys of this type are looked up by equality.
    pub fn is_exact(&self) -> bool {
        matches!(self, RuleType::Ip | RuleType::Token)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a request matching the rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Admit until the threshold is crossed, then block for the blocking period
    #[default]
    Auto,
    /// Always admit, without tracking
    Allow,
    /// Always reject, without tracking
    Deny,
}

/// Parsed form of a rule key, derived from `(type, key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Ip(IpAddr),
    Cidr(IpNet),
    Token,
    Path,
}

/// An immutable admission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleRecord", into = "RuleRecord")]
pub struct Rule {
    id: String,
    key: String,
    rule_type: RuleType,
    threshold: Threshold,
    action: Action,
    enabled: bool,
    name: String,
    description: Option<String>,
    matcher: Matcher,
}

impl Rule {
    /// Start building a rule for the given type and key.
    pub fn builder(rule_type: RuleType, key: impl Into<String>) -> RuleBuilder {
        RuleBuilder::new(rule_type, key)
    }

    /// Identifier of a rule, `"<type>:<key>"`.
    ///
    /// Audit records reference rules by this value.
    pub fn identifier(rule_type: RuleType, key: &str) -> String {
        format!("{}:{}", rule_type, key)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The normalized match key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn rule_type(&self) -> RuleType {
        self.rule_type
    }

    pub fn threshold(&self) -> &Threshold {
        &self.threshold
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether a runtime key is covered by this rule.
    ///
    /// `key` is expected in canonical form (see [`canonical_key`]).
    pub fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Matcher::Ip(ip) => parse_ip(key).map(|k| k == *ip).unwrap_or(false),
            Matcher::Cidr(net) => parse_ip(key).map(|k| net.contains(&k)).unwrap_or(false),
            Matcher::Token => key == self.key,
            Matcher::Path => path_contains(&self.key, key),
        }
    }

    /// How narrowly the rule matches; higher is more specific.
    pub fn specificity(&self) -> u32 {
        match &self.matcher {
            Matcher::Ip(_) | Matcher::Token => u32::MAX,
            Matcher::Cidr(net) => u32::from(net.prefix_len()),
            Matcher::Path => self.key.split('/').filter(|s| !s.is_empty()).count() as u32,
        }
    }

    /// A short description used in logs.
    pub fn to_description(&self) -> String {
        format!(
            "name={}, type={}, key={}, action={:?}, threshold='{}'",
            self.name, self.rule_type, self.key, self.action, self.threshold
        )
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Canonical form of a runtime key: IP literals are re-rendered so that
/// equivalent spellings compare equal, everything else is kept as is.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) become plain IPv4.
pub fn canonical_key(key: &str) -> String {
    let trimmed = key.trim();
    match parse_ip(trimmed) {
        Some(ip) => ip.to_string(),
        None => trimmed.to_string(),
    }
}

/// Parse an IP literal, unwrapping IPv4-mapped IPv6 addresses.
pub(crate) fn parse_ip(key: &str) -> Option<IpAddr> {
    match key.parse::<IpAddr>().ok()? {
        IpAddr::V6(v6) => Some(v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4)),
        ip => Some(ip),
    }
}

/// Canonical form of a rule key for the given type, as stored on the rule.
pub fn normalize_key(rule_type: RuleType, key: &str) -> Result<String, DosError> {
    normalize(rule_type, key).map(|(key, _)| key)
}

fn path_contains(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn normalize(rule_type: RuleType, key: &str) -> Result<(String, Matcher), DosError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(DosError::InvalidRule(format!("{} rule key must not be empty", rule_type)));
    }
    match rule_type {
        RuleType::Ip => {
            let ip = parse_ip(key)
                .ok_or_else(|| DosError::InvalidRule(format!("'{}' is not an IP address", key)))?;
            Ok((ip.to_string(), Matcher::Ip(ip)))
        }
        RuleType::Cidr => {
            let net: IpNet = key
                .parse()
                .map_err(|_| DosError::InvalidRule(format!("'{}' is not a CIDR network", key)))?;
            let net = net.trunc();
            Ok((net.to_string(), Matcher::Cidr(net)))
        }
        RuleType::Token => Ok((key.to_string(), Matcher::Token)),
        RuleType::Path => {
            if !key.starts_with('/') {
                return Err(DosError::InvalidRule(format!("path '{}' must start with '/'", key)));
            }
            let trimmed = key.trim_end_matches('/');
            let path = if trimmed.is_empty() { "/" } else { trimmed };
            Ok((path.to_string(), Matcher::Path))
        }
    }
}

/// Builder for [`Rule`].
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    rule_type: RuleType,
    key: String,
    threshold: Threshold,
    action: Action,
    enabled: bool,
    name: Option<String>,
    description: Option<String>,
}

impl RuleBuilder {
    fn new(rule_type: RuleType, key: impl Into<String>) -> Self {
        Self {
            rule_type,
            key: key.into(),
            threshold: Threshold::DEFAULT,
            action: Action::Auto,
            enabled: true,
            name: None,
            description: None,
        }
    }

    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate the key and produce the rule.
    pub fn build(self) -> Result<Rule, DosError> {
        let (key, matcher) = normalize(self.rule_type, &self.key)?;
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| key.clone());
        Ok(Rule {
            id: Rule::identifier(self.rule_type, &key),
            key,
            rule_type: self.rule_type,
            threshold: self.threshold,
            action: self.action,
            enabled: self.enabled,
            name,
            description: self.description,
            matcher,
        })
    }
}

/// Persisted shape of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleRecord {
    #[serde(rename = "type")]
    rule_type: RuleType,
    key: String,
    #[serde(default)]
    threshold: Threshold,
    #[serde(default)]
    action: Action,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<RuleRecord> for Rule {
    type Error = DosError;

    fn try_from(record: RuleRecord) -> Result<Self, Self::Error> {
        let mut builder = Rule::builder(record.rule_type, record.key)
            .threshold(record.threshold)
            .action(record.action)
            .enabled(record.enabled);
        if let Some(name) = record.name {
            builder = builder.name(name);
        }
        if let Some(description) = record.description {
            builder = builder.description(description);
        }
        builder.build()
    }
}

impl From<Rule> for RuleRecord {
    fn from(rule: Rule) -> Self {
        let name = (rule.name != rule.key).then_some(rule.name);
        Self {
            rule_type: rule.rule_type,
            key: rule.key,
            threshold: rule.threshold,
            action: rule.action,
            enabled: rule.enabled,
            name,
            description: rule.description,
        }
    }
}

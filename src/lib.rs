//! dosguard - Admission Control and DoS Protection
//!
//! This crate classifies requests by a key (client IP, token, path), tracks
//! each key's request rate against configured thresholds, blocks keys that
//! go over for a cooling-off period, and keeps an audit trail of the
//! blocking decisions.

pub mod config;
pub mod dos;
pub mod error;
pub mod executor;
pub mod store;

pub use config::DosConfig;
pub use dos::{parse_threshold, Decision, DosEngine, Rule, RuleType, Threshold};
pub use error::{DosError, Result};

//! Configuration management for dosguard.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DosError, Result};

/// Prefix of environment variables overriding file settings, e.g.
/// `DOSGUARD__AUDIT__WORKERS=4`.
pub const ENV_PREFIX: &str = "DOSGUARD";

/// Main configuration for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DosConfig {
    /// Master switch; when off every request is allowed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Whether loopback addresses are subject to rules
    #[serde(default)]
    pub track_localhost: bool,

    /// How often idle windows are evicted, in seconds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// How long a window must be idle before it can be evicted, in seconds
    #[serde(default = "default_inactivity_grace")]
    pub inactivity_grace_secs: u64,

    /// How often rules are reloaded from the rule store, in seconds; 0 turns
    /// periodic reloads off
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Audit trail configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for DosConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            track_localhost: false,
            maintenance_interval_secs: default_maintenance_interval(),
            inactivity_grace_secs: default_inactivity_grace(),
            reload_interval_secs: default_reload_interval(),
            audit: AuditConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_inactivity_grace() -> u64 {
    900
}

fn default_reload_interval() -> u64 {
    900
}

/// Audit trail configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Record allowed requests too, not only blocks
    #[serde(default)]
    pub audit_allowed: bool,

    /// Record a still-blocked key at most once per `repeat_interval_secs`
    /// instead of on every blocked request
    #[serde(default = "default_throttle_repeats")]
    pub throttle_repeats: bool,

    /// Minimum time between two still-blocked records for the same key
    #[serde(default = "default_repeat_interval")]
    pub repeat_interval_secs: u64,

    /// Pending audit writes before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of audit writers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            audit_allowed: false,
            throttle_repeats: default_throttle_repeats(),
            repeat_interval_secs: default_repeat_interval(),
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
        }
    }
}

fn default_throttle_repeats() -> bool {
    true
}

fn default_repeat_interval() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_workers() -> usize {
    2
}

impl AuditConfig {
    /// Spacing of still-blocked records, or `None` to record every one.
    pub fn repeat_interval(&self) -> Option<Duration> {
        self.throttle_repeats
            .then(|| Duration::from_secs(self.repeat_interval_secs))
    }
}

/// Where rules and audit records live. Unset paths keep them in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// YAML rules file
    pub rules_path: Option<PathBuf>,

    /// JSON-lines audit log
    pub audit_path: Option<PathBuf>,
}

impl DosConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: DosConfig =
            serde_yaml::from_str(contents).map_err(|e| DosError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file, then apply
    /// `DOSGUARD__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: DosConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| DosError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.maintenance_interval_secs == 0 {
            return Err(DosError::Config(
                "maintenance_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.audit.queue_capacity == 0 {
            return Err(DosError::Config(
                "audit.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.audit.workers == 0 {
            return Err(DosError::Config(
                "audit.workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn inactivity_grace(&self) -> Duration {
        Duration::from_secs(self.inactivity_grace_secs)
    }

    /// Period of automatic rule reloads, `None` when turned off.
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }
}

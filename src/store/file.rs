//! File-backed rule store and audit log.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{upsert, AuditSink, RuleStore};
use crate::dos::audit::AuditRecord;
use crate::dos::rule::{Rule, RuleType};
use crate::error::PersistenceError;

/// On-disk layout of the rules file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Stores rules in a YAML file.
///
/// Every change rewrites the whole file through a temporary sibling and a
/// rename, so readers never see a partial file. A missing file holds no
/// rules.
#[derive(Debug)]
pub struct YamlRuleStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl YamlRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<Rule>, PersistenceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: RuleFile = serde_yaml::from_str(&contents)?;
        Ok(file.rules)
    }

    fn write(&self, rules: Vec<Rule>) -> Result<(), PersistenceError> {
        let contents = serde_yaml::to_string(&RuleFile { rules })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RuleStore for YamlRuleStore {
    fn load_rules(&self) -> Result<Vec<Rule>, PersistenceError> {
        let rules = self.read()?;
        info!(path = %self.path.display(), count = rules.len(), "Loaded rules");
        Ok(rules)
    }

    fn save_rule(&self, rule: &Rule) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        let mut rules = self.read()?;
        upsert(&mut rules, rule);
        self.write(rules)?;
        debug!(path = %self.path.display(), rule = %rule, "Saved rule");
        Ok(())
    }

    fn delete_rule(&self, rule_type: RuleType, key: &str) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        let mut rules = self.read()?;
        let before = rules.len();
        rules.retain(|r| !(r.rule_type() == rule_type && r.key() == key));
        if rules.len() != before {
            self.write(rules)?;
            debug!(path = %self.path.display(), rule_type = %rule_type, key = key, "Deleted rule");
        }
        Ok(())
    }
}

/// Appends audit records to a file, one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAuditLog {
    /// Open (or create) the log for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in the log. Blank lines are skipped.
    pub fn read_records(&self) -> Result<Vec<AuditRecord>, PersistenceError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl AuditSink for JsonLinesAuditLog {
    fn append_audit(&self, record: &AuditRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

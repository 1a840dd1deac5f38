//! KDL schema for config.kdl.
//!
//! This module provides:
//! - The Rust struct mirroring the KDL schema
//! - Parsing from and serialization to KDL
//! - Validation
//! - File locations

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Name of the config file in both locations.
pub const CONFIG_FILE: &str = "config.kdl";

/// Engine settings stored in config.kdl. Every field is optional; missing
/// fields fall through to the next precedence level.
///
/// # KDL Schema
///
/// ```kdl
/// complexity-threshold 0.7
/// max-iterations 3
/// optimization-max-iterations 5
/// generation-timeout-ms 30000
/// conflict-retries 3
/// audit-log #true
/// audit-log-path "~/.local/share/duet/audit.log"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuetConfig {
    /// Default complexity threshold for new projects, in [0,1]
    pub complexity_threshold: Option<f64>,

    /// Default revision budget for new projects (>= 1)
    pub max_iterations: Option<u32>,

    /// Pass cap for the promotion optimization loop (>= 1)
    pub optimization_max_iterations: Option<u32>,

    /// Timeout for each generation call, in milliseconds (>= 1)
    pub generation_timeout_ms: Option<u64>,

    /// Transparent retries after an optimistic-concurrency conflict
    pub conflict_retries: Option<u32>,

    /// Whether change events are appended to the audit log
    pub audit_log: Option<bool>,

    /// Audit log location (`~` is expanded)
    pub audit_log_path: Option<String>,
}

impl DuetConfig {
    /// Create an empty config with no values set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    pub fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.complexity_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(invalid("complexity-threshold", "must be within [0, 1]", threshold));
            }
        }
        if self.max_iterations == Some(0) {
            return Err(invalid("max-iterations", "must be at least 1", 0));
        }
        if self.optimization_max_iterations == Some(0) {
            return Err(invalid("optimization-max-iterations", "must be at least 1", 0));
        }
        if self.generation_timeout_ms == Some(0) {
            return Err(invalid("generation-timeout-ms", "must be at least 1", 0));
        }
        if let Some(path) = &self.audit_log_path {
            if path.trim().is_empty() {
                return Err(Error::Validation(
                    "config key 'audit-log-path' must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document.
    ///
    /// Unknown nodes are ignored; known nodes with a value of the wrong type
    /// or out of range are rejected.
    pub fn from_kdl(doc: &KdlDocument) -> Result<Self> {
        let mut config = Self::new();

        if let Some(value) = first_value(doc, "complexity-threshold") {
            let threshold = value
                .as_float()
                .or_else(|| value.as_integer().map(|i| i as f64))
                .ok_or_else(|| wrong_type("complexity-threshold", "a number"))?;
            config.complexity_threshold = Some(threshold);
        }

        config.max_iterations = integer(doc, "max-iterations")?;
        config.optimization_max_iterations = integer(doc, "optimization-max-iterations")?;
        config.generation_timeout_ms = integer(doc, "generation-timeout-ms")?;
        config.conflict_retries = integer(doc, "conflict-retries")?;

        if let Some(value) = first_value(doc, "audit-log") {
            config.audit_log = Some(
                value
                    .as_bool()
                    .ok_or_else(|| wrong_type("audit-log", "a boolean"))?,
            );
        }

        if let Some(value) = first_value(doc, "audit-log-path") {
            config.audit_log_path = Some(
                value
                    .as_string()
                    .ok_or_else(|| wrong_type("audit-log-path", "a string"))?
                    .to_string(),
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        if let Some(threshold) = self.complexity_threshold {
            push(&mut doc, "complexity-threshold", KdlValue::Float(threshold));
        }
        if let Some(n) = self.max_iterations {
            push(&mut doc, "max-iterations", KdlValue::Integer(i128::from(n)));
        }
        if let Some(n) = self.optimization_max_iterations {
            push(&mut doc, "optimization-max-iterations", KdlValue::Integer(i128::from(n)));
        }
        if let Some(ms) = self.generation_timeout_ms {
            push(&mut doc, "generation-timeout-ms", KdlValue::Integer(i128::from(ms)));
        }
        if let Some(n) = self.conflict_retries {
            push(&mut doc, "conflict-retries", KdlValue::Integer(i128::from(n)));
        }
        if let Some(enabled) = self.audit_log {
            push(&mut doc, "audit-log", KdlValue::Bool(enabled));
        }
        if let Some(ref path) = self.audit_log_path {
            push(&mut doc, "audit-log-path", KdlValue::String(path.clone()));
        }

        doc
    }

    /// Merge another config into this one.
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &DuetConfig) {
        if other.complexity_threshold.is_some() {
            self.complexity_threshold = other.complexity_threshold;
        }
        if other.max_iterations.is_some() {
            self.max_iterations = other.max_iterations;
        }
        if other.optimization_max_iterations.is_some() {
            self.optimization_max_iterations = other.optimization_max_iterations;
        }
        if other.generation_timeout_ms.is_some() {
            self.generation_timeout_ms = other.generation_timeout_ms;
        }
        if other.conflict_retries.is_some() {
            self.conflict_retries = other.conflict_retries;
        }
        if other.audit_log.is_some() {
            self.audit_log = other.audit_log;
        }
        if other.audit_log_path.is_some() {
            self.audit_log_path = other.audit_log_path.clone();
        }
    }

    /// Set one key from its textual form, as given to `config set`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str, expected: &str) -> Result<T> {
            value.trim().parse().map_err(|_| wrong_type(key, expected))
        }

        match key {
            "complexity-threshold" => {
                self.complexity_threshold = Some(parse(key, value, "a number")?)
            }
            "max-iterations" => self.max_iterations = Some(parse(key, value, "an integer")?),
            "optimization-max-iterations" => {
                self.optimization_max_iterations = Some(parse(key, value, "an integer")?)
            }
            "generation-timeout-ms" => {
                self.generation_timeout_ms = Some(parse(key, value, "an integer")?)
            }
            "conflict-retries" => self.conflict_retries = Some(parse(key, value, "an integer")?),
            "audit-log" => self.audit_log = Some(parse(key, value, "a boolean")?),
            "audit-log-path" => self.audit_log_path = Some(value.to_string()),
            _ => return Err(Error::Validation(format!("Unknown config key: {}", key))),
        }
        self.validate()
    }

    /// Load a config file. A missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path)?;
        let doc: KdlDocument = content.parse().map_err(|e| {
            Error::Validation(format!("Failed to parse KDL in {}: {}", path.display(), e))
        })?;

        Self::from_kdl(&doc).map_err(|e| match e {
            Error::Validation(msg) => Error::Validation(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Write the config file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_kdl().to_string())?;
        Ok(())
    }
}

/// Environment variable overriding the system config directory.
pub const CONFIG_DIR_ENV: &str = "DUET_CONFIG_DIR";

/// System config location: `$DUET_CONFIG_DIR/config.kdl`, otherwise
/// `~/.config/duet/config.kdl`.
pub fn system_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }
    }
    dirs::config_dir().map(|dir| dir.join("duet").join(CONFIG_FILE))
}

/// Workspace config location inside a data directory.
pub fn workspace_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

fn first_value<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .map(|entry| entry.value())
}

fn integer<T: TryFrom<i128>>(doc: &KdlDocument, name: &str) -> Result<Option<T>> {
    let Some(value) = first_value(doc, name) else {
        return Ok(None);
    };
    let raw = value
        .as_integer()
        .ok_or_else(|| wrong_type(name, "an integer"))?;
    T::try_from(raw)
        .map(Some)
        .map_err(|_| invalid(name, "is out of range", raw))
}

fn push(doc: &mut KdlDocument, name: &str, value: KdlValue) {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(value));
    doc.nodes_mut().push(node);
}

fn wrong_type(key: &str, expected: &str) -> Error {
    Error::Validation(format!("config key '{}' must be {}", key, expected))
}

fn invalid(key: &str, problem: &str, value: impl std::fmt::Display) -> Error {
    Error::Validation(format!("config key '{}' {}, got {}", key, problem, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(text: &str) -> Result<DuetConfig> {
        let doc: KdlDocument = text.parse().unwrap();
        DuetConfig::from_kdl(&doc)
    }

    #[test]
    fn test_parse_all_keys() {
        let config = parse(
            r#"
            complexity-threshold 0.55
            max-iterations 4
            optimization-max-iterations 2
            generation-timeout-ms 1500
            conflict-retries 0
            audit-log #false
            audit-log-path "/tmp/duet-audit.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.complexity_threshold, Some(0.55));
        assert_eq!(config.max_iterations, Some(4));
        assert_eq!(config.optimization_max_iterations, Some(2));
        assert_eq!(config.generation_timeout_ms, Some(1500));
        assert_eq!(config.conflict_retries, Some(0));
        assert_eq!(config.audit_log, Some(false));
        assert_eq!(config.audit_log_path.as_deref(), Some("/tmp/duet-audit.log"));
    }

    #[test]
    fn test_empty_document_is_empty_config() {
        assert_eq!(parse("").unwrap(), DuetConfig::new());
    }

    #[test]
    fn test_integer_threshold_accepted() {
        assert_eq!(parse("complexity-threshold 1").unwrap().complexity_threshold, Some(1.0));
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = parse("complexity-threshold 1.5").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationError);
        assert!(err.to_string().contains("complexity-threshold"));

        let err = parse("max-iterations 0").unwrap_err();
        assert!(err.to_string().contains("max-iterations"));

        let err = parse("max-iterations \"three\"").unwrap_err();
        assert!(err.to_string().contains("max-iterations"));

        let err = parse("conflict-retries -1").unwrap_err();
        assert!(err.to_string().contains("conflict-retries"));
    }

    #[test]
    fn test_kdl_round_trip() {
        let config = DuetConfig {
            complexity_threshold: Some(0.25),
            max_iterations: Some(2),
            audit_log: Some(true),
            audit_log_path: Some("~/audit.log".to_string()),
            ..DuetConfig::default()
        };
        let text = config.to_kdl().to_string();
        assert_eq!(parse(&text).unwrap(), config);
    }

    #[test]
    fn test_merge_overrides_set_fields_only() {
        let mut base = DuetConfig {
            complexity_threshold: Some(0.5),
            max_iterations: Some(5),
            ..DuetConfig::default()
        };
        base.merge(&DuetConfig {
            max_iterations: Some(2),
            ..DuetConfig::default()
        });
        assert_eq!(base.complexity_threshold, Some(0.5));
        assert_eq!(base.max_iterations, Some(2));
    }

    #[test]
    fn test_load_and_save() {
        let temp = TempDir::new().unwrap();
        let path = workspace_config_path(temp.path());
        assert_eq!(DuetConfig::load(&path).unwrap(), DuetConfig::new());

        let config = DuetConfig {
            generation_timeout_ms: Some(250),
            ..DuetConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(DuetConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "max-iterations {").unwrap();
        let err = DuetConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationError);
    }

    #[test]
    fn test_set_from_text() {
        let mut config = DuetConfig::new();
        config.set("complexity-threshold", "0.4").unwrap();
        config.set("audit-log", "false").unwrap();
        assert_eq!(config.complexity_threshold, Some(0.4));
        assert_eq!(config.audit_log, Some(false));

        assert!(config.set("max-iterations", "many").is_err());
        assert!(config.set("max-iterations", "0").is_err());
        assert!(config.set("colour", "blue").is_err());
    }
}

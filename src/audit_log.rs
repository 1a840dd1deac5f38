//! Audit logging for Duet.
//!
//! Every committed change event and every CLI command is appended to a
//! JSONL file, one record per line. Writing never fails the operation that
//! produced the record; problems are reported through `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::storage::{ChangeEvent, ChangeKind, EntityKind, EventSink};
use crate::Result;

/// Longest string kept verbatim in a record.
const MAX_STRING_CHARS: usize = 100;

/// Arrays longer than this are summarized.
const MAX_ARRAY_ITEMS: usize = 10;

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    /// A committed change to one entity
    Change {
        timestamp: DateTime<Utc>,
        entity: EntityKind,
        id: String,
        change: ChangeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        user: String,
    },
    /// A CLI invocation
    Command {
        timestamp: DateTime<Utc>,
        command: String,
        args: serde_json::Value,
        /// Ids of the entities the command changed, with their projects
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        entities: Vec<String>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
        user: String,
    },
}

/// Append-only JSONL audit log.
pub struct AuditLog {
    path: PathBuf,
    user: String,
    write_lock: Mutex<()>,
    /// Entities changed since the last command record
    touched: Mutex<BTreeSet<String>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            user: get_current_user(),
            write_lock: Mutex::new(()),
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a CLI command. Arguments are sanitized first; the entities
    /// changed since the previous command record are attached.
    pub fn log_command(
        &self,
        command: &str,
        args: &serde_json::Value,
        success: bool,
        error: Option<String>,
        duration_ms: u64,
    ) {
        let entities = std::mem::take(&mut *self.touched.lock().unwrap_or_else(|e| e.into_inner()));
        self.append(&AuditRecord::Command {
            timestamp: Utc::now(),
            command: command.to_string(),
            args: sanitize_args(args),
            entities: entities.into_iter().collect(),
            success,
            error,
            duration_ms,
            user: self.user.clone(),
        });
    }

    /// Read every record back, skipping lines that do not parse.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn append(&self, record: &AuditRecord) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = write_log_entry(&self.path, record) {
            warn!(path = %self.path.display(), error = %e, "failed to write audit log");
        }
    }
}

impl EventSink for AuditLog {
    fn on_change(&self, event: &ChangeEvent) {
        {
            let mut touched = self.touched.lock().unwrap_or_else(|e| e.into_inner());
            touched.insert(event.id.clone());
            touched.extend(event.project_id.iter().cloned());
        }
        self.append(&AuditRecord::Change {
            timestamp: event.at,
            entity: event.entity,
            id: event.id.clone(),
            change: event.change,
            project_id: event.project_id.clone(),
            detail: event.detail.as_deref().map(truncate),
            user: self.user.clone(),
        });
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn write_log_entry(path: &Path, record: &AuditRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(record)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", json)?;
    Ok(())
}

/// Sanitize command arguments: redact secrets, shorten long text and
/// summarize big arrays. Step content can be long, so it is truncated.
fn sanitize_args(args: &serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::Object(map) => {
            let mut sanitized = serde_json::Map::new();
            for (key, value) in map {
                let key_lower = key.to_lowercase();
                if key_lower.contains("password")
                    || key_lower.contains("token")
                    || key_lower.contains("secret")
                {
                    sanitized.insert(
                        key.clone(),
                        serde_json::Value::String("[REDACTED]".to_string()),
                    );
                } else {
                    sanitized.insert(key.clone(), sanitize_args(value));
                }
            }
            serde_json::Value::Object(sanitized)
        }
        serde_json::Value::Array(arr) => {
            if arr.len() > MAX_ARRAY_ITEMS {
                serde_json::Value::String(format!("[Array with {} items]", arr.len()))
            } else {
                serde_json::Value::Array(arr.iter().map(sanitize_args).collect())
            }
        }
        serde_json::Value::String(s) => serde_json::Value::String(truncate(s)),
        _ => args.clone(),
    }
}

fn truncate(s: &str) -> String {
    let count = s.chars().count();
    if count > MAX_STRING_CHARS {
        let head: String = s.chars().take(MAX_STRING_CHARS - 3).collect();
        format!("{}... ({} chars)", head, count)
    } else {
        s.to_string()
    }
}

fn get_current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_simple_string() {
        assert_eq!(sanitize_args(&json!("hello")), json!("hello"));
    }

    #[test]
    fn test_sanitize_long_string() {
        let long = "a".repeat(150);
        let result = sanitize_args(&json!(long));
        let s = result.as_str().unwrap();
        assert!(s.starts_with(&"a".repeat(97)));
        assert!(s.ends_with("... (150 chars)"));
    }

    #[test]
    fn test_sanitize_sensitive_keys() {
        let args = json!({
            "api_token": "abc",
            "content": "step text",
        });
        let result = sanitize_args(&args);
        assert_eq!(result["api_token"], "[REDACTED]");
        assert_eq!(result["content"], "step text");
    }

    #[test]
    fn test_sanitize_large_array() {
        let arr: Vec<u32> = (0..15).collect();
        assert_eq!(sanitize_args(&json!(arr)), json!("[Array with 15 items]"));
    }

    #[test]
    fn test_sanitize_nested_object() {
        let args = json!({ "outer": { "secret": "x", "title": "ok" } });
        let result = sanitize_args(&args);
        assert_eq!(result["outer"]["secret"], "[REDACTED]");
        assert_eq!(result["outer"]["title"], "ok");
    }

    #[test]
    fn test_change_events_are_appended() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path().join("nested").join("audit.log"));

        log.on_change(
            &ChangeEvent::new(EntityKind::Step, "s1", ChangeKind::Updated)
                .in_project("p1")
                .with_detail("agreed"),
        );
        log.on_change(&ChangeEvent::new(EntityKind::Project, "p1", ChangeKind::Deleted));

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            AuditRecord::Change {
                entity,
                id,
                project_id,
                detail,
                ..
            } => {
                assert_eq!(*entity, EntityKind::Step);
                assert_eq!(id, "s1");
                assert_eq!(project_id.as_deref(), Some("p1"));
                assert_eq!(detail.as_deref(), Some("agreed"));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_command_record() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path().join("audit.log"));
        log.log_command("produce", &json!({ "step": "abc" }), false, Some("boom".into()), 12);

        let line = fs::read_to_string(log.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["command"], "produce");
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn test_command_record_lists_changed_entities() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path().join("audit.log"));

        log.on_change(&ChangeEvent::new(EntityKind::Project, "p1", ChangeKind::Created));
        log.on_change(&ChangeEvent::new(EntityKind::Task, "t1", ChangeKind::Created).in_project("p1"));
        log.log_command("project create", &json!({ "name": "Shop" }), true, None, 3);
        log.log_command("project list", &json!({}), true, None, 1);

        let commands: Vec<_> = log
            .read_all()
            .unwrap()
            .into_iter()
            .filter_map(|record| match record {
                AuditRecord::Command { entities, .. } => Some(entities),
                _ => None,
            })
            .collect();
        assert_eq!(commands, vec![vec!["p1".to_string(), "t1".to_string()], Vec::new()]);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/audit.log"), home.join("audit.log"));
        }
    }
}

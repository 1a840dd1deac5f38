//! Change events emitted by every committed mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity families tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Task,
    Step,
    Dispute,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Task => "task",
            EntityKind::Step => "step",
            EntityKind::Dispute => "dispute",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    /// Only the derived progress changed
    ProgressChanged,
}

/// A committed change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub id: String,
    pub change: ChangeKind,

    /// Owning project, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Short human-readable note (new status, new progress, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(entity: EntityKind, id: impl Into<String>, change: ChangeKind) -> Self {
        Self {
            entity,
            id: id.into(),
            change,
            project_id: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Consumer of committed change events.
///
/// Sinks run after the transaction commits and must not fail the operation;
/// they report their own problems.
pub trait EventSink: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

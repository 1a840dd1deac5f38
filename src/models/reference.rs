//! Polymorphic references into the Task/Step execution chain.
//!
//! A [`NodeRef`] names either a Task or a Step. Its only textual form is the
//! tagged string `task:<uuid>` / `step:<uuid>`, produced by `Display` and
//! consumed by `FromStr`; storage and the JSON wire format both go through
//! this boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// The entity kind a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Step,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Task => "task",
            NodeKind::Step => "step",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tagged identifier pointing at either a Task or a Step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeRef {
    Task(String),
    Step(String),
}

impl NodeRef {
    /// Reference a task by ID.
    pub fn task(id: impl Into<String>) -> Self {
        NodeRef::Task(id.into())
    }

    /// Reference a step by ID.
    pub fn step(id: impl Into<String>) -> Self {
        NodeRef::Step(id.into())
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeRef::Task(_) => NodeKind::Task,
            NodeRef::Step(_) => NodeKind::Step,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            NodeRef::Task(id) | NodeRef::Step(id) => id,
        }
    }

    /// Parse an optional reference, treating `None` and empty strings as absent.
    pub fn parse_optional(value: Option<&str>) -> Result<Option<NodeRef>> {
        match value {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => s.parse().map(Some),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl FromStr for NodeRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (tag, id) = s.split_once(':').ok_or_else(|| {
            Error::Validation(format!(
                "Reference must look like 'task:<id>' or 'step:<id>', got: {}",
                s
            ))
        })?;

        // Only the lowercase hyphenated form, so one entity has one spelling.
        let canonical = Uuid::parse_str(id).is_ok_and(|uuid| uuid.hyphenated().to_string() == id);
        if !canonical {
            return Err(Error::Validation(format!(
                "Reference ID must be a lowercase hyphenated UUID, got: {}",
                id
            )));
        }

        match tag {
            "task" => Ok(NodeRef::Task(id.to_string())),
            "step" => Ok(NodeRef::Step(id.to_string())),
            other => Err(Error::Validation(format!(
                "Unknown reference kind '{}' (expected 'task' or 'step')",
                other
            ))),
        }
    }
}

impl TryFrom<String> for NodeRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NodeRef> for String {
    fn from(value: NodeRef) -> Self {
        value.to_string()
    }
}

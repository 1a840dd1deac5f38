//! Data models for Duet entities.
//!
//! This module defines the core data structures:
//! - `Project` - Top-level container with collaboration settings
//! - `Task` - Hierarchical work items threaded into an execution chain
//! - `Step` - Leaf work items refined by the producer and reviewer agents
//! - `Dispute` - Escalated disagreement awaiting a human resolution
//! - `IterationRecord` - One revision round of a step's collaboration
//! - `WorkItem` - Either a Task or a Step, as returned by navigation

pub mod complexity;
pub mod reference;

pub use reference::{NodeKind, NodeRef};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Default score above which a step is considered for promotion.
pub const DEFAULT_COMPLEXITY_THRESHOLD: f64 = 0.7;

/// Default number of revision cycles before a step is disputed.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Generate a fresh entity ID.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Collaboration status of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    ProducerDraft,
    ReviewerReview,
    Agreed,
    Disputed,
    /// Transient: a human resolution is being applied to a disputed step
    UserResolution,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::ProducerDraft => "producer_draft",
            StepStatus::ReviewerReview => "reviewer_review",
            StepStatus::Agreed => "agreed",
            StepStatus::Disputed => "disputed",
            StepStatus::UserResolution => "user_resolution",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "producer_draft" | "producer-draft" => Ok(StepStatus::ProducerDraft),
            "reviewer_review" | "reviewer-review" => Ok(StepStatus::ReviewerReview),
            "agreed" => Ok(StepStatus::Agreed),
            "disputed" => Ok(StepStatus::Disputed),
            "user_resolution" | "user-resolution" => Ok(StepStatus::UserResolution),
            _ => Err(Error::Validation(format!("Invalid step status: {}", s))),
        }
    }
}

/// Three-level complexity scale shared by both agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

impl ComplexityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityLevel::Low => "low",
            ComplexityLevel::Medium => "medium",
            ComplexityLevel::High => "high",
        }
    }

    /// Ordinal rank used to measure how far apart two opinions are.
    pub fn rank(&self) -> u8 {
        match self {
            ComplexityLevel::Low => 0,
            ComplexityLevel::Medium => 1,
            ComplexityLevel::High => 2,
        }
    }

    /// Bucket a [0,1] score into a level.
    pub fn from_score(score: f64) -> Self {
        if score < 0.34 {
            ComplexityLevel::Low
        } else if score < 0.67 {
            ComplexityLevel::Medium
        } else {
            ComplexityLevel::High
        }
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ComplexityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(ComplexityLevel::Low),
            "medium" => Ok(ComplexityLevel::Medium),
            "high" => Ok(ComplexityLevel::High),
            _ => Err(Error::Validation(format!("Invalid complexity level: {}", s))),
        }
    }
}

/// The two collaborating agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Producer,
    Reviewer,
}

impl Agent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Agent::Producer => "producer",
            Agent::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Agent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "producer" => Ok(Agent::Producer),
            "reviewer" => Ok(Agent::Reviewer),
            _ => Err(Error::Validation(format!(
                "Invalid agent: {} (expected producer or reviewer)",
                s
            ))),
        }
    }
}

/// Lifecycle of a dispute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    #[default]
    Pending,
    Resolved,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Pending => "pending",
            DisputeStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DisputeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DisputeStatus::Pending),
            "resolved" => Ok(DisputeStatus::Resolved),
            _ => Err(Error::Validation(format!("Invalid dispute status: {}", s))),
        }
    }
}

/// How a human arbiter settled a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    UseProducer,
    UseReviewer,
    Custom,
    Hybrid,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionKind::UseProducer => "use_producer",
            ResolutionKind::UseReviewer => "use_reviewer",
            ResolutionKind::Custom => "custom",
            ResolutionKind::Hybrid => "hybrid",
        }
    }

    /// Whether the arbiter must supply the resolved content explicitly.
    pub fn requires_content(&self) -> bool {
        matches!(self, ResolutionKind::Custom | ResolutionKind::Hybrid)
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResolutionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "use_producer" | "producer" => Ok(ResolutionKind::UseProducer),
            "use_reviewer" | "reviewer" => Ok(ResolutionKind::UseReviewer),
            "custom" => Ok(ResolutionKind::Custom),
            "hybrid" => Ok(ResolutionKind::Hybrid),
            _ => Err(Error::Validation(format!("Invalid resolution kind: {}", s))),
        }
    }
}

/// A project: the root of a task hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier (UUID)
    pub id: String,

    /// Project name
    pub name: String,

    /// Free-text description that drives downstream generation
    pub description: String,

    /// Derived completion ratio in [0,1]
    #[serde(default)]
    pub progress: f64,

    /// Score above which steps become promotion candidates
    pub complexity_threshold: f64,

    /// Revision cycles allowed before a step is disputed
    pub max_iterations: u32,

    /// Optimistic concurrency version
    #[serde(default)]
    pub version: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project with default collaboration settings.
    pub fn new(name: String, description: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name,
            description,
            progress: 0.0,
            complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the field-level invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("Project name must not be empty".to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(Error::Validation(
                "Project description must not be empty".to_string(),
            ));
        }
        validate_threshold(self.complexity_threshold)?;
        validate_max_iterations(self.max_iterations)?;
        Ok(())
    }
}

/// Validate a complexity threshold.
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::Validation(format!(
            "complexity threshold must be within [0, 1], got {}",
            threshold
        )));
    }
    Ok(())
}

/// Validate a revision budget.
pub fn validate_max_iterations(max_iterations: u32) -> Result<()> {
    if max_iterations < 1 {
        return Err(Error::Validation(
            "max iterations must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// A task: a node of the hierarchy owning steps and child tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUID)
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Parent task for nested tasks; root tasks have none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Task title
    pub title: String,

    /// What the task should achieve
    pub objective: String,

    /// Derived completion ratio in [0,1]
    #[serde(default)]
    pub progress: f64,

    /// Previous item in the execution chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_ref: Option<NodeRef>,

    /// Next item in the execution chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_ref: Option<NodeRef>,

    /// Ordering among siblings
    #[serde(default)]
    pub position: i64,

    /// Optimistic concurrency version
    #[serde(default)]
    pub version: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new root task in the given project.
    pub fn new(project_id: String, title: String, objective: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            project_id,
            parent_task_id: None,
            title,
            objective,
            progress: 0.0,
            prev_ref: None,
            next_ref: None,
            position: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::task(self.id.clone())
    }
}

/// A step: the leaf unit of work refined by the two agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier (UUID)
    pub id: String,

    /// Owning task
    pub task_id: String,

    /// Step title
    pub title: String,

    /// Previous item in the execution chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_ref: Option<NodeRef>,

    /// Next item in the execution chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_ref: Option<NodeRef>,

    /// Ordering among the task's steps
    #[serde(default)]
    pub position: i64,

    /// 1.0 once agreed with final content, otherwise 0.0
    #[serde(default)]
    pub progress: f64,

    /// Collaboration status
    #[serde(default)]
    pub status: StepStatus,

    /// Revision cycles requested so far
    #[serde(default)]
    pub iteration_count: u32,

    /// Latest producer draft
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_content: Option<String>,

    /// Producer's reasoning for the latest draft
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_reasoning: Option<String>,

    /// Focus hint given with the latest draft
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_hint: Option<String>,

    /// Reviewer's latest proposed content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_content: Option<String>,

    /// Reviewer's latest revision feedback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_feedback: Option<String>,

    /// Agreed content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_complexity: Option<ComplexityLevel>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_complexity: Option<ComplexityLevel>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled_complexity: Option<ComplexityLevel>,

    /// Reconciled complexity score in [0,1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity_score: Option<f64>,

    /// Reconciled promotion decision; None until both agents have assessed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_promote: Option<bool>,

    /// Optimistic concurrency version
    #[serde(default)]
    pub version: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Step {
    /// Create a new pending step under the given task.
    pub fn new(task_id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            task_id,
            title,
            prev_ref: None,
            next_ref: None,
            position: 0,
            progress: 0.0,
            status: StepStatus::Pending,
            iteration_count: 0,
            producer_content: None,
            producer_reasoning: None,
            focus_hint: None,
            reviewer_content: None,
            reviewer_feedback: None,
            final_content: None,
            producer_complexity: None,
            reviewer_complexity: None,
            reconciled_complexity: None,
            complexity_score: None,
            should_promote: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::step(self.id.clone())
    }

    /// The content complexity analysis should look at: final content when
    /// agreed, otherwise the latest draft.
    pub fn analysis_content(&self) -> Option<&str> {
        non_empty(self.final_content.as_deref()).or_else(|| non_empty(self.producer_content.as_deref()))
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }

    /// Progress implied by the status and final content.
    pub fn derived_progress(&self) -> f64 {
        if self.status == StepStatus::Agreed && non_empty(self.final_content.as_deref()).is_some() {
            1.0
        } else {
            0.0
        }
    }
}

/// Returns the string if it contains anything besides whitespace.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// One revision round of a step's collaboration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Step the round belongs to
    pub step_id: String,

    /// 1-based round number
    pub iteration: u32,

    /// Producer's draft for this round
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_reasoning: Option<String>,

    /// Reviewer's proposed content, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_content: Option<String>,

    /// Reviewer's revision feedback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_feedback: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

/// A human arbiter's decision on a dispute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub kind: ResolutionKind,
    pub content: String,
    pub resolved_at: DateTime<Utc>,
}

/// An escalated disagreement between the producer and reviewer on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    /// Unique identifier (UUID)
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Disputed step
    pub step_id: String,

    /// Producer's final-iteration content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_content: Option<String>,

    /// Producer's final-iteration reasoning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_reasoning: Option<String>,

    /// Reviewer's final-iteration content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_content: Option<String>,

    /// Reviewer's final-iteration reasoning (its revision feedback)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_reasoning: Option<String>,

    /// Every revision round that led to the dispute
    #[serde(default)]
    pub history: Vec<IterationRecord>,

    #[serde(default)]
    pub status: DisputeStatus,

    /// Present iff the dispute is resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<DisputeResolution>,

    /// Optimistic concurrency version
    #[serde(default)]
    pub version: i64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Dispute {
    /// Open a dispute capturing a step's final-iteration positions.
    pub fn open(project_id: String, step: &Step, history: Vec<IterationRecord>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            project_id,
            step_id: step.id.clone(),
            producer_content: step.producer_content.clone(),
            producer_reasoning: step.producer_reasoning.clone(),
            reviewer_content: step.reviewer_content.clone(),
            reviewer_reasoning: step.reviewer_feedback.clone(),
            history,
            status: DisputeStatus::Pending,
            resolution: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DisputeStatus::Pending
    }

    /// Work out the content a resolution would apply to the step.
    pub fn resolved_content(
        &self,
        kind: ResolutionKind,
        custom_content: Option<&str>,
    ) -> Result<String> {
        let content = if kind.requires_content() {
            non_empty(custom_content).ok_or_else(|| {
                Error::Validation(format!("Resolution '{}' requires explicit content", kind))
            })?
        } else {
            let candidate = match kind {
                ResolutionKind::UseProducer => non_empty(self.producer_content.as_deref()),
                _ => non_empty(self.reviewer_content.as_deref())
                    .or_else(|| non_empty(self.reviewer_reasoning.as_deref())),
            };
            candidate.ok_or_else(|| {
                Error::Validation(format!(
                    "Dispute {} has no content to apply for '{}'",
                    self.id, kind
                ))
            })?
        };
        Ok(content.to_string())
    }

    /// Mark resolved. Resolution fields are only ever set together with the status.
    pub fn resolve(&mut self, kind: ResolutionKind, content: String) -> Result<()> {
        if !self.is_pending() {
            return Err(Error::InvalidTransition(format!(
                "Dispute {} is already resolved",
                self.id
            )));
        }
        let now = Utc::now();
        self.status = DisputeStatus::Resolved;
        self.resolution = Some(DisputeResolution {
            kind,
            content,
            resolved_at: now,
        });
        self.updated_at = now;
        Ok(())
    }
}

/// The next unit of work surfaced by navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Task(Task),
    Step(Step),
}

impl WorkItem {
    pub fn node_ref(&self) -> NodeRef {
        match self {
            WorkItem::Task(task) => task.node_ref(),
            WorkItem::Step(step) => step.node_ref(),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            WorkItem::Task(task) => &task.title,
            WorkItem::Step(step) => &step.title,
        }
    }

    pub fn progress(&self) -> f64 {
        match self {
            WorkItem::Task(task) => task.progress,
            WorkItem::Step(step) => step.progress,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress() >= 1.0
    }

    pub fn prev_ref(&self) -> Option<&NodeRef> {
        match self {
            WorkItem::Task(task) => task.prev_ref.as_ref(),
            WorkItem::Step(step) => step.prev_ref.as_ref(),
        }
    }

    pub fn next_ref(&self) -> Option<&NodeRef> {
        match self {
            WorkItem::Task(task) => task.next_ref.as_ref(),
            WorkItem::Step(step) => step.next_ref.as_ref(),
        }
    }
}

/// Input for defining a root task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    pub objective: String,
}

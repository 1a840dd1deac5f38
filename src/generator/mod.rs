//! The text-generation boundary.
//!
//! Both agents are reached through [`ContentGenerator`]: drafting, reviewing,
//! complexity opinions, step decomposition and the initial task plan. Calls
//! may be slow and may fail; the engine wraps every one in a timeout and
//! never holds the store lock across them.
//!
//! [`HeuristicGenerator`] is a deterministic offline implementation used by
//! the CLI and the tests.

mod heuristic;

pub use heuristic::HeuristicGenerator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::complexity::ComplexityAssessment;
use crate::models::Agent;
use crate::workflow::ReviewerDecision;
use crate::Result;

/// Everything an agent is told about a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub project_name: String,
    /// Free-text project description driving generation
    pub project_description: String,
    pub task_title: String,
    pub task_objective: String,
    pub step_title: String,
    /// Titles of the steps before this one in its task
    pub prior_steps: Vec<String>,
    /// Titles of every task in the project (the reviewer's wider view)
    pub project_tasks: Vec<String>,
    pub focus_hint: Option<String>,
    /// The producer's latest draft, if any
    pub previous_draft: Option<String>,
    /// The reviewer's latest revision feedback, if any
    pub previous_feedback: Option<String>,
    /// Revision rounds used so far
    pub iteration: u32,
    pub max_iterations: u32,
    pub complexity_threshold: f64,
}

/// What the planner sees when decomposing a project into root tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub name: String,
    pub description: String,
    /// Titles of root tasks that already exist
    pub existing_tasks: Vec<String>,
}

/// A producer draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub content: String,
    pub reasoning: String,
}

/// One child step proposed by a decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutline {
    pub title: String,
}

/// One root task proposed by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutline {
    pub title: String,
    pub objective: String,
}

/// Request/response access to the producing and reviewing agents.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "generator"
    }

    /// Producer: draft (or revise) the content of a step.
    async fn draft_step(&self, ctx: &StepContext) -> Result<Draft>;

    /// Reviewer: approve, refine or send back a draft.
    async fn review_step(&self, ctx: &StepContext, content: &str) -> Result<ReviewerDecision>;

    /// One agent's independent complexity opinion on step content.
    async fn assess_complexity(
        &self,
        agent: Agent,
        ctx: &StepContext,
        content: &str,
    ) -> Result<ComplexityAssessment>;

    /// Split an over-complex step into an ordered list of child steps.
    async fn decompose_step(&self, ctx: &StepContext, content: &str) -> Result<Vec<StepOutline>>;

    /// Reviewer: propose the initial root tasks of a project.
    async fn plan_tasks(&self, ctx: &ProjectContext) -> Result<Vec<TaskOutline>>;
}

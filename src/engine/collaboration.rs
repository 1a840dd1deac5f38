//! Projects, root tasks, steps and the producer/reviewer refinement protocol.

use std::time::Duration;

use tracing::info;

use super::{Engine, ensure_unchanged, step_context};
use crate::generator::ProjectContext;
use crate::models::{
    Dispute, NodeRef, Project, Step, StepStatus, Task, TaskSpec, validate_max_iterations,
    validate_threshold,
};
use crate::storage::{Queries, StoreTx};
use crate::workflow::{ReviewOutcome, ReviewerDecision, apply_producer_submission, apply_review};
use crate::{Error, Result};

impl Engine {
    /// Create a project. Missing settings come from the engine config.
    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
        complexity_threshold: Option<f64>,
        max_iterations: Option<u32>,
    ) -> Result<Project> {
        let threshold = complexity_threshold.unwrap_or(self.config.default_complexity_threshold);
        let max_iterations = max_iterations.unwrap_or(self.config.default_max_iterations);
        validate_threshold(threshold)?;
        validate_max_iterations(max_iterations)?;

        let project = self
            .write(|tx| {
                let mut project = Project::new(name.trim().to_string(), description.to_string());
                project.complexity_threshold = threshold;
                project.max_iterations = max_iterations;
                tx.insert_project(project)
            })
            .await?;
        info!(project = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    /// Append root tasks to a project, threaded into the chain in the given
    /// order after the project's last root task.
    pub async fn define_root_tasks(&self, project_id: &str, specs: &[TaskSpec]) -> Result<Vec<Task>> {
        if specs.is_empty() {
            return Err(Error::Validation("At least one task is required".to_string()));
        }
        self.write(|tx| insert_root_tasks(tx, project_id, specs)).await
    }

    /// Create a pending step. Without links it is appended after the task's
    /// last step.
    pub async fn create_step(
        &self,
        task_id: &str,
        title: &str,
        prev: Option<NodeRef>,
        next: Option<NodeRef>,
    ) -> Result<Step> {
        self.write(|tx| {
            let mut step = Step::new(task_id.to_string(), title.trim().to_string());
            step.prev_ref = prev.clone();
            step.next_ref = next.clone();
            tx.insert_step(step)
        })
        .await
    }

    /// Record the producer's content and hand the step to the reviewer.
    pub async fn submit_producer_content(
        &self,
        step_id: &str,
        content: &str,
        reasoning: &str,
        focus_hint: Option<&str>,
    ) -> Result<Step> {
        self.write(|tx| {
            let mut step = tx.get_step(step_id)?;
            commit_submission(tx, &mut step, content, reasoning, focus_hint)?;
            Ok(step)
        })
        .await
    }

    /// Apply the reviewer's verdict. Exhausting the revision budget opens a
    /// dispute in the same transaction.
    pub async fn submit_reviewer_decision(
        &self,
        step_id: &str,
        decision: &ReviewerDecision,
    ) -> Result<Step> {
        self.write(|tx| {
            let mut step = tx.get_step(step_id)?;
            commit_review(tx, &mut step, decision)?;
            Ok(step)
        })
        .await
    }

    /// Ask the producer for a draft (or a revision) and submit it.
    pub async fn generate_producer_draft(
        &self,
        step_id: &str,
        focus_hint: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Step> {
        self.retry_conflicts("draft", || self.try_generate_producer_draft(step_id, focus_hint, timeout))
            .await
    }

    async fn try_generate_producer_draft(
        &self,
        step_id: &str,
        focus_hint: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Step> {
        let (ctx, version) = self
            .read(|s| {
                let step = s.get_step(step_id)?;
                if !matches!(step.status, StepStatus::Pending | StepStatus::ProducerDraft) {
                    return Err(Error::InvalidTransition(format!(
                        "step {} is '{}', not awaiting a producer draft",
                        step.id, step.status
                    )));
                }
                let mut ctx = step_context(s, &step)?;
                if let Some(hint) = focus_hint {
                    ctx.focus_hint = Some(hint.to_string());
                }
                Ok((ctx, step.version))
            })
            .await?;

        let draft = self
            .generate("draft", timeout, self.generator.draft_step(&ctx))
            .await?;

        self.write(|tx| {
            let mut step = tx.get_step(step_id)?;
            ensure_unchanged(&step, version)?;
            commit_submission(tx, &mut step, &draft.content, &draft.reasoning, ctx.focus_hint.as_deref())?;
            Ok(step)
        })
        .await
    }

    /// Ask the reviewer for a verdict on the current draft and apply it.
    pub async fn request_review(&self, step_id: &str, timeout: Option<Duration>) -> Result<Step> {
        self.retry_conflicts("review", || self.try_request_review(step_id, timeout))
            .await
    }

    async fn try_request_review(&self, step_id: &str, timeout: Option<Duration>) -> Result<Step> {
        let (ctx, content, version) = self
            .read(|s| {
                let step = s.get_step(step_id)?;
                if step.status != StepStatus::ReviewerReview {
                    return Err(Error::InvalidTransition(format!(
                        "step {} is '{}', not awaiting review",
                        step.id, step.status
                    )));
                }
                let content = step.producer_content.clone().unwrap_or_default();
                Ok((step_context(s, &step)?, content, step.version))
            })
            .await?;

        let decision = self
            .generate("review", timeout, self.generator.review_step(&ctx, &content))
            .await?;

        self.write(|tx| {
            let mut step = tx.get_step(step_id)?;
            ensure_unchanged(&step, version)?;
            commit_review(tx, &mut step, &decision)?;
            Ok(step)
        })
        .await
    }

    /// Alternate drafts and reviews until the step is agreed or disputed.
    ///
    /// `timeout` bounds each generator call, not the whole exchange.
    pub async fn collaborate(
        &self,
        step_id: &str,
        focus_hint: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Step> {
        let mut step = self.get_step(step_id).await?;
        let max_iterations = self
            .read(|s| s.get_project(&s.project_of(&step.node_ref())?))
            .await?
            .max_iterations;
        // Each revision round is one draft plus one review.
        let max_calls = 2 * (max_iterations as usize + 1);

        for _ in 0..max_calls {
            step = match step.status {
                StepStatus::Pending | StepStatus::ProducerDraft => {
                    self.generate_producer_draft(step_id, focus_hint, timeout).await?
                }
                StepStatus::ReviewerReview => self.request_review(step_id, timeout).await?,
                StepStatus::Agreed | StepStatus::Disputed | StepStatus::UserResolution => {
                    return Ok(step);
                }
            };
        }
        Ok(step)
    }

    /// Ask the reviewer for the project's initial decomposition and
    /// persist it as root tasks.
    pub async fn generate_root_tasks(
        &self,
        project_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Task>> {
        let ctx = self
            .read(|s| {
                let project = s.get_project(project_id)?;
                let existing_tasks = s
                    .list_root_tasks(project_id)?
                    .into_iter()
                    .map(|t| t.title)
                    .collect();
                Ok(ProjectContext {
                    name: project.name,
                    description: project.description,
                    existing_tasks,
                })
            })
            .await?;

        let outlines = self
            .generate("plan", timeout, self.generator.plan_tasks(&ctx))
            .await?;
        if outlines.is_empty() {
            return Err(Error::UpstreamUnavailable(format!(
                "planner proposed no tasks for project {}",
                project_id
            )));
        }

        let specs: Vec<TaskSpec> = outlines
            .into_iter()
            .map(|o| TaskSpec {
                title: o.title,
                objective: o.objective,
            })
            .collect();
        self.define_root_tasks(project_id, &specs).await
    }
}

fn insert_root_tasks(tx: &mut StoreTx<'_>, project_id: &str, specs: &[TaskSpec]) -> Result<Vec<Task>> {
    let mut prev = tx.list_root_tasks(project_id)?.last().map(Task::node_ref);
    let mut created = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut task = Task::new(
            project_id.to_string(),
            spec.title.trim().to_string(),
            spec.objective.trim().to_string(),
        );
        task.prev_ref = prev.take();
        let task = tx.insert_task(task)?;
        prev = Some(task.node_ref());
        created.push(task);
    }

    // Earlier tasks gained a next link when their successor was threaded.
    created
        .iter()
        .map(|task| tx.get_task(&task.id))
        .collect()
}

fn commit_submission(
    tx: &mut StoreTx<'_>,
    step: &mut Step,
    content: &str,
    reasoning: &str,
    focus_hint: Option<&str>,
) -> Result<()> {
    let hint = focus_hint.map(str::to_string).or_else(|| step.focus_hint.clone());
    apply_producer_submission(step, content, reasoning, hint.as_deref())?;
    tx.update_step(step)
}

fn commit_review(tx: &mut StoreTx<'_>, step: &mut Step, decision: &ReviewerDecision) -> Result<()> {
    let project_id = tx.project_of(&step.node_ref())?;
    let max_iterations = tx.get_project(&project_id)?.max_iterations;

    match apply_review(step, decision, max_iterations)? {
        ReviewOutcome::Agreed => tx.update_step(step),
        ReviewOutcome::RevisionRequested(record) => {
            tx.update_step(step)?;
            tx.record_iteration(&record)
        }
        ReviewOutcome::Disputed(record) => {
            tx.update_step(step)?;
            tx.record_iteration(&record)?;
            let history = tx.list_iterations(&step.id)?;
            let dispute = tx.insert_dispute(Dispute::open(project_id, step, history))?;
            info!(
                step = %step.id,
                dispute = %dispute.id,
                iterations = step.iteration_count,
                "revision budget exhausted, dispute opened"
            );
            Ok(())
        }
    }
}

//! The shared engine service.
//!
//! [`Engine`] is the function boundary callers use: agents, operators and the
//! CLI. It is cheap to clone and safe to share between tasks. Each read or
//! transaction borrows a connection from a [`StoragePool`], so work on
//! unrelated entities does not queue behind one lock; SQLite serializes the
//! commits and row versions catch lost updates. Calls into the
//! [`ContentGenerator`] happen with no connection held, under a timeout,
//! and their results are committed with a version check.
//!
//! Operations are grouped by concern:
//! - [`collaboration`]: projects, root tasks, steps and the refinement protocol
//! - [`promotion`]: complexity analysis, promotion and the optimization loop
//! - [`disputes`]: listing and resolving disputes
//! - [`navigation`]: next actionable item and chain traversal

pub mod collaboration;
pub mod disputes;
pub mod navigation;
pub mod promotion;

pub use navigation::{ChainWalk, Direction};
pub use promotion::{AnalysisFailure, OptimizationResult, PromotionRecord, StopReason};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::generator::{ContentGenerator, StepContext};
use crate::models::{NodeRef, Project, Step, StepStatus, Task};
use crate::reconcile::{DefaultReconciliation, ReconciliationPolicy};
use crate::storage::pool::DEFAULT_MAX_CONNECTIONS;
use crate::storage::{Queries, Storage, StoragePool, StoreTx};
use crate::{Error, ErrorKind, Result};

/// Collaborative task-decomposition engine.
#[derive(Clone)]
pub struct Engine {
    storage: Arc<StoragePool>,
    generator: Arc<dyn ContentGenerator>,
    policy: Arc<dyn ReconciliationPolicy>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(storage: Storage, generator: Arc<dyn ContentGenerator>, config: EngineConfig) -> Self {
        Self {
            storage: Arc::new(StoragePool::new(storage, DEFAULT_MAX_CONNECTIONS)),
            generator,
            policy: Arc::new(DefaultReconciliation::default()),
            config,
        }
    }

    /// Replace the complexity reconciliation policy.
    pub fn with_policy(mut self, policy: Arc<dyn ReconciliationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a read-only closure against storage.
    pub async fn read<T>(&self, f: impl FnOnce(&Storage) -> Result<T>) -> Result<T> {
        let storage = self.storage.acquire().await?;
        f(&storage)
    }

    /// Run `f` in one transaction, re-running it after a concurrent
    /// modification up to `conflict_retries` times.
    pub async fn write<T>(&self, mut f: impl FnMut(&mut StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let result = {
                let mut storage = self.storage.acquire().await?;
                storage.transaction(&mut f)
            };
            match result {
                Err(e) if e.kind() == ErrorKind::ConflictError && attempt < self.config.conflict_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "retrying after conflict");
                }
                other => return other,
            }
        }
    }

    /// Re-run a whole read-generate-commit operation after a conflict.
    async fn retry_conflicts<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.kind() == ErrorKind::ConflictError && attempt < self.config.conflict_retries => {
                    attempt += 1;
                    debug!(operation = what, attempt, "step changed during generation, retrying");
                }
                other => return other,
            }
        }
    }

    /// Await a generator call under a timeout.
    ///
    /// Timeouts and backend failures surface as `UpstreamUnavailable`;
    /// nothing has been written at this point.
    async fn generate<T>(
        &self,
        what: &str,
        timeout: Option<Duration>,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = timeout.unwrap_or(self.config.generation_timeout);
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(generator = self.generator.name(), operation = what, error = %e, "generation failed");
                Err(match e.kind() {
                    ErrorKind::Internal => Error::UpstreamUnavailable(format!("{}: {}", what, e)),
                    _ => e,
                })
            }
            Err(_) => {
                warn!(
                    generator = self.generator.name(),
                    operation = what,
                    timeout_ms = limit.as_millis() as u64,
                    "generation timed out"
                );
                Err(Error::UpstreamUnavailable(format!(
                    "{} timed out after {} ms",
                    what,
                    limit.as_millis()
                )))
            }
        }
    }

    // === Lookups ===

    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        self.read(|s| s.get_project(project_id)).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.read(|s| s.list_projects()).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.read(|s| s.get_task(task_id)).await
    }

    pub async fn list_root_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.read(|s| {
            s.get_project(project_id)?;
            s.list_root_tasks(project_id)
        })
        .await
    }

    pub async fn get_step(&self, step_id: &str) -> Result<Step> {
        self.read(|s| s.get_step(step_id)).await
    }

    pub async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>> {
        self.read(|s| {
            s.get_task(task_id)?;
            s.list_steps(task_id)
        })
        .await
    }

    // === Structural edits ===

    /// Change a project's threshold and/or revision budget.
    ///
    /// A new threshold only affects later analysis; already reconciled steps
    /// are re-judged by `run_promotion_optimization` with `force_reanalysis`.
    /// The revision budget cannot drop below rounds a step has already used,
    /// and a step still under revision must keep at least one round to go.
    pub async fn update_project_settings(
        &self,
        project_id: &str,
        complexity_threshold: Option<f64>,
        max_iterations: Option<u32>,
    ) -> Result<Project> {
        self.write(|tx| {
            let mut project = tx.get_project(project_id)?;
            if let Some(threshold) = complexity_threshold {
                project.complexity_threshold = threshold;
            }
            if let Some(max) = max_iterations {
                if max < project.max_iterations {
                    check_budget_fits(tx, project_id, max)?;
                }
                project.max_iterations = max;
            }
            tx.update_project(&mut project)?;
            Ok(project)
        })
        .await
    }

    /// Re-parent a task within its project (`None` makes it a root task).
    pub async fn move_task(&self, task_id: &str, new_parent: Option<&str>) -> Result<Task> {
        self.write(|tx| tx.move_task(task_id, new_parent)).await
    }

    /// Re-thread a task or step between new chain neighbours.
    pub async fn set_links(
        &self,
        node: &NodeRef,
        prev: Option<NodeRef>,
        next: Option<NodeRef>,
    ) -> Result<crate::models::WorkItem> {
        self.write(|tx| {
            tx.set_links(node, prev.clone(), next.clone())?;
            tx.get_item(node)
        })
        .await
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        self.write(|tx| tx.delete_project(project_id)).await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.write(|tx| tx.delete_task(task_id)).await
    }

    pub async fn delete_step(&self, step_id: &str) -> Result<()> {
        self.write(|tx| tx.delete_step(step_id)).await
    }
}

/// Fail with `Conflict` when `step` is no longer at `expected_version`.
/// Reject a revision budget smaller than what existing steps already used.
fn check_budget_fits(tx: &StoreTx<'_>, project_id: &str, max_iterations: u32) -> Result<()> {
    for step in tx.list_project_steps(project_id)? {
        let revising = matches!(
            step.status,
            StepStatus::ProducerDraft | StepStatus::ReviewerReview
        );
        if step.iteration_count > max_iterations || (revising && step.iteration_count >= max_iterations) {
            return Err(Error::Validation(format!(
                "step {} has used {} revision round(s); max iterations cannot drop to {}",
                step.id, step.iteration_count, max_iterations
            )));
        }
    }
    Ok(())
}

fn ensure_unchanged(step: &Step, expected_version: i64) -> Result<()> {
    if step.version != expected_version {
        return Err(Error::Conflict(format!(
            "step {} changed while content was being generated",
            step.id
        )));
    }
    Ok(())
}

/// Everything the agents are told about a step.
pub(crate) fn step_context(store: &impl Queries, step: &Step) -> Result<StepContext> {
    let task = store.get_task(&step.task_id)?;
    let project = store.get_project(&task.project_id)?;

    let prior_steps = store
        .list_steps(&task.id)?
        .into_iter()
        .filter(|s| s.position < step.position)
        .map(|s| s.title)
        .collect();
    let project_tasks = store
        .list_project_tasks(&project.id)?
        .into_iter()
        .map(|t| t.title)
        .collect();

    // Only a step sent back for revision has a draft to revise.
    let revising = step.status == StepStatus::ProducerDraft && step.iteration_count > 0;

    Ok(StepContext {
        project_name: project.name,
        project_description: project.description,
        task_title: task.title,
        task_objective: task.objective,
        step_title: step.title.clone(),
        prior_steps,
        project_tasks,
        focus_hint: step.focus_hint.clone(),
        previous_draft: step.producer_content.clone().filter(|_| revising),
        previous_feedback: step.reviewer_feedback.clone().filter(|_| revising),
        iteration: step.iteration_count,
        max_iterations: project.max_iterations,
        complexity_threshold: project.complexity_threshold,
    })
}

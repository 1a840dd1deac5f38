//! Complexity analysis, step promotion and the project-wide optimization loop.
//!
//! Analysis is a two-phase vote: each agent assesses a step on its own and
//! the assessment is stored; once both opinions exist they are folded into
//! the step's reconciled fields by the engine's [`ReconciliationPolicy`].
//!
//! Promotion replaces a step with a task in the same chain position. The
//! new task hangs under the step's task, takes the step's content as its
//! objective and receives generated child steps. All of it, including the
//! deletion of the old step, commits in one transaction.
//!
//! [`ReconciliationPolicy`]: crate::reconcile::ReconciliationPolicy

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Engine, ensure_unchanged, step_context};
use crate::generator::StepOutline;
use crate::models::complexity::ComplexityAssessment;
use crate::models::{Agent, Step, StepStatus, Task};
use crate::storage::{Queries, StoreTx};
use crate::{Error, ErrorKind, Result};

/// Why the optimization loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A pass promoted nothing
    Converged,
    /// No step needed analysis or promotion
    NothingToAnalyze,
    /// The pass cap was reached while promotions were still happening
    IterationCap,
}

/// One step turned into a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    /// The deleted step
    pub step_id: String,
    pub step_title: String,
    /// The task that replaced it
    pub task: Task,
    /// Ids of the generated child steps, in order
    pub child_step_ids: Vec<String>,
    /// Reconciled score that triggered the promotion, when analysed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Optimization pass (1-based), 0 for a direct promotion
    pub pass: u32,
}

/// A step the loop could not analyse or promote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub step_id: String,
    /// "analysis" or "promotion"
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of [`Engine::run_promotion_optimization`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub project_id: String,
    /// Passes actually run
    pub passes: u32,
    /// Steps analysed across all passes
    pub analyzed: usize,
    pub promotions: Vec<PromotionRecord>,
    pub failures: Vec<AnalysisFailure>,
    pub converged: bool,
    pub stop_reason: StopReason,
}

impl Engine {
    /// Have one agent assess a step's current content.
    ///
    /// The opinion is stored (replacing that agent's previous one). When the
    /// other agent has an opinion too, the step's reconciled complexity is
    /// updated in the same transaction.
    pub async fn analyze_complexity(
        &self,
        step_id: &str,
        agent: Agent,
        timeout: Option<Duration>,
    ) -> Result<ComplexityAssessment> {
        self.retry_conflicts("analysis", || self.try_analyze_complexity(step_id, agent, timeout))
            .await
    }

    async fn try_analyze_complexity(
        &self,
        step_id: &str,
        agent: Agent,
        timeout: Option<Duration>,
    ) -> Result<ComplexityAssessment> {
        let (ctx, content, version) = self
            .read(|s| {
                let step = s.get_step(step_id)?;
                let content = step
                    .analysis_content()
                    .ok_or_else(|| {
                        Error::Validation(format!("step {} has no content to analyze", step.id))
                    })?
                    .to_string();
                Ok((step_context(s, &step)?, content, step.version))
            })
            .await?;

        let mut assessment = self
            .generate(
                "complexity",
                timeout,
                self.generator.assess_complexity(agent, &ctx, &content),
            )
            .await?;
        assessment.agent = agent;
        assessment.validate()?;

        self.write(|tx| {
            let mut step = tx.get_step(step_id)?;
            ensure_unchanged(&step, version)?;
            self.record_assessment(tx, &mut step, &assessment)
        })
        .await?;
        Ok(assessment)
    }

    fn record_assessment(
        &self,
        tx: &mut StoreTx<'_>,
        step: &mut Step,
        assessment: &ComplexityAssessment,
    ) -> Result<()> {
        tx.save_assessment(&step.id, assessment)?;
        match assessment.agent {
            Agent::Producer => step.producer_complexity = Some(assessment.level),
            Agent::Reviewer => step.reviewer_complexity = Some(assessment.level),
        }

        let producer = tx.get_assessment(&step.id, Agent::Producer)?;
        let reviewer = tx.get_assessment(&step.id, Agent::Reviewer)?;
        if let (Some(producer), Some(reviewer)) = (producer, reviewer) {
            let project_id = tx.project_of(&step.node_ref())?;
            let threshold = tx.get_project(&project_id)?.complexity_threshold;
            let reconciled = self.policy.reconcile(&producer, &reviewer, threshold);
            step.reconciled_complexity = Some(reconciled.level);
            step.complexity_score = Some(reconciled.score);
            step.should_promote = Some(reconciled.should_promote);
        }
        tx.update_step(step)
    }

    /// Replace a step by a task with generated child steps.
    ///
    /// Steps awaiting or undergoing human arbitration cannot be promoted.
    pub async fn promote_step(&self, step_id: &str, timeout: Option<Duration>) -> Result<PromotionRecord> {
        self.retry_conflicts("promotion", || self.try_promote_step(step_id, timeout, 0))
            .await
    }

    async fn try_promote_step(
        &self,
        step_id: &str,
        timeout: Option<Duration>,
        pass: u32,
    ) -> Result<PromotionRecord> {
        let (ctx, content, version) = self
            .read(|s| {
                let step = s.get_step(step_id)?;
                if matches!(step.status, StepStatus::Disputed | StepStatus::UserResolution) {
                    return Err(Error::InvalidTransition(format!(
                        "step {} is under dispute and cannot be promoted",
                        step.id
                    )));
                }
                let content = step
                    .analysis_content()
                    .ok_or_else(|| {
                        Error::Validation(format!("step {} has no content to promote", step.id))
                    })?
                    .to_string();
                Ok((step_context(s, &step)?, content, step.version))
            })
            .await?;

        let outlines = self
            .generate("decomposition", timeout, self.generator.decompose_step(&ctx, &content))
            .await?;
        let outlines: Vec<StepOutline> = outlines
            .into_iter()
            .filter(|o| !o.title.trim().is_empty())
            .collect();
        if outlines.is_empty() {
            return Err(Error::UpstreamUnavailable(format!(
                "decomposition of step {} produced no child steps",
                step_id
            )));
        }

        let record = self
            .write(|tx| {
                let step = tx.get_step(step_id)?;
                ensure_unchanged(&step, version)?;
                promote_in_tx(tx, &step, &content, &outlines, pass)
            })
            .await?;
        info!(
            step = %record.step_id,
            task = %record.task.id,
            children = record.child_step_ids.len(),
            "step promoted to task"
        );
        Ok(record)
    }

    /// Analyse and promote steps across a project until a pass promotes
    /// nothing, nothing is left to analyse, or `max_iterations` passes ran.
    ///
    /// Already reconciled steps are only re-analysed with `force_reanalysis`,
    /// and then only in the first pass.
    pub async fn run_promotion_optimization(
        &self,
        project_id: &str,
        max_iterations: Option<u32>,
        force_reanalysis: bool,
    ) -> Result<OptimizationResult> {
        let cap = max_iterations.unwrap_or(self.config.optimization_max_iterations);
        if cap == 0 {
            return Err(Error::Validation(
                "optimization needs at least one iteration".to_string(),
            ));
        }
        self.get_project(project_id).await?;

        let mut result = OptimizationResult {
            project_id: project_id.to_string(),
            passes: 0,
            analyzed: 0,
            promotions: Vec::new(),
            failures: Vec::new(),
            converged: false,
            stop_reason: StopReason::IterationCap,
        };
        let mut failed: HashSet<String> = HashSet::new();

        for pass in 1..=cap {
            let force = force_reanalysis && pass == 1;
            let (to_analyze, to_promote) = self
                .read(|s| {
                    let mut to_analyze = Vec::new();
                    let mut to_promote = Vec::new();
                    for step in s.list_project_steps(project_id)? {
                        if failed.contains(&step.id) || !promotable(&step) {
                            continue;
                        }
                        if step.should_promote.is_none() || force {
                            to_analyze.push(step.id);
                        } else if step.should_promote == Some(true) {
                            to_promote.push(step.id);
                        }
                    }
                    Ok((to_analyze, to_promote))
                })
                .await?;

            if to_analyze.is_empty() && to_promote.is_empty() {
                result.stop_reason = StopReason::NothingToAnalyze;
                result.converged = true;
                break;
            }
            result.passes = pass;

            let mut candidates = to_promote;
            for step_id in to_analyze {
                result.analyzed += 1;
                match self.analyze_both(&step_id).await {
                    Ok(true) => candidates.push(step_id),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(step = %step_id, error = %e, "complexity analysis failed");
                        failed.insert(step_id.clone());
                        result.failures.push(failure(&step_id, "analysis", &e));
                    }
                }
            }

            let mut promoted = 0;
            for step_id in candidates {
                match self
                    .retry_conflicts("promotion", || self.try_promote_step(&step_id, None, pass))
                    .await
                {
                    Ok(record) => {
                        promoted += 1;
                        result.promotions.push(record);
                    }
                    Err(e) => {
                        warn!(step = %step_id, error = %e, "promotion failed");
                        failed.insert(step_id.clone());
                        result.failures.push(failure(&step_id, "promotion", &e));
                    }
                }
            }

            if promoted == 0 {
                result.stop_reason = StopReason::Converged;
                result.converged = true;
                break;
            }
        }

        info!(
            project = %project_id,
            passes = result.passes,
            promotions = result.promotions.len(),
            failures = result.failures.len(),
            stop_reason = ?result.stop_reason,
            "promotion optimization finished"
        );
        Ok(result)
    }

    /// Collect both opinions; returns whether the step should be promoted.
    async fn analyze_both(&self, step_id: &str) -> Result<bool> {
        self.analyze_complexity(step_id, Agent::Producer, None).await?;
        self.analyze_complexity(step_id, Agent::Reviewer, None).await?;
        let step = self.get_step(step_id).await?;
        Ok(promotable(&step) && step.should_promote == Some(true))
    }
}

/// Steps under human arbitration and steps without content are left alone.
fn promotable(step: &Step) -> bool {
    !matches!(step.status, StepStatus::Disputed | StepStatus::UserResolution)
        && step.analysis_content().is_some()
}

fn failure(step_id: &str, stage: &str, error: &Error) -> AnalysisFailure {
    AnalysisFailure {
        step_id: step_id.to_string(),
        stage: stage.to_string(),
        kind: error.kind(),
        message: error.to_string(),
    }
}

fn promote_in_tx(
    tx: &mut StoreTx<'_>,
    step: &Step,
    content: &str,
    outlines: &[StepOutline],
    pass: u32,
) -> Result<PromotionRecord> {
    let parent = tx.get_task(&step.task_id)?;

    let mut task = Task::new(parent.project_id.clone(), step.title.clone(), content.to_string());
    task.parent_task_id = Some(parent.id.clone());
    let task = tx.insert_task(task)?;
    tx.take_place(&step.node_ref(), &task.node_ref())?;

    let mut child_step_ids = Vec::with_capacity(outlines.len());
    for outline in outlines {
        let child = tx.insert_step(Step::new(task.id.clone(), outline.title.trim().to_string()))?;
        child_step_ids.push(child.id);
    }

    tx.delete_step(&step.id)?;

    Ok(PromotionRecord {
        step_id: step.id.clone(),
        step_title: step.title.clone(),
        task: tx.get_task(&task.id)?,
        child_step_ids,
        score: step.complexity_score,
        pass,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComplexityLevel, TaskSpec};
    use crate::reconcile::{Agreement, ReconciledComplexity, ReconciliationPolicy};
    use crate::test_utils::{FailingGenerator, ScriptedGenerator, TestEnv};
    use crate::workflow::ReviewerDecision;
    use std::sync::Arc;

    async fn seeded(engine: &Engine) -> (String, Task) {
        let project = engine
            .create_project("Shop", "Online shop", None, None)
            .await
            .unwrap();
        let task = engine
            .define_root_tasks(
                &project.id,
                &[TaskSpec {
                    title: "Checkout".to_string(),
                    objective: "Take payments".to_string(),
                }],
            )
            .await
            .unwrap()
            .remove(0);
        (project.id, task)
    }

    async fn drafted_step(engine: &Engine, task: &Task, title: &str) -> Step {
        let step = engine.create_step(&task.id, title, None, None).await.unwrap();
        engine
            .submit_producer_content(&step.id, &format!("{} in detail", title), "why", None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_analysis_reconciles_once_both_agents_answered() {
        let env = TestEnv::new();
        let engine = env.engine(Arc::new(ScriptedGenerator::promoting()));
        let (_, task) = seeded(&engine).await;
        let step = drafted_step(&engine, &task, "Payments").await;

        let producer = engine
            .analyze_complexity(&step.id, Agent::Producer, None)
            .await
            .unwrap();
        assert_eq!(producer.level, ComplexityLevel::High);
        let after_one = engine.get_step(&step.id).await.unwrap();
        assert_eq!(after_one.producer_complexity, Some(ComplexityLevel::High));
        assert_eq!(after_one.should_promote, None);

        engine
            .analyze_complexity(&step.id, Agent::Reviewer, None)
            .await
            .unwrap();
        let after_two = engine.get_step(&step.id).await.unwrap();
        assert_eq!(after_two.reconciled_complexity, Some(ComplexityLevel::High));
        assert_eq!(after_two.should_promote, Some(true));
        assert!((after_two.complexity_score.unwrap() - 0.875).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_analysis_without_content_rejected() {
        let env = TestEnv::new();
        let engine = env.engine(Arc::new(ScriptedGenerator::promoting()));
        let (_, task) = seeded(&engine).await;
        let step = engine.create_step(&task.id, "Empty", None, None).await.unwrap();
        let err = engine
            .analyze_complexity(&step.id, Agent::Producer, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_promotion_keeps_chain_position() {
        let env = TestEnv::new();
        let engine = env.engine(Arc::new(ScriptedGenerator::promoting()));
        let (project_id, task) = seeded(&engine).await;
        let before = drafted_step(&engine, &task, "Cart").await;
        let middle = drafted_step(&engine, &task, "Payments").await;
        let after = drafted_step(&engine, &task, "Receipt").await;

        let record = engine.promote_step(&middle.id, None).await.unwrap();
        assert_eq!(record.step_id, middle.id);
        assert_eq!(record.task.title, "Payments");
        assert_eq!(record.task.objective, "Payments in detail");
        assert_eq!(record.task.parent_task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(record.task.prev_ref, Some(before.node_ref()));
        assert_eq!(record.task.next_ref, Some(after.node_ref()));
        assert_eq!(record.child_step_ids.len(), 2);

        // Records travel as JSON to agents and back unchanged.
        let echoed: PromotionRecord =
            serde_json::from_value(serde_json::to_value(&record).unwrap()).unwrap();
        assert_eq!(echoed, record);

        assert_eq!(engine.get_step(&middle.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            engine.get_step(&before.id).await.unwrap().next_ref,
            Some(record.task.node_ref())
        );
        assert_eq!(
            engine.get_step(&after.id).await.unwrap().prev_ref,
            Some(record.task.node_ref())
        );

        let children = engine.list_steps(&record.task.id).await.unwrap();
        let titles: Vec<_> = children.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Outline", "Build"]);
        assert_eq!(children[0].next_ref, Some(children[1].node_ref()));

        assert_eq!(engine.list_root_tasks(&project_id).await.unwrap().len(), 1);
        assert_eq!(engine.list_steps(&task.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disputed_step_is_never_promoted() {
        let env = TestEnv::new();
        let engine = env.engine(Arc::new(ScriptedGenerator::promoting()));
        let project = engine.create_project("P", "D", None, Some(1)).await.unwrap();
        let task = engine
            .define_root_tasks(
                &project.id,
                &[TaskSpec {
                    title: "T".to_string(),
                    objective: "O".to_string(),
                }],
            )
            .await
            .unwrap()
            .remove(0);
        let step = drafted_step(&engine, &task, "Fight").await;
        engine
            .submit_reviewer_decision(&step.id, &ReviewerDecision::revise("No"))
            .await
            .unwrap();

        let err = engine.promote_step(&step.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        let result = engine
            .run_promotion_optimization(&project.id, None, false)
            .await
            .unwrap();
        assert!(result.promotions.is_empty());
        assert_eq!(result.stop_reason, StopReason::NothingToAnalyze);
        assert_eq!(
            engine.get_step(&step.id).await.unwrap().status,
            StepStatus::Disputed
        );
    }

    #[tokio::test]
    async fn test_optimization_promotes_then_converges() {
        let env = TestEnv::new();
        let engine = env.engine(Arc::new(ScriptedGenerator::promoting()));
        let (project_id, task) = seeded(&engine).await;
        drafted_step(&engine, &task, "Payments").await;
        drafted_step(&engine, &task, "Refunds").await;

        let first = engine
            .run_promotion_optimization(&project_id, Some(3), false)
            .await
            .unwrap();
        assert_eq!(first.analyzed, 2);
        assert_eq!(first.promotions.len(), 2);
        assert!(first.failures.is_empty());
        assert!(first.converged);
        // Generated child steps have no content yet.
        assert_eq!(first.stop_reason, StopReason::NothingToAnalyze);
        assert_eq!(first.promotions[0].pass, 1);

        let second = engine
            .run_promotion_optimization(&project_id, Some(3), false)
            .await
            .unwrap();
        assert!(second.promotions.is_empty());
        assert_eq!(second.analyzed, 0);
    }

    #[tokio::test]
    async fn test_calm_steps_converge_without_promotion() {
        let env = TestEnv::new();
        let generator = Arc::new(ScriptedGenerator::calm());
        let engine = env.engine(generator.clone());
        let (project_id, task) = seeded(&engine).await;
        let step = drafted_step(&engine, &task, "Label").await;

        let result = engine
            .run_promotion_optimization(&project_id, None, false)
            .await
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::Converged);
        assert_eq!(result.passes, 1);
        assert_eq!(generator.call_count(), 2);
        assert_eq!(engine.get_step(&step.id).await.unwrap().should_promote, Some(false));

        // Reconciled steps are skipped unless re-analysis is forced.
        engine
            .run_promotion_optimization(&project_id, None, false)
            .await
            .unwrap();
        assert_eq!(generator.call_count(), 2);
        let forced = engine
            .run_promotion_optimization(&project_id, None, true)
            .await
            .unwrap();
        assert_eq!(forced.analyzed, 1);
        assert_eq!(generator.call_count(), 4);
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_fatal() {
        let env = TestEnv::new();
        let engine = env.engine(Arc::new(FailingGenerator));
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let task = engine
            .define_root_tasks(
                &project.id,
                &[TaskSpec {
                    title: "T".to_string(),
                    objective: "O".to_string(),
                }],
            )
            .await
            .unwrap()
            .remove(0);
        let step = engine.create_step(&task.id, "S", None, None).await.unwrap();
        engine
            .submit_producer_content(&step.id, "content", "", None)
            .await
            .unwrap();

        let result = engine
            .run_promotion_optimization(&project.id, Some(2), false)
            .await
            .unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind, ErrorKind::UpstreamUnavailable);
        assert_eq!(result.failures[0].stage, "analysis");
        assert_eq!(result.passes, 1);
        assert_eq!(result.stop_reason, StopReason::Converged);
        assert_eq!(engine.get_step(&step.id).await.unwrap().should_promote, None);
    }

    struct AlwaysPromote;

    impl ReconciliationPolicy for AlwaysPromote {
        fn reconcile(
            &self,
            producer: &ComplexityAssessment,
            _reviewer: &ComplexityAssessment,
            _threshold: f64,
        ) -> ReconciledComplexity {
            ReconciledComplexity {
                level: producer.level,
                score: producer.score,
                confidence: producer.confidence,
                should_promote: true,
                agreement: Agreement::Weighted,
            }
        }
    }

    #[tokio::test]
    async fn test_policy_is_swappable() {
        let env = TestEnv::new();
        let engine = env
            .engine(Arc::new(ScriptedGenerator::calm()))
            .with_policy(Arc::new(AlwaysPromote));
        let (_, task) = seeded(&engine).await;
        let step = drafted_step(&engine, &task, "Label").await;
        engine.analyze_complexity(&step.id, Agent::Producer, None).await.unwrap();
        engine.analyze_complexity(&step.id, Agent::Reviewer, None).await.unwrap();
        assert_eq!(engine.get_step(&step.id).await.unwrap().should_promote, Some(true));
    }
}

//! Command implementations for the Duet CLI.
//!
//! Each command runs against a shared [`Engine`] and returns a value that
//! can be printed as JSON (the default) or for humans. Commands are
//! organized by entity type:
//! - `init` - create the workspace database
//! - `project` / `task` / `step` - hierarchy management
//! - `produce` / `review` / `draft` / `collaborate` - the refinement protocol
//! - `complexity` / `optimize` - analysis and promotion
//! - `dispute` - human arbitration
//! - `next` / `chain` - navigation
//! - `log` / `config` - audit trail and settings

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit_log::{AuditLog, AuditRecord};
use crate::config::{workspace_config_path, DuetConfig, ResolvedConfig};
use crate::engine::{ChainWalk, Direction, Engine, OptimizationResult, PromotionRecord};
use crate::generator::HeuristicGenerator;
use crate::models::complexity::ComplexityAssessment;
use crate::models::{
    Agent, Dispute, DisputeStatus, IterationRecord, NodeRef, Project, ResolutionKind, Step, Task,
    TaskSpec, WorkItem,
};
use crate::storage::{Queries, Storage, DB_FILE};
use crate::workflow::ReviewerDecision;
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {}"}}"#, e))
}

fn percent(progress: f64) -> String {
    format!("{:.0}%", progress * 100.0)
}

// === Workspace ===

/// Open the engine over an initialized data directory.
///
/// The audit log, when given, receives every committed change.
pub fn open_engine(
    data_dir: &Path,
    config: &ResolvedConfig,
    audit: Option<Arc<AuditLog>>,
) -> Result<Engine> {
    if !Storage::exists(data_dir) {
        return Err(Error::NotFound(format!(
            "No duet database in {}; run `duet init` first",
            data_dir.display()
        )));
    }
    let mut storage = Storage::open_in_dir(data_dir)?;
    if let Some(audit) = audit {
        storage.add_sink(audit);
    }
    Ok(Engine::new(
        storage,
        Arc::new(HeuristicGenerator::new()),
        config.engine_config(),
    ))
}

#[derive(Serialize)]
pub struct InitResult {
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub created: bool,
}

impl Output for InitResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.created {
            format!("Initialized duet database at {}", self.database.display())
        } else {
            format!("Duet database already exists at {}", self.database.display())
        }
    }
}

/// Create the database in `data_dir` if it does not exist yet.
pub fn init(data_dir: &Path) -> Result<InitResult> {
    let created = !Storage::exists(data_dir);
    Storage::open_in_dir(data_dir)?;
    Ok(InitResult {
        data_dir: data_dir.to_path_buf(),
        database: data_dir.join(DB_FILE),
        created,
    })
}

// === Projects ===

#[derive(Serialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub root_tasks: Vec<Task>,
}

impl Output for ProjectView {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let p = &self.project;
        let mut lines = vec![
            format!("{} {} ({})", p.id, p.name, percent(p.progress)),
            format!("  {}", p.description),
            format!(
                "  threshold: {}  max iterations: {}",
                p.complexity_threshold, p.max_iterations
            ),
        ];
        if self.root_tasks.is_empty() {
            lines.push("  No tasks defined.".to_string());
        } else {
            lines.push(format!("  {} root task(s):", self.root_tasks.len()));
            for task in &self.root_tasks {
                lines.push(format!("    {} {} ({})", task.id, task.title, percent(task.progress)));
            }
        }
        lines.join("\n")
    }
}

impl Output for Project {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "{} {} ({}) threshold: {} max iterations: {}",
            self.id,
            self.name,
            percent(self.progress),
            self.complexity_threshold,
            self.max_iterations
        )
    }
}

#[derive(Serialize)]
pub struct ProjectList {
    pub projects: Vec<Project>,
    pub count: usize,
}

impl Output for ProjectList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.projects.is_empty() {
            return "No projects.".to_string();
        }
        let mut lines = vec![format!("{} project(s):", self.count)];
        for p in &self.projects {
            lines.push(format!("  {} {} ({})", p.id, p.name, percent(p.progress)));
        }
        lines.join("\n")
    }
}

/// Create a project, optionally letting the reviewer propose its root tasks.
pub async fn project_create(
    engine: &Engine,
    name: &str,
    description: &str,
    threshold: Option<f64>,
    max_iterations: Option<u32>,
    plan: bool,
) -> Result<ProjectView> {
    let project = engine
        .create_project(name, description, threshold, max_iterations)
        .await?;
    let root_tasks = if plan {
        engine.generate_root_tasks(&project.id, None).await?
    } else {
        Vec::new()
    };
    Ok(ProjectView {
        project: engine.get_project(&project.id).await?,
        root_tasks,
    })
}

pub async fn project_show(engine: &Engine, id: &str) -> Result<ProjectView> {
    Ok(ProjectView {
        project: engine.get_project(id).await?,
        root_tasks: engine.list_root_tasks(id).await?,
    })
}

pub async fn project_list(engine: &Engine) -> Result<ProjectList> {
    let projects = engine.list_projects().await?;
    Ok(ProjectList {
        count: projects.len(),
        projects,
    })
}

pub async fn project_settings(
    engine: &Engine,
    id: &str,
    threshold: Option<f64>,
    max_iterations: Option<u32>,
) -> Result<Project> {
    if threshold.is_none() && max_iterations.is_none() {
        return Err(Error::Validation(
            "Nothing to change: pass --threshold and/or --max-iterations".to_string(),
        ));
    }
    engine
        .update_project_settings(id, threshold, max_iterations)
        .await
}

#[derive(Serialize)]
pub struct Deleted {
    pub kind: &'static str,
    pub id: String,
}

impl Output for Deleted {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Deleted {} {}", self.kind, self.id)
    }
}

pub async fn project_delete(engine: &Engine, id: &str) -> Result<Deleted> {
    engine.delete_project(id).await?;
    Ok(Deleted {
        kind: "project",
        id: id.to_string(),
    })
}

// === Tasks ===

#[derive(Serialize)]
pub struct TaskList {
    pub tasks: Vec<Task>,
    pub count: usize,
}

impl Output for TaskList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("{} task(s):", self.count)];
        for task in &self.tasks {
            lines.push(format!("  {} {}: {}", task.id, task.title, task.objective));
        }
        lines.join("\n")
    }
}

impl Output for Task {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("{} {} ({})", self.id, self.title, percent(self.progress))
    }
}

/// Parse a `"Title: objective"` task argument.
pub fn parse_task_spec(arg: &str) -> Result<TaskSpec> {
    let (title, objective) = arg.split_once(':').ok_or_else(|| {
        Error::Validation(format!("Expected \"Title: objective\", got '{}'", arg))
    })?;
    Ok(TaskSpec {
        title: title.trim().to_string(),
        objective: objective.trim().to_string(),
    })
}

pub async fn task_define(engine: &Engine, project_id: &str, args: &[String]) -> Result<TaskList> {
    let specs = args
        .iter()
        .map(|arg| parse_task_spec(arg))
        .collect::<Result<Vec<_>>>()?;
    let tasks = engine.define_root_tasks(project_id, &specs).await?;
    Ok(TaskList {
        count: tasks.len(),
        tasks,
    })
}

#[derive(Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub steps: Vec<Step>,
    pub child_tasks: Vec<Task>,
}

impl Output for TaskView {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let t = &self.task;
        let mut lines = vec![
            format!("{} {} ({})", t.id, t.title, percent(t.progress)),
            format!("  {}", t.objective),
        ];
        if let Some(parent) = &t.parent_task_id {
            lines.push(format!("  parent: {}", parent));
        }
        for step in &self.steps {
            lines.push(format!("  step {} {} [{}]", step.id, step.title, step.status));
        }
        for child in &self.child_tasks {
            lines.push(format!(
                "  task {} {} ({})",
                child.id,
                child.title,
                percent(child.progress)
            ));
        }
        lines.join("\n")
    }
}

pub async fn task_show(engine: &Engine, id: &str) -> Result<TaskView> {
    let task = engine.get_task(id).await?;
    let steps = engine.list_steps(id).await?;
    let child_tasks = engine.read(|s| s.list_child_tasks(id)).await?;
    Ok(TaskView {
        task,
        steps,
        child_tasks,
    })
}

pub async fn task_delete(engine: &Engine, id: &str) -> Result<Deleted> {
    engine.delete_task(id).await?;
    Ok(Deleted {
        kind: "task",
        id: id.to_string(),
    })
}

// === Steps ===

impl Output for Step {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "{} {} [{}] iteration {}",
            self.id, self.title, self.status, self.iteration_count
        )];
        if let Some(content) = &self.final_content {
            lines.push(format!("  final: {}", content));
        } else if let Some(content) = &self.producer_content {
            lines.push(format!("  draft: {}", content));
        }
        if let Some(feedback) = &self.reviewer_feedback {
            lines.push(format!("  feedback: {}", feedback));
        }
        if let Some(level) = self.reconciled_complexity {
            lines.push(format!(
                "  complexity: {} (promote: {})",
                level,
                self.should_promote.unwrap_or(false)
            ));
        }
        lines.join("\n")
    }
}

#[derive(Serialize)]
pub struct StepView {
    #[serde(flatten)]
    pub step: Step,
    pub iterations: Vec<IterationRecord>,
    pub assessments: Vec<ComplexityAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_dispute: Option<String>,
}

impl Output for StepView {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = self.step.to_human();
        for record in &self.iterations {
            out.push_str(&format!(
                "\n  round {}: {}",
                record.iteration,
                record.reviewer_feedback.as_deref().unwrap_or("-")
            ));
        }
        for a in &self.assessments {
            out.push_str(&format!(
                "\n  {} says {} ({:.2}, confidence {:.2})",
                a.agent, a.level, a.score, a.confidence
            ));
        }
        if let Some(dispute) = &self.pending_dispute {
            out.push_str(&format!("\n  pending dispute: {}", dispute));
        }
        out
    }
}

pub async fn step_create(
    engine: &Engine,
    task_id: &str,
    title: &str,
    prev: Option<&str>,
    next: Option<&str>,
) -> Result<Step> {
    engine
        .create_step(
            task_id,
            title,
            NodeRef::parse_optional(prev)?,
            NodeRef::parse_optional(next)?,
        )
        .await
}

pub async fn step_show(engine: &Engine, id: &str) -> Result<StepView> {
    engine
        .read(|s| {
            Ok(StepView {
                step: s.get_step(id)?,
                iterations: s.list_iterations(id)?,
                assessments: s.list_assessments(id)?,
                pending_dispute: s.pending_dispute_for_step(id)?.map(|d| d.id),
            })
        })
        .await
}

pub async fn step_delete(engine: &Engine, id: &str) -> Result<Deleted> {
    engine.delete_step(id).await?;
    Ok(Deleted {
        kind: "step",
        id: id.to_string(),
    })
}

impl Output for WorkItem {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match self {
            WorkItem::Task(task) => format!("task {}", task.to_human()),
            WorkItem::Step(step) => format!("step {}", step.to_human()),
        }
    }
}

pub async fn step_link(
    engine: &Engine,
    node: &str,
    prev: Option<&str>,
    next: Option<&str>,
) -> Result<WorkItem> {
    let node: NodeRef = node.parse()?;
    engine
        .set_links(
            &node,
            NodeRef::parse_optional(prev)?,
            NodeRef::parse_optional(next)?,
        )
        .await
}

impl Output for PromotionRecord {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Promoted step {} '{}' to task {} with {} child step(s)",
            self.step_id,
            self.step_title,
            self.task.id,
            self.child_step_ids.len()
        )
    }
}

// === Collaboration ===

/// Record a reviewer decision, or ask the reviewer agent for one.
pub async fn review(
    engine: &Engine,
    step_id: &str,
    approve: bool,
    content: Option<String>,
    feedback: Option<String>,
    generate: bool,
) -> Result<Step> {
    if generate {
        return engine.request_review(step_id, None).await;
    }
    let decision = ReviewerDecision {
        approve,
        final_content: content,
        feedback,
    };
    engine.submit_reviewer_decision(step_id, &decision).await
}

// === Complexity ===

#[derive(Serialize)]
pub struct AnalysisResult {
    pub assessments: Vec<ComplexityAssessment>,
    pub step: Step,
}

impl Output for AnalysisResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        for a in &self.assessments {
            lines.push(format!(
                "{}: {} ({:.2}, confidence {:.2}, promote: {})",
                a.agent, a.level, a.score, a.confidence, a.should_promote
            ));
            for reason in &a.reasons {
                lines.push(format!("  - {}", reason));
            }
        }
        match (self.step.reconciled_complexity, self.step.complexity_score) {
            (Some(level), Some(score)) => lines.push(format!(
                "reconciled: {} ({:.2}), promote: {}",
                level,
                score,
                self.step.should_promote.unwrap_or(false)
            )),
            _ => lines.push("reconciled: waiting for the other agent".to_string()),
        }
        lines.join("\n")
    }
}

/// Analyse a step as `producer`, `reviewer` or `both`.
pub async fn complexity_analyze(engine: &Engine, step_id: &str, agent: &str) -> Result<AnalysisResult> {
    let agents = if agent.eq_ignore_ascii_case("both") {
        vec![Agent::Producer, Agent::Reviewer]
    } else {
        vec![agent.parse::<Agent>()?]
    };
    let mut assessments = Vec::with_capacity(agents.len());
    for agent in agents {
        assessments.push(engine.analyze_complexity(step_id, agent, None).await?);
    }
    Ok(AnalysisResult {
        assessments,
        step: engine.get_step(step_id).await?,
    })
}

impl Output for OptimizationResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "{} pass(es), {} analysed, {} promoted, {} failed ({:?})",
            self.passes,
            self.analyzed,
            self.promotions.len(),
            self.failures.len(),
            self.stop_reason
        )];
        for p in &self.promotions {
            lines.push(format!("  {}", p.to_human()));
        }
        for f in &self.failures {
            lines.push(format!("  {} failed during {}: {}", f.step_id, f.stage, f.message));
        }
        if !self.converged {
            lines.push("  Not converged; run again to continue.".to_string());
        }
        lines.join("\n")
    }
}

// === Disputes ===

#[derive(Serialize)]
pub struct DisputeList {
    pub disputes: Vec<Dispute>,
    pub count: usize,
}

impl Output for DisputeList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.disputes.is_empty() {
            return "No disputes.".to_string();
        }
        let mut lines = vec![format!("{} dispute(s):", self.count)];
        for d in &self.disputes {
            lines.push(format!(
                "  {} step {} [{}] {} round(s)",
                d.id,
                d.step_id,
                d.status,
                d.history.len()
            ));
        }
        lines.join("\n")
    }
}

impl Output for Dispute {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("{} step {} [{}]", self.id, self.step_id, self.status)];
        lines.push(format!(
            "  producer: {}",
            self.producer_content.as_deref().unwrap_or("-")
        ));
        lines.push(format!(
            "  reviewer: {}",
            self.reviewer_content
                .as_deref()
                .or(self.reviewer_reasoning.as_deref())
                .unwrap_or("-")
        ));
        if let Some(resolution) = &self.resolution {
            lines.push(format!("  resolved ({}): {}", resolution.kind, resolution.content));
        }
        lines.join("\n")
    }
}

pub async fn dispute_list(engine: &Engine, project: Option<&str>, all: bool) -> Result<DisputeList> {
    let status = if all { None } else { Some(DisputeStatus::Pending) };
    let disputes = engine.list_disputes(project, status).await?;
    Ok(DisputeList {
        count: disputes.len(),
        disputes,
    })
}

pub async fn dispute_resolve(
    engine: &Engine,
    id: &str,
    resolution: &str,
    content: Option<&str>,
) -> Result<Step> {
    let kind: ResolutionKind = resolution.parse()?;
    engine.resolve_dispute(id, kind, content).await
}

// === Navigation ===

impl Output for ChainWalk {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        for item in self.backward.iter().rev() {
            lines.push(format!("  {} {}", item.node_ref(), item.title()));
        }
        lines.push(format!("> {} {}", self.start.node_ref(), self.start.title()));
        for item in &self.forward {
            lines.push(format!("  {} {}", item.node_ref(), item.title()));
        }
        if self.truncated {
            lines.push("  ...".to_string());
        }
        lines.join("\n")
    }
}

pub async fn chain(engine: &Engine, start: &str, direction: &str, depth: usize) -> Result<ChainWalk> {
    let start: NodeRef = start.parse()?;
    let direction: Direction = direction.parse()?;
    engine.traverse_chain(&start, direction, depth).await
}

// === Audit log ===

#[derive(Serialize)]
pub struct LogEntries {
    pub records: Vec<AuditRecord>,
    pub count: usize,
}

impl Output for LogEntries {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.records.is_empty() {
            return "No audit records.".to_string();
        }
        self.records
            .iter()
            .map(|record| match record {
                AuditRecord::Change {
                    timestamp,
                    entity,
                    id,
                    change,
                    detail,
                    ..
                } => format!(
                    "{} {:?} {} {}{}",
                    timestamp.format("%Y-%m-%d %H:%M:%S"),
                    change,
                    entity,
                    id,
                    detail.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default()
                ),
                AuditRecord::Command {
                    timestamp,
                    command,
                    success,
                    ..
                } => format!(
                    "{} duet {}{}",
                    timestamp.format("%Y-%m-%d %H:%M:%S"),
                    command,
                    if *success { "" } else { " (failed)" }
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Read the audit log, optionally only records mentioning `id`.
pub fn log(config: &ResolvedConfig, id: Option<&str>, limit: Option<usize>) -> Result<LogEntries> {
    let Some(path) = config.audit_log_file() else {
        return Err(Error::Validation("The audit log is disabled".to_string()));
    };
    let mut records: Vec<AuditRecord> = AuditLog::new(path)
        .read_all()?
        .into_iter()
        .filter(|record| match (id, record) {
            (None, _) => true,
            (Some(id), AuditRecord::Change {
                id: entity_id,
                project_id,
                ..
            }) => entity_id == id || project_id.as_deref() == Some(id),
            (Some(id), AuditRecord::Command { args, entities, .. }) => {
                entities.iter().any(|entity| entity == id) || args.to_string().contains(id)
            }
        })
        .collect();
    if let Some(limit) = limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }
    Ok(LogEntries {
        count: records.len(),
        records,
    })
}

// === Config ===

pub struct ConfigView(pub serde_json::Value);

impl Output for ConfigView {
    fn to_json(&self) -> String {
        self.0.to_string()
    }

    fn to_human(&self) -> String {
        let Some(map) = self.0.as_object() else {
            return self.0.to_string();
        };
        map.iter()
            .map(|(key, entry)| format!("{} = {} ({})", key, entry["value"], entry["source"].as_str().unwrap_or("?")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn config_show(config: &ResolvedConfig) -> ConfigView {
    ConfigView(config.to_json())
}

#[derive(Serialize)]
pub struct ConfigSet {
    pub key: String,
    pub value: String,
    pub path: PathBuf,
}

impl Output for ConfigSet {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Set {} = {} in {}", self.key, self.value, self.path.display())
    }
}

/// Write one key to the workspace config.kdl.
pub fn config_set(data_dir: &Path, key: &str, value: &str) -> Result<ConfigSet> {
    let path = workspace_config_path(data_dir);
    let mut config = DuetConfig::load(&path)?;
    config.set(key, value)?;
    config.save(&path)?;
    Ok(ConfigSet {
        key: key.to_string(),
        value: value.to_string(),
        path,
    })
}

//! Column codecs and row mappers.
//!
//! Enum-valued and reference-valued columns are stored as their canonical
//! text form; this is the only place that form crosses into SQL.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;

use crate::models::complexity::ComplexityAssessment;
use crate::models::{
    Agent, ComplexityLevel, Dispute, DisputeResolution, DisputeStatus, IterationRecord, NodeRef,
    Project, ResolutionKind, Step, StepStatus, Task,
};

macro_rules! text_column {
    ($($ty:ty),* $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.to_string()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: crate::Error| FromSqlError::Other(Box::new(e)))
            }
        }
    )*};
}

text_column!(
    NodeRef,
    StepStatus,
    ComplexityLevel,
    Agent,
    DisputeStatus,
    ResolutionKind,
);

pub(crate) const PROJECT_COLUMNS: &str = "id, name, description, progress, complexity_threshold, \
     max_iterations, version, created_at, updated_at";

pub(crate) const TASK_COLUMNS: &str = "id, project_id, parent_task_id, title, objective, progress, \
     prev_ref, next_ref, position, version, created_at, updated_at";

pub(crate) const STEP_COLUMNS: &str = "id, task_id, title, prev_ref, next_ref, position, progress, \
     status, iteration_count, producer_content, producer_reasoning, focus_hint, reviewer_content, \
     reviewer_feedback, final_content, producer_complexity, reviewer_complexity, \
     reconciled_complexity, complexity_score, should_promote, version, created_at, updated_at";

pub(crate) const DISPUTE_COLUMNS: &str = "id, project_id, step_id, producer_content, \
     producer_reasoning, reviewer_content, reviewer_reasoning, history, status, resolution_kind, \
     resolved_content, resolved_at, version, created_at, updated_at";

pub(crate) const ITERATION_COLUMNS: &str = "step_id, iteration, producer_content, \
     producer_reasoning, reviewer_content, reviewer_feedback, recorded_at";

pub(crate) const ASSESSMENT_COLUMNS: &str =
    "agent, level, score, should_promote, confidence, reasons";

pub(crate) fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        progress: row.get(3)?,
        complexity_threshold: row.get(4)?,
        max_iterations: row.get(5)?,
        version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        parent_task_id: row.get(2)?,
        title: row.get(3)?,
        objective: row.get(4)?,
        progress: row.get(5)?,
        prev_ref: row.get(6)?,
        next_ref: row.get(7)?,
        position: row.get(8)?,
        version: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub(crate) fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        task_id: row.get(1)?,
        title: row.get(2)?,
        prev_ref: row.get(3)?,
        next_ref: row.get(4)?,
        position: row.get(5)?,
        progress: row.get(6)?,
        status: row.get(7)?,
        iteration_count: row.get(8)?,
        producer_content: row.get(9)?,
        producer_reasoning: row.get(10)?,
        focus_hint: row.get(11)?,
        reviewer_content: row.get(12)?,
        reviewer_feedback: row.get(13)?,
        final_content: row.get(14)?,
        producer_complexity: row.get(15)?,
        reviewer_complexity: row.get(16)?,
        reconciled_complexity: row.get(17)?,
        complexity_score: row.get(18)?,
        should_promote: row.get(19)?,
        version: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

pub(crate) fn dispute_from_row(row: &Row<'_>) -> rusqlite::Result<Dispute> {
    let history_json: String = row.get(7)?;
    let history: Vec<IterationRecord> = serde_json::from_str(&history_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let kind: Option<ResolutionKind> = row.get(9)?;
    let content: Option<String> = row.get(10)?;
    let resolved_at = row.get(11)?;
    let resolution = match (kind, content, resolved_at) {
        (Some(kind), Some(content), Some(resolved_at)) => Some(DisputeResolution {
            kind,
            content,
            resolved_at,
        }),
        _ => None,
    };

    Ok(Dispute {
        id: row.get(0)?,
        project_id: row.get(1)?,
        step_id: row.get(2)?,
        producer_content: row.get(3)?,
        producer_reasoning: row.get(4)?,
        reviewer_content: row.get(5)?,
        reviewer_reasoning: row.get(6)?,
        history,
        status: row.get(8)?,
        resolution,
        version: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

pub(crate) fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<IterationRecord> {
    Ok(IterationRecord {
        step_id: row.get(0)?,
        iteration: row.get(1)?,
        producer_content: row.get(2)?,
        producer_reasoning: row.get(3)?,
        reviewer_content: row.get(4)?,
        reviewer_feedback: row.get(5)?,
        recorded_at: row.get(6)?,
    })
}

pub(crate) fn assessment_from_row(row: &Row<'_>) -> rusqlite::Result<ComplexityAssessment> {
    let reasons_json: String = row.get(5)?;
    let reasons: Vec<String> = serde_json::from_str(&reasons_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ComplexityAssessment {
        agent: row.get(0)?,
        level: row.get(1)?,
        score: row.get(2)?,
        should_promote: row.get(3)?,
        confidence: row.get(4)?,
        reasons,
    })
}

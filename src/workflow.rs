//! Collaboration state machine for steps.
//!
//! The transition table lives in [`next_status`]; the `apply_*` functions
//! mutate a [`Step`] value in place so that every piece of iteration state
//! (status, revision count, latest drafts) travels with the step itself.
//!
//! ```text
//! Pending ──submit──▶ ProducerDraft ──ready──▶ ReviewerReview ──approve──▶ Agreed
//!                         ▲                          │
//!                         └──────── revise ──────────┤
//!                                                    └─limit──▶ Disputed ─▶ UserResolution ─▶ Agreed
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::{non_empty, IterationRecord, Step, StepStatus};
use crate::{Error, Result};

/// Inputs that move a step between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    /// Producer supplied (new) content
    ProducerSubmitted,
    /// Producer marked its draft ready for review
    ProducerReady,
    ReviewerApproved,
    RevisionRequested,
    /// A revision request would exhaust the iteration budget
    IterationLimitReached,
    /// A human started applying a dispute resolution
    ResolutionStarted,
    ResolutionApplied,
}

/// Compute the status reached by applying `event` in `from`.
pub fn next_status(from: StepStatus, event: StepEvent) -> Result<StepStatus> {
    use StepEvent::*;
    use StepStatus::*;

    let to = match (from, event) {
        (Pending, ProducerSubmitted) | (ProducerDraft, ProducerSubmitted) => ProducerDraft,
        (ProducerDraft, ProducerReady) => ReviewerReview,
        (ReviewerReview, ReviewerApproved) => Agreed,
        (ReviewerReview, RevisionRequested) => ProducerDraft,
        (ReviewerReview, IterationLimitReached) => Disputed,
        (Disputed, ResolutionStarted) => UserResolution,
        (UserResolution, ResolutionApplied) => Agreed,
        (from, event) => {
            return Err(Error::InvalidTransition(format!(
                "cannot apply {:?} to a step in status '{}'",
                event, from
            )));
        }
    };
    Ok(to)
}

/// A reviewer's verdict on the current draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerDecision {
    /// Approve the draft as final
    pub approve: bool,

    /// Refined final content (on approval) or a counter-proposal (on revision)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,

    /// What the producer should change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ReviewerDecision {
    pub fn approve(final_content: Option<String>) -> Self {
        Self {
            approve: true,
            final_content,
            feedback: None,
        }
    }

    pub fn revise(feedback: impl Into<String>) -> Self {
        Self {
            approve: false,
            final_content: None,
            feedback: Some(feedback.into()),
        }
    }
}

/// What a review did to the step.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    Agreed,
    /// Sent back to the producer; the round is recorded
    RevisionRequested(IterationRecord),
    /// Iteration budget exhausted; the last round is recorded and a dispute must be opened
    Disputed(IterationRecord),
}

fn transition(step: &mut Step, event: StepEvent) -> Result<()> {
    step.status = next_status(step.status, event)?;
    Ok(())
}

/// Record a producer draft and hand it to the reviewer.
///
/// Valid from `Pending` (first draft) and `ProducerDraft` (revision).
pub fn apply_producer_submission(
    step: &mut Step,
    content: &str,
    reasoning: &str,
    focus_hint: Option<&str>,
) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::Validation("Producer content must not be empty".to_string()));
    }

    transition(step, StepEvent::ProducerSubmitted)?;
    step.producer_content = Some(content.to_string());
    step.producer_reasoning = non_empty(Some(reasoning)).map(str::to_string);
    step.focus_hint = non_empty(focus_hint).map(str::to_string);
    transition(step, StepEvent::ProducerReady)?;

    step.updated_at = Utc::now();
    Ok(())
}

/// Apply a reviewer decision under the project's iteration budget.
pub fn apply_review(
    step: &mut Step,
    decision: &ReviewerDecision,
    max_iterations: u32,
) -> Result<ReviewOutcome> {
    if step.status != StepStatus::ReviewerReview {
        return Err(Error::InvalidTransition(format!(
            "step {} is '{}', not awaiting review",
            step.id, step.status
        )));
    }

    if decision.approve {
        if step.iteration_count >= max_iterations {
            return Err(Error::IterationLimitExceeded(format!(
                "step {} has used {} of {} iterations and cannot be approved",
                step.id, step.iteration_count, max_iterations
            )));
        }

        let refined = non_empty(decision.final_content.as_deref());
        let final_content = refined
            .or_else(|| non_empty(step.producer_content.as_deref()))
            .ok_or_else(|| {
                Error::InvalidTransition(format!(
                    "step {} cannot be agreed without final content",
                    step.id
                ))
            })?
            .to_string();

        transition(step, StepEvent::ReviewerApproved)?;
        if let Some(refined) = refined {
            step.reviewer_content = Some(refined.to_string());
        }
        step.final_content = Some(final_content);
        step.progress = step.derived_progress();
        step.updated_at = Utc::now();
        return Ok(ReviewOutcome::Agreed);
    }

    let feedback = non_empty(decision.feedback.as_deref()).ok_or_else(|| {
        Error::Validation("A revision request must include feedback".to_string())
    })?;

    step.reviewer_feedback = Some(feedback.to_string());
    step.reviewer_content = non_empty(decision.final_content.as_deref()).map(str::to_string);

    let iteration = step.iteration_count + 1;
    let record = IterationRecord {
        step_id: step.id.clone(),
        iteration,
        producer_content: step.producer_content.clone(),
        producer_reasoning: step.producer_reasoning.clone(),
        reviewer_content: step.reviewer_content.clone(),
        reviewer_feedback: step.reviewer_feedback.clone(),
        recorded_at: Utc::now(),
    };

    step.iteration_count = iteration.min(max_iterations);
    step.updated_at = record.recorded_at;

    if iteration >= max_iterations {
        transition(step, StepEvent::IterationLimitReached)?;
        Ok(ReviewOutcome::Disputed(record))
    } else {
        transition(step, StepEvent::RevisionRequested)?;
        Ok(ReviewOutcome::RevisionRequested(record))
    }
}

/// Apply a human resolution to a disputed step.
pub fn apply_resolution(step: &mut Step, content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::Validation("Resolved content must not be empty".to_string()));
    }
    transition(step, StepEvent::ResolutionStarted)?;
    step.final_content = Some(content.to_string());
    transition(step, StepEvent::ResolutionApplied)?;
    step.progress = step.derived_progress();
    step.updated_at = Utc::now();
    Ok(())
}

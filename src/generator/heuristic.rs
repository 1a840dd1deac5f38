use async_trait::async_trait;

use super::{ContentGenerator, Draft, ProjectContext, StepContext, StepOutline, TaskOutline};
use crate::models::complexity::{inspect_step, list_items, ComplexityAssessment};
use crate::models::Agent;
use crate::workflow::ReviewerDecision;
use crate::Result;

/// Longest title the heuristic generator will produce.
const MAX_TITLE_CHARS: usize = 80;

/// Drafts shorter than this are sent back.
const MIN_DRAFT_CHARS: usize = 20;

/// Most child steps a decomposition proposes.
const MAX_CHILD_STEPS: usize = 8;

/// Deterministic offline stand-in for both agents.
#[derive(Debug, Clone, Default)]
pub struct HeuristicGenerator;

impl HeuristicGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContentGenerator for HeuristicGenerator {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn draft_step(&self, ctx: &StepContext) -> Result<Draft> {
        if let (Some(previous), Some(feedback)) = (&ctx.previous_draft, &ctx.previous_feedback) {
            return Ok(Draft {
                content: format!("{}\n\nRevision {}: {}", previous.trim(), ctx.iteration, feedback.trim()),
                reasoning: format!("Addresses reviewer feedback from round {}", ctx.iteration),
            });
        }

        let mut content = format!("{}: {}", ctx.step_title.trim(), ctx.task_objective.trim());
        if let Some(last) = ctx.prior_steps.last() {
            content.push_str(&format!("\nBuilds on: {}", last));
        }
        if let Some(hint) = ctx.focus_hint.as_deref().filter(|h| !h.trim().is_empty()) {
            content.push_str(&format!("\nFocus: {}", hint.trim()));
        }

        Ok(Draft {
            content,
            reasoning: format!("Derived from the objective of '{}'", ctx.task_title),
        })
    }

    async fn review_step(&self, _ctx: &StepContext, content: &str) -> Result<ReviewerDecision> {
        let trimmed = content.trim();
        if trimmed.chars().count() < MIN_DRAFT_CHARS {
            return Ok(ReviewerDecision::revise(
                "Draft is too short to act on; describe the concrete approach",
            ));
        }
        if trimmed.contains("TODO") {
            return Ok(ReviewerDecision::revise("Draft still contains TODO markers"));
        }
        Ok(ReviewerDecision::approve(None))
    }

    async fn assess_complexity(
        &self,
        agent: Agent,
        ctx: &StepContext,
        content: &str,
    ) -> Result<ComplexityAssessment> {
        let mut found = inspect_step(&ctx.step_title, Some(content));
        if agent == Agent::Reviewer {
            let objective_len = ctx.task_objective.trim().len().max(1);
            if content.trim().len() > objective_len * 8 {
                found.add(1, "content dwarfs the task objective");
            }
        }
        Ok(ComplexityAssessment::from_score(agent, &found, ctx.complexity_threshold))
    }

    async fn decompose_step(&self, ctx: &StepContext, content: &str) -> Result<Vec<StepOutline>> {
        let mut parts = list_items(content);
        if parts.len() < 2 {
            parts = sentences(content);
        }
        if parts.len() < 2 {
            let title = ctx.step_title.trim();
            parts = vec![
                format!("Plan {}", title),
                format!("Implement {}", title),
                format!("Verify {}", title),
            ];
        }

        Ok(parts
            .into_iter()
            .take(MAX_CHILD_STEPS)
            .map(|part| StepOutline {
                title: truncate_title(&part),
            })
            .collect())
    }

    async fn plan_tasks(&self, ctx: &ProjectContext) -> Result<Vec<TaskOutline>> {
        let mut parts = list_items(&ctx.description);
        if parts.is_empty() {
            parts = sentences(&ctx.description);
        }

        let outlines: Vec<TaskOutline> = parts
            .into_iter()
            .filter(|part| !ctx.existing_tasks.iter().any(|t| t == &truncate_title(part)))
            .map(|part| TaskOutline {
                title: truncate_title(&part),
                objective: part,
            })
            .collect();

        if outlines.is_empty() && ctx.existing_tasks.is_empty() {
            return Ok(vec![TaskOutline {
                title: truncate_title(&ctx.name),
                objective: ctx.description.clone(),
            }]);
        }
        Ok(outlines)
    }
}

/// Split text into trimmed sentences.
fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '\n', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn truncate_title(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_TITLE_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext {
        StepContext {
            project_name: "Shop".to_string(),
            project_description: "An online shop".to_string(),
            task_title: "Checkout".to_string(),
            task_objective: "Let customers pay".to_string(),
            step_title: "Card payments".to_string(),
            max_iterations: 3,
            complexity_threshold: 0.7,
            ..StepContext::default()
        }
    }

    #[tokio::test]
    async fn test_first_draft_uses_objective_and_hint() {
        let mut ctx = ctx();
        ctx.prior_steps = vec!["Cart".to_string()];
        ctx.focus_hint = Some("PCI".to_string());
        let draft = HeuristicGenerator::new().draft_step(&ctx).await.unwrap();
        assert!(draft.content.starts_with("Card payments: Let customers pay"));
        assert!(draft.content.contains("Builds on: Cart"));
        assert!(draft.content.contains("Focus: PCI"));
    }

    #[tokio::test]
    async fn test_revision_folds_in_feedback() {
        let mut ctx = ctx();
        ctx.previous_draft = Some("Use Stripe".to_string());
        ctx.previous_feedback = Some("Mention refunds".to_string());
        ctx.iteration = 1;
        let draft = HeuristicGenerator::new().draft_step(&ctx).await.unwrap();
        assert!(draft.content.contains("Use Stripe"));
        assert!(draft.content.contains("Mention refunds"));
    }

    #[tokio::test]
    async fn test_review_rejects_short_and_todo_drafts() {
        let generator = HeuristicGenerator::new();
        let short = generator.review_step(&ctx(), "tiny").await.unwrap();
        assert!(!short.approve);
        assert!(short.feedback.is_some());

        let todo = generator
            .review_step(&ctx(), "Integrate the card processor. TODO: fees")
            .await
            .unwrap();
        assert!(!todo.approve);

        let fine = generator
            .review_step(&ctx(), "Integrate the card processor via its hosted form")
            .await
            .unwrap();
        assert!(fine.approve);
    }

    #[tokio::test]
    async fn test_decompose_prefers_list_items() {
        let steps = HeuristicGenerator::new()
            .decompose_step(&ctx(), "Plan:\n1. Tokenize cards\n2. Charge\n3. Refund")
            .await
            .unwrap();
        let titles: Vec<_> = steps.into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["Tokenize cards", "Charge", "Refund"]);
    }

    #[tokio::test]
    async fn test_decompose_falls_back_to_phases() {
        let steps = HeuristicGenerator::new()
            .decompose_step(&ctx(), "one blob")
            .await
            .unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].title, "Plan Card payments");
    }

    #[tokio::test]
    async fn test_plan_tasks_from_sentences() {
        let plan = HeuristicGenerator::new()
            .plan_tasks(&ProjectContext {
                name: "Shop".to_string(),
                description: "Build a catalog. Add checkout.".to_string(),
                existing_tasks: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].title, "Add checkout");
    }

    #[tokio::test]
    async fn test_reviewer_weighs_objective() {
        let generator = HeuristicGenerator::new();
        let content = "a".repeat(300);
        let producer = generator
            .assess_complexity(Agent::Producer, &ctx(), &content)
            .await
            .unwrap();
        let reviewer = generator
            .assess_complexity(Agent::Reviewer, &ctx(), &content)
            .await
            .unwrap();
        assert!(reviewer.score > producer.score);
        assert_eq!(reviewer.agent, Agent::Reviewer);
    }

    #[test]
    fn test_truncate_title() {
        assert_eq!(truncate_title("  short "), "short");
        let long = truncate_title(&"x".repeat(200));
        assert_eq!(long.chars().count(), MAX_TITLE_CHARS);
        assert!(long.ends_with("..."));
    }
}

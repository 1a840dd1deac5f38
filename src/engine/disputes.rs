//! Dispute listing and human resolution.

use tracing::info;

use super::Engine;
use crate::models::{Dispute, DisputeStatus, ResolutionKind, Step};
use crate::storage::Queries;
use crate::workflow::apply_resolution;
use crate::{Error, Result};

impl Engine {
    /// Pending disputes, oldest first. With a project id, only that
    /// project's disputes; the project must exist.
    pub async fn list_pending_disputes(&self, project_id: Option<&str>) -> Result<Vec<Dispute>> {
        self.list_disputes(project_id, Some(DisputeStatus::Pending)).await
    }

    pub async fn list_disputes(
        &self,
        project_id: Option<&str>,
        status: Option<DisputeStatus>,
    ) -> Result<Vec<Dispute>> {
        self.read(|s| {
            if let Some(id) = project_id {
                s.get_project(id)?;
            }
            s.list_disputes(project_id, status)
        })
        .await
    }

    pub async fn get_dispute(&self, dispute_id: &str) -> Result<Dispute> {
        self.read(|s| s.get_dispute(dispute_id)).await
    }

    /// Settle a dispute and move its step to `Agreed` with the chosen content.
    ///
    /// `Custom` and `Hybrid` need `content`; the other kinds take the
    /// corresponding agent's final-iteration position. The dispute and the
    /// step change together or not at all.
    pub async fn resolve_dispute(
        &self,
        dispute_id: &str,
        kind: ResolutionKind,
        content: Option<&str>,
    ) -> Result<Step> {
        let step = self
            .write(|tx| {
                let mut dispute = tx.get_dispute(dispute_id)?;
                if !dispute.is_pending() {
                    return Err(Error::InvalidTransition(format!(
                        "Dispute {} is already resolved",
                        dispute.id
                    )));
                }
                let resolved = dispute.resolved_content(kind, content)?;

                let mut step = tx.get_step(&dispute.step_id)?;
                apply_resolution(&mut step, &resolved)?;
                tx.update_step(&mut step)?;

                dispute.resolve(kind, resolved)?;
                tx.update_dispute(&mut dispute)?;
                Ok(step)
            })
            .await?;
        info!(dispute = %dispute_id, step = %step.id, resolution = %kind, "dispute resolved");
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepStatus, TaskSpec};
    use crate::test_utils::TestEnv;
    use crate::workflow::ReviewerDecision;
    use crate::ErrorKind;

    async fn disputed(engine: &Engine) -> (String, Step, Dispute) {
        let project = engine.create_project("P", "Desc", None, Some(1)).await.unwrap();
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
            .submit_producer_content(&step.id, "producer text", "because", None)
            .await
            .unwrap();
        let mut decision = ReviewerDecision::revise("Too vague");
        decision.final_content = Some("reviewer text".to_string());
        let step = engine.submit_reviewer_decision(&step.id, &decision).await.unwrap();
        assert_eq!(step.status, StepStatus::Disputed);
        let dispute = engine
            .list_pending_disputes(Some(&project.id))
            .await
            .unwrap()
            .remove(0);
        (project.id, step, dispute)
    }

    #[tokio::test]
    async fn test_custom_resolution_agrees_step() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let (project_id, step, dispute) = disputed(&engine).await;

        let resolved = engine
            .resolve_dispute(&dispute.id, ResolutionKind::Custom, Some("X"))
            .await
            .unwrap();
        assert_eq!(resolved.id, step.id);
        assert_eq!(resolved.status, StepStatus::Agreed);
        assert_eq!(resolved.final_content.as_deref(), Some("X"));
        assert_eq!(resolved.progress, 1.0);

        let dispute = engine.get_dispute(&dispute.id).await.unwrap();
        assert_eq!(dispute.status, DisputeStatus::Resolved);
        let resolution = dispute.resolution.unwrap();
        assert_eq!(resolution.kind, ResolutionKind::Custom);
        assert_eq!(resolution.content, "X");

        assert!(engine.list_pending_disputes(Some(&project_id)).await.unwrap().is_empty());
        assert_eq!(engine.get_project(&project_id).await.unwrap().progress, 1.0);
    }

    #[tokio::test]
    async fn test_use_producer_and_use_reviewer() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let (_, _, first) = disputed(&engine).await;
        let step = engine
            .resolve_dispute(&first.id, ResolutionKind::UseProducer, None)
            .await
            .unwrap();
        assert_eq!(step.final_content.as_deref(), Some("producer text"));

        let (_, _, second) = disputed(&engine).await;
        let step = engine
            .resolve_dispute(&second.id, ResolutionKind::UseReviewer, None)
            .await
            .unwrap();
        assert_eq!(step.final_content.as_deref(), Some("reviewer text"));
    }

    #[tokio::test]
    async fn test_custom_without_content_changes_nothing() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let (_, step, dispute) = disputed(&engine).await;

        let err = engine
            .resolve_dispute(&dispute.id, ResolutionKind::Custom, Some("  "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(engine.get_dispute(&dispute.id).await.unwrap().is_pending());
        assert_eq!(
            engine.get_step(&step.id).await.unwrap().status,
            StepStatus::Disputed
        );
    }

    #[tokio::test]
    async fn test_resolving_twice_is_rejected() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let (_, _, dispute) = disputed(&engine).await;
        engine
            .resolve_dispute(&dispute.id, ResolutionKind::Hybrid, Some("merged"))
            .await
            .unwrap();
        let err = engine
            .resolve_dispute(&dispute.id, ResolutionKind::Custom, Some("again"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_listing_filters() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let (project_id, _, dispute) = disputed(&engine).await;
        disputed(&engine).await;

        assert_eq!(engine.list_pending_disputes(None).await.unwrap().len(), 2);
        assert_eq!(engine.list_pending_disputes(Some(&project_id)).await.unwrap().len(), 1);

        engine
            .resolve_dispute(&dispute.id, ResolutionKind::UseReviewer, None)
            .await
            .unwrap();
        assert_eq!(engine.list_pending_disputes(None).await.unwrap().len(), 1);
        assert_eq!(
            engine
                .list_disputes(Some(&project_id), Some(DisputeStatus::Resolved))
                .await
                .unwrap()
                .len(),
            1
        );

        let err = engine.list_pending_disputes(Some("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = engine.get_dispute("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

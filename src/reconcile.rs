//! Reconciliation of two independent complexity opinions.
//!
//! Complexity analysis is a two-phase vote: each agent first assesses a step
//! on its own ([`ComplexityAssessment`]), then a [`ReconciliationPolicy`]
//! folds both opinions into one decision. The policy is a trait so that the
//! weighting and thresholds can be swapped without touching the engine.

use serde::{Deserialize, Serialize};

use crate::models::complexity::ComplexityAssessment;
use crate::models::ComplexityLevel;

/// Which rule produced a reconciled decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agreement {
    /// Same level and same recommendation
    Unanimous,
    /// Adjacent levels and nearby scores
    Close,
    /// Opinions diverge; confidence-weighted fallback
    Weighted,
}

/// The outcome of reconciling both agents' opinions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledComplexity {
    pub level: ComplexityLevel,
    /// Reconciled score in [0,1]
    pub score: f64,
    /// Combined confidence in [0,1]
    pub confidence: f64,
    pub should_promote: bool,
    pub agreement: Agreement,
}

/// Folds a producer and a reviewer opinion into one decision.
pub trait ReconciliationPolicy: Send + Sync {
    fn reconcile(
        &self,
        producer: &ComplexityAssessment,
        reviewer: &ComplexityAssessment,
        threshold: f64,
    ) -> ReconciledComplexity;
}

/// The default, promotion-averse policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultReconciliation {
    /// Extra weight on the reviewer, who sees the whole project
    pub reviewer_weight: f64,
    /// Largest score gap still treated as close agreement
    pub close_score_delta: f64,
    /// Weighted score needed to promote over a dissenting agent
    pub override_score: f64,
    /// Confidence at least one agent needs for an override
    pub override_confidence: f64,
}

impl Default for DefaultReconciliation {
    fn default() -> Self {
        Self {
            reviewer_weight: 1.1,
            close_score_delta: 0.2,
            override_score: 0.8,
            override_confidence: 0.8,
        }
    }
}

impl ReconciliationPolicy for DefaultReconciliation {
    fn reconcile(
        &self,
        producer: &ComplexityAssessment,
        reviewer: &ComplexityAssessment,
        threshold: f64,
    ) -> ReconciledComplexity {
        let mean_score = (producer.score + reviewer.score) / 2.0;
        let mean_confidence = (producer.confidence + reviewer.confidence) / 2.0;

        if producer.level == reviewer.level && producer.should_promote == reviewer.should_promote {
            return ReconciledComplexity {
                level: producer.level,
                score: mean_score,
                confidence: mean_confidence,
                should_promote: producer.should_promote,
                agreement: Agreement::Unanimous,
            };
        }

        let rank_gap = producer.level.rank().abs_diff(reviewer.level.rank());
        if rank_gap <= 1 && (producer.score - reviewer.score).abs() <= self.close_score_delta {
            return ReconciledComplexity {
                level: ComplexityLevel::from_score(mean_score),
                score: mean_score,
                confidence: mean_confidence,
                should_promote: mean_score > threshold,
                agreement: Agreement::Close,
            };
        }

        let producer_weight = producer.confidence;
        let reviewer_weight = reviewer.confidence * self.reviewer_weight;
        let total_weight = producer_weight + reviewer_weight;
        let weighted = if total_weight > 0.0 {
            (producer.score * producer_weight + reviewer.score * reviewer_weight) / total_weight
        } else {
            mean_score
        };

        let both_recommend = producer.should_promote && reviewer.should_promote;
        let confident = producer.confidence > self.override_confidence
            || reviewer.confidence > self.override_confidence;
        let should_promote = both_recommend || (weighted > self.override_score && confident);

        ReconciledComplexity {
            level: ComplexityLevel::from_score(weighted),
            score: weighted,
            confidence: mean_confidence,
            should_promote,
            agreement: Agreement::Weighted,
        }
    }
}

//! Duet - a collaborative task-decomposition engine.
//!
//! This library provides the core of the `duet` CLI tool: a hierarchical
//! project/task/step store, the two-agent refinement protocol that drives each
//! step to agreement, complexity-based promotion of steps into sub-tasks, and
//! dispute escalation to a human arbiter.

pub mod audit_log;
pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod generator;
pub mod models;
pub mod reconcile;
pub mod storage;
pub mod workflow;

use serde::{Deserialize, Serialize};
use std::fmt;


/// Library-level error type for Duet operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Iteration limit exceeded: {0}")]
    IterationLimitExceeded(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Generation backend unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Step {} already has pending dispute {}", .0.step_id, .0.id)]
    PendingDisputeExists(Box<models::Dispute>),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Duet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error classification carried by every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    StructuralViolation,
    InvalidTransition,
    IterationLimitExceeded,
    ConflictError,
    UpstreamUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::StructuralViolation => "StructuralViolation",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::IterationLimitExceeded => "IterationLimitExceeded",
            ErrorKind::ConflictError => "ConflictError",
            ErrorKind::UpstreamUnavailable => "UpstreamUnavailable",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Error {
    /// Classify this error for callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::StructuralViolation(_) | Error::PendingDisputeExists(_) => {
                ErrorKind::StructuralViolation
            }
            Error::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Error::IterationLimitExceeded(_) => ErrorKind::IterationLimitExceeded,
            Error::Conflict(_) => ErrorKind::ConflictError,
            Error::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Error::Io(_) | Error::Json(_) | Error::Database(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the caller may safely retry the failed operation.
    ///
    /// Validation and structural errors indicate a caller bug and are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConflictError | ErrorKind::UpstreamUnavailable)
    }

    /// Convert into the serializable wire form.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Wire form of an error: a machine-readable kind plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

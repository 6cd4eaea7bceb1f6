//! Error types for Ferrous CI.

use crate::run::RunPhase;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Workflow errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow validation failed: {0}")]
    WorkflowValidation(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already completed")]
    RunAlreadyCompleted,

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: RunPhase, to: RunPhase },

    // Backend errors
    #[error("Backend failed to start phase: {0}")]
    BackendSpawn(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidWorkflow(err.to_string())
    }
}

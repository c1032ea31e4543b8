//! Error types for the Strata operator

use thiserror::Error;

use crate::template::TemplateError;

/// Main error type for Strata operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Manifest rendering failed; the output must not be applied
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// A planner task failed
    #[error("planner task '{task}' failed: {message}")]
    Planner {
        /// Name of the task that failed
        task: String,
        /// Failure description
        message: String,
    },

    /// A bounded wait ran out of time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Internal invariant violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a planner error for the named task
    pub fn planner(task: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Planner {
            task: task.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

//! Error types for Convoy.

use std::time::Duration;
use thiserror::Error;

use crate::stack::OutputRef;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("cycle detected in unit references: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("unit '{from}' references unresolved output '{target}': {reason}")]
    UnresolvedReference {
        from: String,
        target: OutputRef,
        reason: String,
    },

    #[error("provisioning unit '{unit}' failed: {cause}")]
    Provisioning { unit: String, cause: String },

    #[error("artifact '{artifact}' already produced (stage '{stage}')")]
    DuplicateArtifact { artifact: String, stage: String },

    #[error("artifact '{artifact}' is not produced by any stage preceding '{stage}'")]
    ArtifactNotFound { artifact: String, stage: String },

    #[error("artifact '{artifact}' is not yet available to stage '{stage}' (producer '{producer}')")]
    ArtifactNotYetAvailable {
        artifact: String,
        stage: String,
        producer: String,
    },

    #[error("build failed: {0}")]
    Build(String),

    #[error("deployment of '{service}' failed: {message}")]
    DeployFailed { service: String, message: String },

    #[error("deployment of '{service}' did not converge within {}s", .budget.as_secs())]
    DeployTimedOut { service: String, budget: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Graph definition errors are raised before anything is provisioned.
    pub fn is_definition_error(&self) -> bool {
        matches!(self, Error::Cycle { .. } | Error::UnresolvedReference { .. })
    }

    /// Errors caused by how stages are wired to each other's artifacts.
    pub fn is_wiring_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateArtifact { .. }
                | Error::ArtifactNotFound { .. }
                | Error::ArtifactNotYetAvailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = Error::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "cycle detected in unit references: a -> b -> a"
        );
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_timeout_message_uses_seconds() {
        let err = Error::DeployTimedOut {
            service: "web".into(),
            budget: Duration::from_secs(600),
        };
        assert!(err.to_string().contains("600s"));
        assert!(!err.is_wiring_error());
    }
}

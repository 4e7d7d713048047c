// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for sidereap domain operations
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// Object metadata cannot be turned into a pod identity
    #[error("Invalid pod identity: {reason}")]
    #[diagnostic(
        code(sidereap::invalid_identity),
        help("Pod identities need a non-empty namespace and name. The object may be missing metadata.name")
    )]
    InvalidIdentity {
        #[allow(unused)]
        reason: String,
    },

    /// Pod not present in the authoritative pod state
    #[error("Pod not found: {pod}")]
    #[diagnostic(
        code(sidereap::pod_not_found),
        help("The pod was deleted or has not been observed yet. Nothing to reconcile")
    )]
    PodNotFound {
        #[allow(unused)]
        pod: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(sidereap::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid_identity(reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            reason: reason.into(),
        }
    }

    pub fn pod_not_found(pod: impl Into<String>) -> Self {
        Self::PodNotFound { pod: pod.into() }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Errors that will not go away by retrying the same work item
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidIdentity { .. } | CoreError::PodNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(CoreError::invalid_identity("no name").is_permanent());
        assert!(CoreError::pod_not_found("default/job-abc").is_permanent());
        assert!(!CoreError::internal_error("boom").is_permanent());
    }

    #[test]
    fn test_display_includes_pod() {
        let err = CoreError::pod_not_found("batch/job-abc");
        assert_eq!(err.to_string(), "Pod not found: batch/job-abc");
    }
}

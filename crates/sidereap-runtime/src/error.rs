use miette::Diagnostic;
use thiserror::Error;

/// Runtime error type for queueing, reconciliation and termination
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Pod cache did not finish its initial list in time
    #[error("Timed out after {timeout_secs}s waiting for the pod cache to sync")]
    #[diagnostic(
        code(sidereap::runtime::cache_sync_timeout),
        help("Check API server connectivity and that the service account may list and watch pods")
    )]
    CacheSyncTimeout {
        #[allow(unused)]
        timeout_secs: u64,
    },

    /// One or more sidecar containers could not be signaled
    #[error("Failed to signal {failed}/{attempted} sidecar containers in pod {pod}: {summary}")]
    #[diagnostic(
        code(sidereap::runtime::partial_termination),
        help("Containers that were signaled are unaffected by a retry. Verify the service account may create pods/exec and that the sidecar image ships `sh` and `kill`")
    )]
    PartialTermination {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        failed: usize,
        #[allow(unused)]
        attempted: usize,
        #[allow(unused)]
        summary: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(sidereap::runtime::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] sidereap_core::CoreError),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    #[diagnostic(
        code(sidereap::runtime::kube_error),
        help("This is usually transient. Persistent failures point at RBAC or connectivity problems")
    )]
    KubeError(#[from] kube::Error),

    /// Internal error
    #[error("Internal runtime error: {message}")]
    #[diagnostic(
        code(sidereap::runtime::internal_error),
        help("This is likely a bug in sidereap-runtime. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn cache_sync_timeout(timeout_secs: u64) -> Self {
        Self::CacheSyncTimeout { timeout_secs }
    }

    pub fn partial_termination(
        pod: impl Into<String>,
        failed: usize,
        attempted: usize,
        summary: impl Into<String>,
    ) -> Self {
        Self::PartialTermination {
            pod: pod.into(),
            failed,
            attempted,
            summary: summary.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Errors that drop the work item instead of scheduling a retry
    pub fn is_permanent(&self) -> bool {
        match self {
            RuntimeError::CoreError(e) => e.is_permanent(),
            _ => false,
        }
    }

    /// True when the pod is gone from the authoritative state
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::CoreError(sidereap_core::CoreError::PodNotFound { .. })
        )
    }
}

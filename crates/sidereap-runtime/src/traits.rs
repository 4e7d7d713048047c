use crate::error::Result;
use crate::exec::{ExecError, ExecOutput};
use crate::recorder::AuditEvent;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use sidereap_core::PodIdentity;
use std::sync::Arc;

/// Read-only access to the latest known pod state
///
/// Shared by every worker; implementations must never hand out state captured at
/// enqueue time, only the most recent observation.
pub trait PodLister: Send + Sync {
    /// Fetch a pod, failing with `PodNotFound` when it is absent
    fn get(&self, id: &PodIdentity) -> Result<Arc<Pod>>;
}

/// Command-execution channel into a single container
///
/// Each call is an independent session; no state is retained between calls.
#[async_trait]
pub trait ContainerExec: Send + Sync {
    /// Run `command` in `container` of `pod` and wait for it to finish
    async fn exec(
        &self,
        pod: &PodIdentity,
        container: &str,
        command: &[String],
    ) -> std::result::Result<ExecOutput, ExecError>;
}

/// Write-only sink for human-readable audit records about a pod
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, pod: &Pod, event: AuditEvent) -> Result<()>;
}

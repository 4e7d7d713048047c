use crate::error::{Result, RuntimeError};
use crate::exec::{ExecError, ExecOutput};
use crate::recorder::AuditEvent;
use crate::traits::{ContainerExec, EventRecorder};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use sidereap_core::PodIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// A single recorded exec invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub pod: PodIdentity,
    pub container: String,
    pub command: Vec<String>,
}

/// Mock exec channel for tests
///
/// Every call is logged. Results are programmable per container name and default to
/// a successful exit.
pub struct MockExec {
    results: Arc<RwLock<HashMap<String, std::result::Result<ExecOutput, ExecError>>>>,
    calls: Arc<RwLock<Vec<ExecCall>>>,
    delay: Arc<RwLock<Option<Duration>>>,
}

impl MockExec {
    pub fn new() -> Self {
        Self {
            results: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            delay: Arc::new(RwLock::new(None)),
        }
    }

    /// Set the result returned for exec calls into `container`
    pub async fn set_result(
        &self,
        container: &str,
        result: std::result::Result<ExecOutput, ExecError>,
    ) {
        self.results
            .write()
            .await
            .insert(container.to_string(), result);
    }

    /// Make every exec call take `delay` before returning
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    /// All exec calls seen so far
    pub async fn calls(&self) -> Vec<ExecCall> {
        self.calls.read().await.clone()
    }
}

impl Default for MockExec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerExec for MockExec {
    async fn exec(
        &self,
        pod: &PodIdentity,
        container: &str,
        command: &[String],
    ) -> std::result::Result<ExecOutput, ExecError> {
        self.calls.write().await.push(ExecCall {
            pod: pod.clone(),
            container: container.to_string(),
            command: command.to_vec(),
        });
        debug!("Mock: exec into {} container {}", pod, container);

        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.results
            .read()
            .await
            .get(container)
            .cloned()
            .unwrap_or_else(|| Ok(ExecOutput::success()))
    }
}

/// Mock recorder that keeps every audit event in memory
pub struct RecordingRecorder {
    events: Arc<RwLock<Vec<(PodIdentity, AuditEvent)>>>,
    fail: bool,
}

impl RecordingRecorder {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            fail: false,
        }
    }

    /// A recorder whose writes always fail
    pub fn failing() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            fail: true,
        }
    }

    pub async fn events(&self) -> Vec<(PodIdentity, AuditEvent)> {
        self.events.read().await.clone()
    }
}

impl Default for RecordingRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventRecorder for RecordingRecorder {
    async fn record(&self, pod: &Pod, event: AuditEvent) -> Result<()> {
        if self.fail {
            return Err(RuntimeError::internal_error("event sink unavailable"));
        }
        let id = PodIdentity::from_meta(pod)?;
        self.events.write().await.push((id, event));
        Ok(())
    }
}

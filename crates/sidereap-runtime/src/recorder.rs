use crate::error::Result;
use crate::traits::EventRecorder;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::Client;
use sidereap_core::{ObjectMetaAccess, PodIdentity};
use std::fmt;
use tracing::debug;

/// Component name reported on audit events
pub const CONTROLLER_AGENT_NAME: &str = "terminate-sidecar-job-controller";

/// Event reason used when a reconciliation finished without action
pub const REASON_SYNCED: &str = "Synced";

/// Event reason used when sidecars were sent the termination signal
pub const REASON_SIDECARS_TERMINATED: &str = "SidecarsTerminated";

/// Severity of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// A human-readable record about a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl AuditEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Pod evaluated, nothing to do yet
    pub fn synced() -> Self {
        Self::normal(REASON_SYNCED, "Pod synced successfully")
    }

    /// Sidecars were signaled
    pub fn sidecars_terminated(containers: &[String]) -> Self {
        Self::normal(
            REASON_SIDECARS_TERMINATED,
            format!(
                "Sent SIGTERM to sidecar containers: {}",
                containers.join(", ")
            ),
        )
    }
}

/// Records audit events as core/v1 Event objects
pub struct KubeEventRecorder {
    client: Client,
    reporting_instance: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, reporting_instance: impl Into<String>) -> Self {
        Self {
            client,
            reporting_instance: reporting_instance.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, pod: &Pod, event: AuditEvent) -> Result<()> {
        let id = PodIdentity::from_meta(pod)?;
        let kube_event = build_event(pod, &id, &event, &self.reporting_instance);

        let api: Api<Event> = Api::namespaced(self.client.clone(), &id.namespace);
        api.create(&PostParams::default(), &kube_event).await?;
        debug!("Recorded {} event {} for pod {}", event.event_type, event.reason, id);
        Ok(())
    }
}

fn build_event(pod: &Pod, id: &PodIdentity, event: &AuditEvent, instance: &str) -> Event {
    let now = Time(Utc::now());
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}.", id.name)),
            namespace: Some(id.namespace.clone()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            uid: pod.metadata.uid.clone(),
            resource_version: pod.resource_version().map(str::to_string),
            ..Default::default()
        },
        type_: Some(event.event_type.to_string()),
        reason: Some(event.reason.clone()),
        message: Some(event.message.clone()),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        source: Some(EventSource {
            component: Some(CONTROLLER_AGENT_NAME.to_string()),
            host: None,
        }),
        reporting_component: Some(CONTROLLER_AGENT_NAME.to_string()),
        reporting_instance: Some(instance.to_string()),
        ..Default::default()
    }
}

/// Recorder used when event recording is disabled
pub struct NoopRecorder;

#[async_trait]
impl EventRecorder for NoopRecorder {
    async fn record(&self, _pod: &Pod, _event: AuditEvent) -> Result<()> {
        Ok(())
    }
}

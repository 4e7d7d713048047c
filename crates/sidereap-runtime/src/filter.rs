use crate::queue::ReconcileQueue;
use crate::traits::PodLister;
use sidereap_core::{ObjectEvent, ObjectMetaAccess, PodIdentity};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Owner kind of pods created by batch Jobs
pub const JOB_KIND: &str = "Job";

/// Pod phase in which sidecars may still need a shutdown
pub const RUNNING_PHASE: &str = "Running";

/// Why an event did not produce a work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Periodic resync replay with an unchanged resource version
    Resync,
    /// Deletions need no action
    Deleted,
    NoControllerOwner,
    /// Controlled by something other than the tracked workload kind
    OwnerKind(String),
    InvalidIdentity,
    /// No pod with this identity in the pod state
    Orphan,
    /// Pod is in a phase other than Running
    NotRunning(String),
}

/// Outcome of filtering one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Enqueued(PodIdentity),
    Ignored(IgnoreReason),
}

/// Turns raw change events into reconcile queue keys
pub struct EventFilter {
    lister: Arc<dyn PodLister>,
    queue: Arc<ReconcileQueue<PodIdentity>>,
    owner_kind: String,
}

impl EventFilter {
    pub fn new(
        lister: Arc<dyn PodLister>,
        queue: Arc<ReconcileQueue<PodIdentity>>,
        owner_kind: impl Into<String>,
    ) -> Self {
        Self {
            lister,
            queue,
            owner_kind: owner_kind.into(),
        }
    }

    pub fn handle<K: ObjectMetaAccess>(&self, event: ObjectEvent<K>) -> FilterDecision {
        let object = match &event {
            ObjectEvent::Added(object) => object,
            ObjectEvent::Updated { old, new } => {
                if old.resource_version() == new.resource_version() {
                    trace!(
                        "Ignoring resync of {}/{}",
                        new.namespace().unwrap_or_default(),
                        new.name().unwrap_or_default()
                    );
                    return FilterDecision::Ignored(IgnoreReason::Resync);
                }
                new
            }
            ObjectEvent::Deleted(object) => {
                trace!(
                    "Ignoring delete of {}/{}",
                    object.namespace().unwrap_or_default(),
                    object.name().unwrap_or_default()
                );
                return FilterDecision::Ignored(IgnoreReason::Deleted);
            }
            ObjectEvent::DeletedTombstone(object) => {
                trace!(
                    "Ignoring tombstone of {}/{}",
                    object.namespace().unwrap_or_default(),
                    object.name().unwrap_or_default()
                );
                return FilterDecision::Ignored(IgnoreReason::Deleted);
            }
        };

        self.admit(object)
    }

    fn admit<K: ObjectMetaAccess>(&self, object: &K) -> FilterDecision {
        let Some(owner) = object.controller_owner() else {
            trace!(
                "Ignoring {}/{} without a controller owner",
                object.namespace().unwrap_or_default(),
                object.name().unwrap_or_default()
            );
            return FilterDecision::Ignored(IgnoreReason::NoControllerOwner);
        };

        if owner.kind != self.owner_kind {
            trace!(
                "Ignoring object controlled by {} {}",
                owner.kind,
                owner.name
            );
            return FilterDecision::Ignored(IgnoreReason::OwnerKind(owner.kind));
        }

        let id = match PodIdentity::from_meta(object) {
            Ok(id) => id,
            Err(e) => {
                error!("Cannot derive pod identity for object owned by {}: {}", owner.name, e);
                return FilterDecision::Ignored(IgnoreReason::InvalidIdentity);
            }
        };

        let pod = match self.lister.get(&id) {
            Ok(pod) => pod,
            Err(_) => {
                debug!("Ignoring orphaned object {} (owner {})", id, owner.name);
                return FilterDecision::Ignored(IgnoreReason::Orphan);
            }
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");
        if phase != RUNNING_PHASE {
            debug!("Pod {} is not running (phase '{}')", id, phase);
            return FilterDecision::Ignored(IgnoreReason::NotRunning(phase.to_string()));
        }

        debug!("Enqueuing pod {}", id);
        self.queue.enqueue(id.clone());
        FilterDecision::Enqueued(id)
    }
}

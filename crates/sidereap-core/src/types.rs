use crate::error::{CoreError, Result};
use crate::events::ObjectMetaAccess;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Namespace assumed for namespaced objects that omit one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Sidecar container injected by the Istio service mesh
pub const ISTIO_PROXY: &str = "istio-proxy";

/// PodIdentity uniquely identifies a pod and is the reconcile queue key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodIdentity {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodIdentity {
    /// Create a new PodIdentity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build an identity from object metadata
    ///
    /// A missing namespace falls back to `default`; a missing or empty name is an error.
    pub fn from_meta<M: ObjectMetaAccess + ?Sized>(object: &M) -> Result<Self> {
        let name = object
            .name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CoreError::invalid_identity("object has no metadata.name"))?;
        let namespace = object
            .namespace()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE);
        Ok(Self::new(namespace, name))
    }

    /// Reject identities with empty components
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(CoreError::invalid_identity(format!(
                "empty namespace in '{}'",
                self
            )));
        }
        if self.name.is_empty() {
            return Err(CoreError::invalid_identity(format!(
                "empty name in '{}'",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Last-known status of a single container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerObservation {
    pub name: String,
    pub ready: bool,
    /// Reason of the last termination, if the container is terminated
    pub termination_reason: Option<String>,
}

impl ContainerObservation {
    pub fn new(name: impl Into<String>, ready: bool, termination_reason: Option<&str>) -> Self {
        Self {
            name: name.into(),
            ready,
            termination_reason: termination_reason.map(str::to_string),
        }
    }

    /// Read observations from a pod's regular container statuses
    ///
    /// Init and ephemeral containers do not take part in the shutdown decision.
    pub fn from_pod(pod: &Pod) -> Vec<Self> {
        let Some(statuses) = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
        else {
            return Vec::new();
        };

        statuses
            .iter()
            .map(|cs| Self {
                name: cs.name.clone(),
                ready: cs.ready,
                termination_reason: cs
                    .state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .and_then(|t| t.reason.clone()),
            })
            .collect()
    }
}

/// Container names bucketed by lifecycle state
///
/// `running` and `completed` are always disjoint subsets of `all`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStateSets {
    pub all: HashSet<String>,
    pub running: HashSet<String>,
    pub completed: HashSet<String>,
}

impl ContainerStateSets {
    /// Containers that are neither running nor cleanly completed
    pub fn unaccounted(&self) -> HashSet<String> {
        self.all
            .iter()
            .filter(|n| !self.running.contains(*n) && !self.completed.contains(*n))
            .cloned()
            .collect()
    }
}

/// Fixed set of container names treated as sidecars
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarSet(HashSet<String>);

impl SidecarSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn names(&self) -> &HashSet<String> {
        &self.0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Names in sorted order, for stable logs and exec ordering
    pub fn sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.iter().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SidecarSet {
    fn default() -> Self {
        Self::new([ISTIO_PROXY])
    }
}

impl fmt::Display for SidecarSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sorted().join(","))
    }
}

/// Controlling owner of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus,
        PodStatus,
    };

    fn status(name: &str, ready: bool, terminated: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready,
            state: Some(match terminated {
                Some(reason) => ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        reason: Some(reason.to_string()),
                        exit_code: 0,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                None => ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(PodIdentity::new("batch", "pi-x7k2").to_string(), "batch/pi-x7k2");
    }

    #[test]
    fn test_identity_from_meta_defaults_namespace() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("pi-x7k2".to_string());

        let id = PodIdentity::from_meta(&pod).unwrap();
        assert_eq!(id, PodIdentity::new("default", "pi-x7k2"));
    }

    #[test]
    fn test_identity_from_meta_requires_name() {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("batch".to_string());
        assert!(PodIdentity::from_meta(&pod).is_err());

        pod.metadata.name = Some(String::new());
        assert!(PodIdentity::from_meta(&pod).is_err());
    }

    #[test]
    fn test_identity_validate() {
        assert!(PodIdentity::new("batch", "pi").validate().is_ok());
        assert!(PodIdentity::new("", "pi").validate().is_err());
        assert!(PodIdentity::new("batch", "").validate().is_err());
    }

    #[test]
    fn test_identity_serde_roundtrip() {
        let id = PodIdentity::new("batch", "pi");
        let json = serde_json::to_string(&id).unwrap();
        let back: PodIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_observations_from_pod() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![
                status("main", false, Some("Completed")),
                status("istio-proxy", true, None),
            ]),
            ..Default::default()
        });

        let obs = ContainerObservation::from_pod(&pod);
        assert_eq!(
            obs,
            vec![
                ContainerObservation::new("main", false, Some("Completed")),
                ContainerObservation::new("istio-proxy", true, None),
            ]
        );
    }

    #[test]
    fn test_observations_from_pod_without_status() {
        assert!(ContainerObservation::from_pod(&Pod::default()).is_empty());
    }

    #[test]
    fn test_sidecar_set_default_is_istio() {
        let set = SidecarSet::default();
        assert_eq!(set.len(), 1);
        assert!(set.contains("istio-proxy"));
        assert_eq!(set.to_string(), "istio-proxy");
    }

    #[test]
    fn test_sidecar_set_sorted() {
        let set = SidecarSet::new(["vault-agent", "istio-proxy"]);
        assert_eq!(set.sorted(), vec!["istio-proxy", "vault-agent"]);
    }
}

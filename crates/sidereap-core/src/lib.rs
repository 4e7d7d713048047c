//! Sidereap Core - Domain types and pure decision logic for the sidecar reaper
//!
//! This crate provides:
//! - Pod identities and container observations
//! - The container state classifier and shutdown decision
//! - Tagged change events and a narrow metadata view over Kubernetes objects
//! - Error types with miette diagnostics

pub mod error;
pub mod events;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, Result};
pub use events::{ObjectEvent, ObjectMetaAccess};
pub use state::{classify, shutdown_due, COMPLETED_REASONS};
pub use types::{
    ContainerObservation, ContainerStateSets, OwnerRef, PodIdentity, SidecarSet,
    DEFAULT_NAMESPACE, ISTIO_PROXY,
};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::Pod;

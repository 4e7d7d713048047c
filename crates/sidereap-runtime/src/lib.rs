// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod controller;
pub mod error;
pub mod exec;
pub mod filter;
pub mod informer;
pub mod mock;
pub mod pod_cache;
pub mod queue;
pub mod rate_limit;
pub mod reconciler;
pub mod recorder;
pub mod terminator;
pub mod traits;

// Re-export primary types
pub use error::{Result, RuntimeError};
pub use mock::{MockExec, RecordingRecorder};
pub use traits::{ContainerExec, EventRecorder, PodLister};

// Re-export pipeline stages
pub use controller::{process_next_item, Controller, ControllerConfig};
pub use exec::{ExecError, ExecOutput, KubeExec};
pub use filter::{EventFilter, FilterDecision, IgnoreReason, JOB_KIND};
pub use informer::PodInformer;
pub use pod_cache::PodCache;
pub use queue::{QueueConfig, ReconcileQueue};
pub use rate_limit::{RateLimiter, RateLimiterConfig};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use recorder::{AuditEvent, EventType, KubeEventRecorder, NoopRecorder};
pub use terminator::{SidecarTerminator, TerminationReport};

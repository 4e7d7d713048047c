use crate::error::{Result, RuntimeError};
use crate::recorder::AuditEvent;
use crate::terminator::{SidecarTerminator, TerminationReport};
use crate::traits::{EventRecorder, PodLister};
use k8s_openapi::api::core::v1::Pod;
use sidereap_core::{
    classify, shutdown_due, ContainerObservation, ContainerStateSets, PodIdentity, SidecarSet,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event reason used when signaling sidecars failed
pub const REASON_TERMINATION_FAILED: &str = "SidecarTerminationFailed";

/// What a successful reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not every main container has finished yet
    NotDue(ContainerStateSets),
    /// Sidecars were sent the termination signal
    Terminated(TerminationReport),
}

/// Evaluates a pod and shuts its sidecars down once the main containers are done
pub struct Reconciler {
    lister: Arc<dyn PodLister>,
    terminator: SidecarTerminator,
    recorder: Arc<dyn EventRecorder>,
    sidecars: SidecarSet,
}

impl Reconciler {
    pub fn new(
        lister: Arc<dyn PodLister>,
        terminator: SidecarTerminator,
        recorder: Arc<dyn EventRecorder>,
        sidecars: SidecarSet,
    ) -> Self {
        Self {
            lister,
            terminator,
            recorder,
            sidecars,
        }
    }

    pub fn sidecars(&self) -> &SidecarSet {
        &self.sidecars
    }

    /// Reconcile the pod identified by `id` against its current state
    ///
    /// Fails with a permanent error when the identity is malformed or the pod is gone;
    /// any other error is worth a retry.
    pub async fn reconcile(&self, id: &PodIdentity) -> Result<ReconcileOutcome> {
        id.validate()?;
        let pod = self.lister.get(id)?;

        let observations = ContainerObservation::from_pod(&pod);
        let sets = classify(&observations);
        debug!(
            pod = %id,
            all = ?sets.all,
            running = ?sets.running,
            completed = ?sets.completed,
            sidecars = %self.sidecars,
            "Classified containers"
        );

        if !shutdown_due(&sets, &self.sidecars) {
            self.record(&pod, id, AuditEvent::synced()).await;
            return Ok(ReconcileOutcome::NotDue(sets));
        }

        info!(
            "Main containers of pod {} finished, sending shutdown signal to: {}",
            id, self.sidecars
        );

        match self.terminator.terminate(id, &self.sidecars).await {
            Ok(report) => {
                self.record(
                    &pod,
                    id,
                    AuditEvent::sidecars_terminated(&self.sidecars.sorted()),
                )
                .await;
                Ok(ReconcileOutcome::Terminated(report))
            }
            Err(e) => {
                let message = e.to_string();
                self.record(
                    &pod,
                    id,
                    AuditEvent::warning(REASON_TERMINATION_FAILED, message),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn record(&self, pod: &Pod, id: &PodIdentity, event: AuditEvent) {
        let reason = event.reason.clone();
        if let Err(e) = self.recorder.record(pod, event).await {
            warn!("Failed to record {} event for pod {}: {}", reason, id, e);
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("sidecars", &self.sidecars)
            .finish_non_exhaustive()
    }
}

/// Short label for a failed reconciliation, used in worker logs
pub(crate) fn describe_failure(err: &RuntimeError) -> &'static str {
    if err.is_not_found() {
        "pod no longer exists"
    } else if err.is_permanent() {
        "invalid work item"
    } else {
        "transient failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecError;
    use crate::mock::{MockExec, RecordingRecorder};
    use crate::pod_cache::PodCache;
    use crate::recorder::{REASON_SIDECARS_TERMINATED, REASON_SYNCED};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated,
        ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use std::time::Duration;

    fn running(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready: true,
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated(name: &str, reason: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready: false,
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    reason: Some(reason.to_string()),
                    exit_code: 0,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn waiting(name: &str, reason: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready: false,
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn job_pod(name: &str, statuses: Vec<ContainerStatus>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("batch".to_string());
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(statuses),
            ..Default::default()
        });
        pod
    }

    struct Harness {
        reconciler: Reconciler,
        cache: Arc<PodCache>,
        exec: Arc<MockExec>,
        recorder: Arc<RecordingRecorder>,
    }

    fn harness_with(recorder: RecordingRecorder) -> Harness {
        let cache = Arc::new(PodCache::new());
        let exec = Arc::new(MockExec::new());
        let recorder = Arc::new(recorder);
        let reconciler = Reconciler::new(
            cache.clone(),
            SidecarTerminator::new(exec.clone(), Duration::from_secs(5)),
            recorder.clone(),
            SidecarSet::default(),
        );
        Harness {
            reconciler,
            cache,
            exec,
            recorder,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingRecorder::new())
    }

    #[tokio::test]
    async fn test_main_completed_triggers_termination() {
        let h = harness();
        h.cache
            .apply(job_pod(
                "pi-abc",
                vec![terminated("main", "Completed"), running("istio-proxy")],
            ))
            .unwrap();
        let id = PodIdentity::new("batch", "pi-abc");

        let outcome = h.reconciler.reconcile(&id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Terminated(TerminationReport {
                signaled: vec!["istio-proxy".to_string()],
                already_gone: vec![],
            })
        );

        let calls = h.exec.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].pod, id);
        assert_eq!(calls[0].container, "istio-proxy");
        assert_eq!(calls[0].command, vec!["sh", "-c", "kill -s TERM 1"]);

        let events = h.recorder.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.reason, REASON_SIDECARS_TERMINATED);
    }

    #[tokio::test]
    async fn test_main_still_running_is_not_due() {
        let h = harness();
        h.cache
            .apply(job_pod(
                "pi-abc",
                vec![running("main"), running("istio-proxy")],
            ))
            .unwrap();

        let outcome = h
            .reconciler
            .reconcile(&PodIdentity::new("batch", "pi-abc"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::NotDue(_)));
        assert!(h.exec.calls().await.is_empty());

        let events = h.recorder.events().await;
        assert_eq!(events[0].1.reason, REASON_SYNCED);
    }

    #[tokio::test]
    async fn test_crash_looping_main_defers_shutdown() {
        let h = harness();
        h.cache
            .apply(job_pod(
                "pi-abc",
                vec![waiting("main", "CrashLoopBackOff"), running("istio-proxy")],
            ))
            .unwrap();

        let outcome = h
            .reconciler
            .reconcile(&PodIdentity::new("batch", "pi-abc"))
            .await
            .unwrap();
        match outcome {
            ReconcileOutcome::NotDue(sets) => {
                assert!(sets.unaccounted().contains("main"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.exec.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_pod_is_permanent_not_found() {
        let h = harness();
        let err = h
            .reconciler
            .reconcile(&PodIdentity::new("batch", "gone"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.is_permanent());
        assert_eq!(describe_failure(&err), "pod no longer exists");
    }

    #[tokio::test]
    async fn test_malformed_identity_is_permanent() {
        let h = harness();
        let err = h
            .reconciler
            .reconcile(&PodIdentity::new("", "pi"))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(!err.is_not_found());
        assert_eq!(describe_failure(&err), "invalid work item");
    }

    #[tokio::test]
    async fn test_exec_failure_is_transient_and_recorded() {
        let h = harness();
        h.exec
            .set_result(
                "istio-proxy",
                Err(ExecError::transient("istio-proxy", "dial tcp: i/o timeout")),
            )
            .await;
        h.cache
            .apply(job_pod(
                "pi-abc",
                vec![terminated("main", "Error"), running("istio-proxy")],
            ))
            .unwrap();

        let err = h
            .reconciler
            .reconcile(&PodIdentity::new("batch", "pi-abc"))
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(describe_failure(&err), "transient failure");

        let events = h.recorder.events().await;
        assert_eq!(events[0].1.reason, REASON_TERMINATION_FAILED);
    }

    #[tokio::test]
    async fn test_second_reconcile_after_signal_is_harmless() {
        let h = harness();
        h.cache
            .apply(job_pod(
                "pi-abc",
                vec![terminated("main", "Completed"), running("istio-proxy")],
            ))
            .unwrap();
        let id = PodIdentity::new("batch", "pi-abc");

        let first = h.reconciler.reconcile(&id).await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Terminated(_)));

        // Sidecar exited but the cache has not caught up yet
        h.exec
            .set_result(
                "istio-proxy",
                Err(ExecError::container_gone("istio-proxy", "container not found")),
            )
            .await;
        let second = h.reconciler.reconcile(&id).await.unwrap();
        assert_eq!(
            second,
            ReconcileOutcome::Terminated(TerminationReport {
                signaled: vec![],
                already_gone: vec!["istio-proxy".to_string()],
            })
        );
    }

    #[tokio::test]
    async fn test_recorder_failure_does_not_fail_reconcile() {
        let h = harness_with(RecordingRecorder::failing());
        h.cache
            .apply(job_pod(
                "pi-abc",
                vec![terminated("main", "Completed"), running("istio-proxy")],
            ))
            .unwrap();

        assert!(h
            .reconciler
            .reconcile(&PodIdentity::new("batch", "pi-abc"))
            .await
            .is_ok());
    }
}

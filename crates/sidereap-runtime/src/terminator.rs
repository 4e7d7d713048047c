use crate::error::{Result, RuntimeError};
use crate::exec::ExecError;
use crate::traits::ContainerExec;
use futures_util::future::join_all;
use sidereap_core::{PodIdentity, SidecarSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Command run inside each sidecar: SIGTERM to the container's init process
pub const TERMINATE_COMMAND: [&str; 3] = ["sh", "-c", "kill -s TERM 1"];

/// Exit codes meaning the signal landed: clean exit, or the exec shell was taken
/// down together with PID 1 (SIGKILL/SIGTERM)
const DELIVERED_EXIT_CODES: [i32; 3] = [0, 137, 143];

/// Result of signaling a set of sidecars where no container failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Containers that received the signal
    pub signaled: Vec<String>,
    /// Containers that were already gone
    pub already_gone: Vec<String>,
}

/// A container that could not be signaled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFailure {
    pub container: String,
    pub reason: String,
}

enum Delivery {
    Signaled,
    AlreadyGone,
}

/// Sends the termination command to sidecar containers
pub struct SidecarTerminator {
    exec: Arc<dyn ContainerExec>,
    exec_timeout: Duration,
}

impl SidecarTerminator {
    pub fn new(exec: Arc<dyn ContainerExec>, exec_timeout: Duration) -> Self {
        Self {
            exec,
            exec_timeout,
        }
    }

    /// Signal every container in `containers`
    ///
    /// All containers are attempted even when some fail. The call fails with
    /// `PartialTermination` naming each container that could not be signaled.
    pub async fn terminate(
        &self,
        pod: &PodIdentity,
        containers: &SidecarSet,
    ) -> Result<TerminationReport> {
        let names = containers.sorted();
        let command: Vec<String> = TERMINATE_COMMAND.iter().map(|s| s.to_string()).collect();

        let attempts = join_all(
            names
                .iter()
                .map(|container| self.signal_one(pod, container, &command)),
        )
        .await;

        let mut report = TerminationReport::default();
        let mut failures = Vec::new();
        for (container, outcome) in names.iter().zip(attempts) {
            match outcome {
                Ok(Delivery::Signaled) => report.signaled.push(container.clone()),
                Ok(Delivery::AlreadyGone) => report.already_gone.push(container.clone()),
                Err(reason) => {
                    warn!(
                        "Failed to signal container {} in pod {}: {}",
                        container, pod, reason
                    );
                    failures.push(ContainerFailure {
                        container: container.clone(),
                        reason,
                    });
                }
            }
        }

        if failures.is_empty() {
            info!(
                "Signaled sidecars in pod {} (signaled: [{}], already gone: [{}])",
                pod,
                report.signaled.join(", "),
                report.already_gone.join(", ")
            );
            return Ok(report);
        }

        let summary = failures
            .iter()
            .map(|f| format!("{}: {}", f.container, f.reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(RuntimeError::partial_termination(
            pod.to_string(),
            failures.len(),
            names.len(),
            summary,
        ))
    }

    async fn signal_one(
        &self,
        pod: &PodIdentity,
        container: &str,
        command: &[String],
    ) -> std::result::Result<Delivery, String> {
        debug!("Initiating exec into {} container {} to kill PID 1", pod, container);

        let result =
            match tokio::time::timeout(self.exec_timeout, self.exec.exec(pod, container, command))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    return Err(format!(
                        "exec timed out after {}s",
                        self.exec_timeout.as_secs()
                    ))
                }
            };

        match result {
            Ok(output) if DELIVERED_EXIT_CODES.contains(&output.exit_code) => {
                Ok(Delivery::Signaled)
            }
            Ok(output) => Err(format!(
                "kill exited with code {} (stderr: {})",
                output.exit_code,
                output.stderr.trim()
            )),
            Err(ExecError::ContainerGone { message, .. }) => {
                debug!(
                    "Container {} in pod {} already gone: {}",
                    container, pod, message
                );
                Ok(Delivery::AlreadyGone)
            }
            Err(ExecError::Transient { message, .. }) => Err(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecOutput;
    use crate::mock::MockExec;

    fn pod() -> PodIdentity {
        PodIdentity::new("batch", "pi-abc")
    }

    #[tokio::test]
    async fn test_signals_every_sidecar_with_kill_command() {
        let exec = Arc::new(MockExec::new());
        let terminator = SidecarTerminator::new(exec.clone(), Duration::from_secs(5));

        let report = terminator
            .terminate(&pod(), &SidecarSet::new(["istio-proxy", "vault-agent"]))
            .await
            .unwrap();

        assert_eq!(report.signaled, vec!["istio-proxy", "vault-agent"]);
        assert!(report.already_gone.is_empty());

        let calls = exec.calls().await;
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert_eq!(call.pod, pod());
            assert_eq!(call.command, vec!["sh", "-c", "kill -s TERM 1"]);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_names_failed_container() {
        let exec = Arc::new(MockExec::new());
        exec.set_result(
            "sidecar-b",
            Err(ExecError::transient("sidecar-b", "connection reset")),
        )
        .await;
        let terminator = SidecarTerminator::new(exec.clone(), Duration::from_secs(5));

        let err = terminator
            .terminate(&pod(), &SidecarSet::new(["sidecar-a", "sidecar-b"]))
            .await
            .unwrap_err();

        match err {
            RuntimeError::PartialTermination {
                failed,
                attempted,
                summary,
                ..
            } => {
                assert_eq!(failed, 1);
                assert_eq!(attempted, 2);
                assert!(summary.contains("sidecar-b: connection reset"));
                assert!(!summary.contains("sidecar-a"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // sidecar-a was still attempted
        let attempted: Vec<String> = exec
            .calls()
            .await
            .into_iter()
            .map(|c| c.container)
            .collect();
        assert!(attempted.contains(&"sidecar-a".to_string()));
        assert!(attempted.contains(&"sidecar-b".to_string()));
    }

    #[tokio::test]
    async fn test_container_gone_is_not_a_failure() {
        let exec = Arc::new(MockExec::new());
        exec.set_result(
            "istio-proxy",
            Err(ExecError::container_gone("istio-proxy", "container not found")),
        )
        .await;
        let terminator = SidecarTerminator::new(exec, Duration::from_secs(5));

        let report = terminator
            .terminate(&pod(), &SidecarSet::default())
            .await
            .unwrap();
        assert!(report.signaled.is_empty());
        assert_eq!(report.already_gone, vec!["istio-proxy"]);
    }

    #[tokio::test]
    async fn test_killed_by_signal_exit_counts_as_delivered() {
        let exec = Arc::new(MockExec::new());
        exec.set_result("istio-proxy", Ok(ExecOutput::exited(137, "")))
            .await;
        let terminator = SidecarTerminator::new(exec, Duration::from_secs(5));

        let report = terminator
            .terminate(&pod(), &SidecarSet::default())
            .await
            .unwrap();
        assert_eq!(report.signaled, vec!["istio-proxy"]);
    }

    #[tokio::test]
    async fn test_kill_failure_exit_code_is_a_failure() {
        let exec = Arc::new(MockExec::new());
        exec.set_result(
            "istio-proxy",
            Ok(ExecOutput::exited(1, "kill: permission denied")),
        )
        .await;
        let terminator = SidecarTerminator::new(exec, Duration::from_secs(5));

        let err = terminator
            .terminate(&pod(), &SidecarSet::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_timeout_is_a_failure() {
        let exec = Arc::new(MockExec::new());
        exec.set_delay(Duration::from_secs(60)).await;
        let terminator = SidecarTerminator::new(exec, Duration::from_secs(1));

        let err = terminator
            .terminate(&pod(), &SidecarSet::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 1s"));
    }
}

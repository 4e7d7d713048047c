use crate::traits::ContainerExec;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::client::UpgradeConnectionError;
use kube::Client;
use miette::Diagnostic;
use sidereap_core::PodIdentity;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Output from a remote command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn exited(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

/// Failure to run a command inside a container
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ExecError {
    /// The pod or container no longer exists or is not running
    #[error("Container '{container}' is gone: {message}")]
    #[diagnostic(
        code(sidereap::exec::container_gone),
        help("The container already exited. There is nothing left to signal")
    )]
    ContainerGone { container: String, message: String },

    /// Network or API failure that may succeed on retry
    #[error("Exec into container '{container}' failed: {message}")]
    #[diagnostic(
        code(sidereap::exec::transient),
        help("Check API server and kubelet connectivity. The operation is retried with backoff")
    )]
    Transient { container: String, message: String },
}

impl ExecError {
    pub fn container_gone(container: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ContainerGone {
            container: container.into(),
            message: message.into(),
        }
    }

    pub fn transient(container: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            container: container.into(),
            message: message.into(),
        }
    }
}

/// Exec channel backed by the pods/exec subresource
pub struct KubeExec {
    client: Client,
}

impl KubeExec {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContainerExec for KubeExec {
    async fn exec(
        &self,
        pod: &PodIdentity,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        debug!(
            "Exec into {} container {}: {}",
            pod,
            container,
            command.join(" ")
        );

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);

        let mut attached = api
            .exec(&pod.name, command.to_vec(), &params)
            .await
            .map_err(|e| classify_kube_error(container, e))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|e| ExecError::transient(container, e.to_string()))?;

        let exit_code = match status {
            Some(s) => exit_code_from_status(container, &s)?,
            None => 0,
        };

        debug!(
            "Exec into {} container {} exited with code {}",
            pod, container, exit_code
        );

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    // Output is only kept for diagnostics; a broken stream is reported via the status.
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("Exec output stream closed early: {}", e);
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn classify_kube_error(container: &str, err: kube::Error) -> ExecError {
    match &err {
        kube::Error::Api(resp) if is_container_gone(resp.code, &resp.message) => {
            ExecError::container_gone(container, resp.message.clone())
        }
        // The upgrade response body is dropped, so only the status code is left
        kube::Error::UpgradeConnection(UpgradeConnectionError::ProtocolSwitch(status))
            if is_gone_status(status.as_u16()) =>
        {
            ExecError::container_gone(container, err.to_string())
        }
        _ => ExecError::transient(container, err.to_string()),
    }
}

/// Whether a bare exec rejection status means the container cannot be reached anymore
///
/// The exec request itself is always well formed, so a 400 without a message is the
/// API server refusing a container that is not running or a pod that has completed.
fn is_gone_status(code: u16) -> bool {
    matches!(code, 400 | 404)
}

/// Whether an API rejection means the target container cannot be exec'd into anymore
pub fn is_container_gone(code: u16, message: &str) -> bool {
    if code == 404 {
        return true;
    }
    let message = message.to_ascii_lowercase();
    code == 400
        && message.contains("container")
        && [
            "not found",
            "not valid",
            "terminated",
            "not running",
            "completed pod",
        ]
            .iter()
            .any(|m| message.contains(m))
}

/// Translate the exec status channel into an exit code
///
/// `Success` maps to 0, `NonZeroExitCode` to the reported code; any other failure is
/// classified the same way as an API rejection.
pub fn exit_code_from_status(container: &str, status: &Status) -> Result<i32, ExecError> {
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.trim().parse::<i32>().ok());
        return match code {
            Some(code) => Ok(code),
            None => Err(ExecError::transient(
                container,
                "non-zero exit without an exit code",
            )),
        };
    }

    let message = status.message.clone().unwrap_or_default();
    let code = status
        .code
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(400);
    if is_container_gone(code, &message) {
        Err(ExecError::container_gone(container, message))
    } else {
        Err(ExecError::transient(container, message))
    }
}

use crate::error::{Result, RuntimeError};
use crate::filter::JOB_KIND;
use crate::pod_cache::PodCache;
use crate::queue::{QueueConfig, ReconcileQueue};
use crate::reconciler::{describe_failure, ReconcileOutcome, Reconciler};
use sidereap_core::{PodIdentity, SidecarSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile loops
    pub workers: usize,
    /// Container names treated as sidecars
    pub sidecars: SidecarSet,
    /// Controller owner kind whose pods are tracked
    pub owner_kind: String,
    /// Restrict the watch to one namespace; all namespaces when `None`
    pub namespace: Option<String>,
    /// How long to wait for the initial pod list
    pub cache_sync_timeout: Duration,
    /// Upper bound for a single exec call into a sidecar
    pub exec_timeout: Duration,
    pub queue: QueueConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            sidecars: SidecarSet::default(),
            owner_kind: JOB_KIND.to_string(),
            namespace: None,
            cache_sync_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(30),
            queue: QueueConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(RuntimeError::invalid_config(
                "workers must be at least 1",
                "Pass --workers with a value of 1 or more",
            ));
        }
        if self.sidecars.is_empty() {
            return Err(RuntimeError::invalid_config(
                "no sidecar container names configured",
                "Pass --sidecar at least once, e.g. --sidecar istio-proxy",
            ));
        }
        if self.owner_kind.is_empty() {
            return Err(RuntimeError::invalid_config(
                "owner kind must not be empty",
                "Pass --owner-kind Job",
            ));
        }
        if self.exec_timeout.is_zero() {
            return Err(RuntimeError::invalid_config(
                "exec timeout must be greater than zero",
                "Pass --exec-timeout-secs with a positive value",
            ));
        }
        Ok(())
    }
}

/// Runs the reconcile worker pool
pub struct Controller {
    queue: Arc<ReconcileQueue<PodIdentity>>,
    reconciler: Arc<Reconciler>,
    cache: Arc<PodCache>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        queue: Arc<ReconcileQueue<PodIdentity>>,
        reconciler: Arc<Reconciler>,
        cache: Arc<PodCache>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            queue,
            reconciler,
            cache,
            config,
        }
    }

    /// Run until `token` is cancelled
    ///
    /// Fails without starting any worker if the pod cache does not sync in time. On
    /// cancellation the queue is shut down and in-flight reconciliations finish before
    /// this returns.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting controller (workers: {}, sidecars: {}, owner kind: {})",
            self.config.workers, self.config.sidecars, self.config.owner_kind
        );

        info!("Waiting for pod cache to sync");
        tokio::select! {
            _ = token.cancelled() => {
                info!("Shutdown requested before pod cache synced");
                self.queue.shutdown();
                return Ok(());
            }
            synced = self.cache.wait_synced(self.config.cache_sync_timeout) => {
                if let Err(e) = synced {
                    error!("Failed to sync pod cache: {}", e);
                    self.queue.shutdown();
                    return Err(e);
                }
            }
        }

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            let queue = self.queue.clone();
            let reconciler = self.reconciler.clone();
            workers.spawn(async move {
                debug!("Worker {} started", worker);
                while process_next_item(&queue, &reconciler).await {}
                debug!("Worker {} stopped", worker);
            });
        }
        info!("Started {} workers", self.config.workers);

        token.cancelled().await;
        info!("Shutting down workers");
        self.queue.shutdown();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Controller stopped");
        Ok(())
    }
}

/// Take one item off the queue and reconcile it
///
/// Returns `false` once the queue has shut down.
pub async fn process_next_item(
    queue: &Arc<ReconcileQueue<PodIdentity>>,
    reconciler: &Reconciler,
) -> bool {
    let Some(id) = queue.dequeue().await else {
        return false;
    };

    match reconciler.reconcile(&id).await {
        Ok(ReconcileOutcome::NotDue(_)) => {
            debug!(pod = %id, "Successfully synced");
            queue.mark_done(&id);
        }
        Ok(ReconcileOutcome::Terminated(report)) => {
            info!(
                pod = %id,
                signaled = report.signaled.len(),
                already_gone = report.already_gone.len(),
                "Successfully synced"
            );
            queue.mark_done(&id);
        }
        Err(e) if e.is_not_found() => {
            debug!(pod = %id, "Dropping work item: {}", describe_failure(&e));
            queue.mark_done(&id);
        }
        Err(e) if e.is_permanent() => {
            error!(pod = %id, "Dropping work item ({}): {}", describe_failure(&e), e);
            queue.mark_done(&id);
        }
        Err(e) => {
            warn!(pod = %id, "Error syncing pod, requeuing: {}", e);
            if !queue.mark_done_and_retry(id.clone()) {
                error!(pod = %id, "Giving up on pod after repeated failures: {}", e);
            }
        }
    }
    true
}

use clap::{Parser, ValueEnum};
use kube::{Api, Client};
use sidereap_core::{Pod, SidecarSet, ISTIO_PROXY};
use sidereap_runtime::{
    Controller, ControllerConfig, EventFilter, EventRecorder, KubeEventRecorder, KubeExec,
    NoopRecorder, PodCache, PodInformer, QueueConfig, ReconcileQueue, Reconciler,
    SidecarTerminator, JOB_KIND,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "sidereap",
    about = "Stops sidecar containers once the main containers of a Job pod have finished"
)]
struct Cli {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "SIDEREAP_WORKERS", default_value_t = 2)]
    workers: usize,
    /// Sidecar container name; repeat for several
    #[arg(
        long = "sidecar",
        env = "SIDEREAP_SIDECARS",
        value_delimiter = ',',
        default_value = ISTIO_PROXY
    )]
    sidecars: Vec<String>,
    /// Controller owner kind whose pods are tracked
    #[arg(long, env = "SIDEREAP_OWNER_KIND", default_value = JOB_KIND)]
    owner_kind: String,
    /// Only watch pods in this namespace
    #[arg(long, env = "SIDEREAP_NAMESPACE")]
    namespace: Option<String>,
    /// Seconds to wait for the initial pod list
    #[arg(long, env = "SIDEREAP_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    cache_sync_timeout_secs: u64,
    /// Seconds allowed for a single exec into a sidecar
    #[arg(long, env = "SIDEREAP_EXEC_TIMEOUT_SECS", default_value_t = 30)]
    exec_timeout_secs: u64,
    /// Retries before a failing pod is dropped from the queue
    #[arg(long, env = "SIDEREAP_MAX_RETRIES", default_value_t = 15)]
    max_retries: u32,
    /// Do not write Kubernetes Events for reconciled pods
    #[arg(long, env = "SIDEREAP_NO_EVENTS")]
    no_events: bool,
    /// Reporting instance written on Events
    #[arg(long, env = "POD_NAME", default_value = "sidereap")]
    instance: String,
    #[arg(long, env = "SIDEREAP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            sidecars: SidecarSet::new(
                self.sidecars
                    .iter()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty()),
            ),
            owner_kind: self.owner_kind.clone(),
            namespace: self.namespace.clone(),
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            queue: QueueConfig {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.controller_config();
    config.validate()?;

    info!(
        "Starting sidereap (namespace: {}, sidecars: {})",
        config.namespace.as_deref().unwrap_or("<all>"),
        config.sidecars
    );

    let client = Client::try_default()
        .await
        .map_err(|e| miette::miette!("Failed to create Kubernetes client: {}", e))?;

    let pods: Api<Pod> = match &config.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let cache = Arc::new(PodCache::new());
    let queue = ReconcileQueue::new(config.queue.clone());
    let filter = Arc::new(EventFilter::new(
        cache.clone(),
        queue.clone(),
        config.owner_kind.clone(),
    ));
    let informer = PodInformer::new(pods, cache.clone(), filter);

    let recorder: Arc<dyn EventRecorder> = if cli.no_events {
        Arc::new(NoopRecorder)
    } else {
        Arc::new(KubeEventRecorder::new(client.clone(), cli.instance.clone()))
    };
    let terminator = SidecarTerminator::new(Arc::new(KubeExec::new(client)), config.exec_timeout);
    let reconciler = Arc::new(Reconciler::new(
        cache.clone(),
        terminator,
        recorder,
        config.sidecars.clone(),
    ));
    let controller = Controller::new(queue, reconciler, cache, config);

    let token = CancellationToken::new();

    // 1. Spawn the pod watch
    let informer_token = token.clone();
    let informer_handle = tokio::spawn(async move {
        if let Err(e) = informer.run(informer_token.clone()).await {
            error!("Pod informer error: {}", e);
            informer_token.cancel();
        }
    });

    // 2. Cancel everything on the first shutdown signal
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down gracefully...");
        signal_token.cancel();
    });

    // 3. Run workers until cancelled
    let result = controller.run(token.clone()).await;
    token.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    if tokio::time::timeout(shutdown_timeout, informer_handle)
        .await
        .is_err()
    {
        error!("Pod informer did not stop within {:?}", shutdown_timeout);
    }

    result?;
    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

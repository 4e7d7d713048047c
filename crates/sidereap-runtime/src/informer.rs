use crate::error::{Result, RuntimeError};
use crate::filter::{EventFilter, FilterDecision};
use crate::pod_cache::PodCache;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use sidereap_core::{ObjectEvent, PodIdentity};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches pods and keeps the [`PodCache`] current, forwarding every change to the filter
pub struct PodInformer {
    api: Api<Pod>,
    adapter: WatchAdapter,
}

impl PodInformer {
    pub fn new(api: Api<Pod>, cache: Arc<PodCache>, filter: Arc<EventFilter>) -> Self {
        Self {
            api,
            adapter: WatchAdapter::new(cache, filter),
        }
    }

    /// Run the watch until `token` is cancelled
    ///
    /// Watch errors are retried with backoff; the stream only ends on cancellation.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!("Starting pod informer");
        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Pod informer shutting down");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        self.adapter.handle(event);
                    }
                    Some(Err(e)) => {
                        warn!("Pod watch error: {}", e);
                    }
                    None => {
                        return Err(RuntimeError::internal_error("pod watch stream ended"));
                    }
                }
            }
        }
    }
}

/// Feeds raw watch events into the [`PodCache`] and turns them into [`ObjectEvent`]s
///
/// A relist arrives as `Init`, a run of `InitApply`, then `InitDone`. The store keeps
/// serving the previous state until `InitDone`; at that point listed pods are compared
/// against it and cached pods absent from the list are reported as tombstones.
pub(crate) struct WatchAdapter {
    cache: Arc<PodCache>,
    filter: Arc<EventFilter>,
    relist: Vec<Pod>,
}

impl WatchAdapter {
    pub(crate) fn new(cache: Arc<PodCache>, filter: Arc<EventFilter>) -> Self {
        Self {
            cache,
            filter,
            relist: Vec::new(),
        }
    }

    pub(crate) fn handle(&mut self, event: watcher::Event<Pod>) -> Vec<FilterDecision> {
        let previous = match &event {
            watcher::Event::Apply(pod)
            | watcher::Event::Delete(pod)
            | watcher::Event::InitApply(pod) => {
                let Some(id) = identity(pod) else {
                    return Vec::new();
                };
                self.cache.lookup(&id)
            }
            watcher::Event::InitDone => return self.finish_relist(),
            watcher::Event::Init => None,
        };

        self.cache.apply_watcher_event(&event);
        match event {
            watcher::Event::Apply(pod) => vec![self.filter.handle(change(previous, pod))],
            watcher::Event::Delete(pod) => vec![self.filter.handle(ObjectEvent::Deleted(pod))],
            watcher::Event::Init => {
                debug!("Pod list started");
                self.relist.clear();
                Vec::new()
            }
            watcher::Event::InitApply(pod) => {
                self.relist.push(pod);
                Vec::new()
            }
            watcher::Event::InitDone => Vec::new(),
        }
    }

    fn finish_relist(&mut self) -> Vec<FilterDecision> {
        let first_sync = !self.cache.has_synced();
        let mut previous = self.cache.snapshot();
        self.cache.apply_watcher_event(&watcher::Event::InitDone);

        let mut decisions = Vec::new();
        for pod in std::mem::take(&mut self.relist) {
            let old = identity(&pod).and_then(|id| previous.remove(&id));
            decisions.push(self.filter.handle(change(old, pod)));
        }

        for (id, stale) in previous {
            debug!("Pod {} missing from relist, emitting tombstone", id);
            decisions.push(
                self.filter
                    .handle(ObjectEvent::DeletedTombstone(Pod::clone(&stale))),
            );
        }

        if first_sync {
            info!("Initial pod list complete ({} pods)", self.cache.len());
        }
        decisions
    }
}

fn identity(pod: &Pod) -> Option<PodIdentity> {
    match PodIdentity::from_meta(pod) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Skipping pod without identity: {}", e);
            None
        }
    }
}

fn change(previous: Option<Arc<Pod>>, pod: Pod) -> ObjectEvent<Pod> {
    match previous {
        Some(old) => ObjectEvent::Updated {
            old: Pod::clone(&old),
            new: pod,
        },
        None => ObjectEvent::Added(pod),
    }
}

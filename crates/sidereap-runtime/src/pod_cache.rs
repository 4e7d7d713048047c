use crate::error::{Result, RuntimeError};
use crate::traits::PodLister;
use futures_util::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher;
use parking_lot::Mutex;
use sidereap_core::{CoreError, PodIdentity};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reflector-backed store of the latest observed pods
///
/// Written only by the watch adapter; every worker reads it through [`PodLister`].
pub struct PodCache {
    reader: Store<Pod>,
    writer: Mutex<Writer<Pod>>,
}

impl PodCache {
    pub fn new() -> Self {
        let (reader, writer) = reflector::store();
        Self {
            reader,
            writer: Mutex::new(writer),
        }
    }

    /// Read handle onto the underlying store
    pub fn reader(&self) -> Store<Pod> {
        self.reader.clone()
    }

    /// Feed one raw watcher event into the store
    ///
    /// Relists are buffered by the writer and swapped in on `InitDone`, which also marks
    /// the store ready.
    pub fn apply_watcher_event(&self, event: &watcher::Event<Pod>) {
        self.writer.lock().apply_watcher_event(event);
    }

    pub fn lookup(&self, id: &PodIdentity) -> Option<Arc<Pod>> {
        self.reader.get(&object_ref(id))
    }

    /// Current contents keyed by identity
    pub fn snapshot(&self) -> HashMap<PodIdentity, Arc<Pod>> {
        self.reader
            .state()
            .into_iter()
            .filter_map(|pod| PodIdentity::from_meta(pod.as_ref()).ok().map(|id| (id, pod)))
            .collect()
    }

    /// Store the latest version of a pod, returning the version it replaced
    pub fn apply(&self, pod: Pod) -> Result<(Arc<Pod>, Option<Arc<Pod>>)> {
        let id = PodIdentity::from_meta(&pod)?;
        let previous = self.lookup(&id);
        self.apply_watcher_event(&watcher::Event::Apply(pod));
        let current = self
            .lookup(&id)
            .ok_or_else(|| RuntimeError::internal_error(format!("pod {} missing after apply", id)))?;
        Ok((current, previous))
    }

    /// Forget a pod
    pub fn remove(&self, id: &PodIdentity) -> Option<Arc<Pod>> {
        let previous = self.lookup(id)?;
        self.apply_watcher_event(&watcher::Event::Delete(Pod::clone(&previous)));
        Some(previous)
    }

    /// Replace the whole contents with a complete list and mark the store synced
    ///
    /// Returns the pods that were cached but are absent from `pods`.
    pub fn replace(&self, pods: Vec<Pod>) -> Vec<Arc<Pod>> {
        let mut previous = self.snapshot();
        let mut writer = self.writer.lock();
        writer.apply_watcher_event(&watcher::Event::Init);
        for pod in pods {
            if let Ok(id) = PodIdentity::from_meta(&pod) {
                previous.remove(&id);
                writer.apply_watcher_event(&watcher::Event::InitApply(pod));
            }
        }
        writer.apply_watcher_event(&watcher::Event::InitDone);
        previous.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    /// Whether the initial list has completed
    pub fn has_synced(&self) -> bool {
        matches!(self.reader.wait_until_ready().now_or_never(), Some(Ok(())))
    }

    /// Wait until the initial list is complete
    pub async fn wait_synced(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.reader.wait_until_ready()).await {
            Ok(Ok(())) => {
                debug!("Pod cache synced with {} pods", self.len());
                Ok(())
            }
            Ok(Err(e)) => Err(RuntimeError::internal_error(e.to_string())),
            Err(_) => Err(RuntimeError::cache_sync_timeout(timeout.as_secs())),
        }
    }
}

impl Default for PodCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PodLister for PodCache {
    fn get(&self, id: &PodIdentity) -> Result<Arc<Pod>> {
        self.lookup(id)
            .ok_or_else(|| CoreError::pod_not_found(id.to_string()).into())
    }
}

fn object_ref(id: &PodIdentity) -> ObjectRef<Pod> {
    ObjectRef::new(&id.name).within(&id.namespace)
}

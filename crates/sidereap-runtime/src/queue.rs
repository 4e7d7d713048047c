use crate::rate_limit::{RateLimiter, RateLimiterConfig};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for the reconcile queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Backoff applied to retried items
    pub rate_limit: RateLimiterConfig,
    /// Retries allowed before an item is dropped
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimiterConfig::default(),
            max_retries: 15,
        }
    }
}

struct QueueState<K> {
    /// Keys ready to be handed out, in arrival order
    queue: VecDeque<K>,
    /// Keys waiting to be processed (queued, or re-added while in flight)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited work queue
///
/// A key is held by at most one worker at a time. Enqueuing a key that is already
/// pending is a no-op; enqueuing a key that is being processed parks it until the
/// worker calls [`mark_done`](Self::mark_done), after which it is delivered again.
pub struct ReconcileQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: RateLimiter<K>,
    max_retries: u32,
    shutdown: CancellationToken,
}

impl<K> ReconcileQueue<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: RateLimiter::new(config.rate_limit),
            max_retries: config.max_retries,
            shutdown: CancellationToken::new(),
        })
    }

    /// Mark `item` as needing processing
    pub fn enqueue(&self, item: K) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn dequeue(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers see the remaining items
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item` and clear its retry history
    pub fn mark_done(&self, item: &K) {
        self.limiter.forget(item);
        self.done(item);
    }

    /// Finish processing `item` and schedule it again after a backoff
    ///
    /// Returns `false` when the retry ceiling was reached and the item was dropped.
    pub fn mark_done_and_retry(self: &Arc<Self>, item: K) -> bool {
        let requeues = self.limiter.num_requeues(&item);
        if requeues >= self.max_retries {
            warn!(
                "Dropping {} after {} retries",
                item, requeues
            );
            self.limiter.forget(&item);
            self.done(&item);
            return false;
        }

        let delay = self.limiter.when(&item);
        debug!("Requeuing {} in {:?} (retry {})", item, delay, requeues + 1);
        self.enqueue_after(item.clone(), delay);
        self.done(&item);
        true
    }

    /// Enqueue `item` once `delay` has elapsed, unless the queue shuts down first
    pub fn enqueue_after(self: &Arc<Self>, item: K, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }

        let queue = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.enqueue(item),
            }
        });
    }

    /// Stop handing out items and abandon pending delayed retries
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Failures recorded for `item` since it last succeeded
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    fn done(&self, item: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidereap_core::PodIdentity;

    fn pod(name: &str) -> PodIdentity {
        PodIdentity::new("batch", name)
    }

    fn fast_config(max_retries: u32) -> QueueConfig {
        QueueConfig {
            rate_limit: RateLimiterConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_secs(1),
                qps: 0.0,
                burst: 0,
            },
            max_retries,
        }
    }

    #[tokio::test]
    async fn test_burst_enqueues_collapse() {
        let queue = ReconcileQueue::new(QueueConfig::default());
        for _ in 0..10 {
            queue.enqueue(pod("pi"));
        }
        assert_eq!(queue.len(), 1);

        let item = queue.dequeue().await.unwrap();
        assert_eq!(item, pod("pi"));
        assert!(queue.is_empty());
        queue.mark_done(&item);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_across_distinct_keys() {
        let queue = ReconcileQueue::new(QueueConfig::default());
        queue.enqueue(pod("a"));
        queue.enqueue(pod("b"));
        queue.enqueue(pod("a"));

        assert_eq!(queue.dequeue().await.unwrap(), pod("a"));
        assert_eq!(queue.dequeue().await.unwrap(), pod("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_while_processing_is_held_back() {
        let queue = ReconcileQueue::new(QueueConfig::default());
        queue.enqueue(pod("pi"));
        let item = queue.dequeue().await.unwrap();

        // Re-enqueued twice while in flight: not visible to other workers
        queue.enqueue(pod("pi"));
        queue.enqueue(pod("pi"));
        assert!(queue.is_empty());

        queue.mark_done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await.unwrap(), pod("pi"));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = ReconcileQueue::new(QueueConfig::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue(pod("pi"));
        assert_eq!(waiter.await.unwrap(), Some(pod("pi")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue: Arc<ReconcileQueue<PodIdentity>> = ReconcileQueue::new(QueueConfig::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        // Nothing is accepted or handed out afterwards
        queue.enqueue(pod("pi"));
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_redelivers_after_backoff() {
        let queue = ReconcileQueue::new(fast_config(5));
        queue.enqueue(pod("pi"));
        let item = queue.dequeue().await.unwrap();

        assert!(queue.mark_done_and_retry(item));
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues(&pod("pi")), 1);

        let again = queue.dequeue().await.unwrap();
        assert_eq!(again, pod("pi"));

        queue.mark_done(&again);
        assert_eq!(queue.num_requeues(&pod("pi")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_drops_item() {
        let queue = ReconcileQueue::new(fast_config(2));
        queue.enqueue(pod("pi"));

        let item = queue.dequeue().await.unwrap();
        assert!(queue.mark_done_and_retry(item));
        let item = queue.dequeue().await.unwrap();
        assert!(queue.mark_done_and_retry(item));
        let item = queue.dequeue().await.unwrap();
        assert!(!queue.mark_done_and_retry(item));

        assert_eq!(queue.num_requeues(&pod("pi")), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_delayed_retries() {
        let queue = ReconcileQueue::new(fast_config(5));
        queue.enqueue_after(pod("pi"), Duration::from_secs(10));
        queue.shutdown();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_at_most_one_worker_per_key() {
        let queue = ReconcileQueue::new(QueueConfig::default());
        queue.enqueue(pod("pi"));
        let first = queue.dequeue().await.unwrap();
        queue.enqueue(pod("pi"));

        // A second worker must not receive the same key while the first holds it
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        queue.mark_done(&first);
        assert_eq!(second.await.unwrap(), Some(pod("pi")));
    }
}

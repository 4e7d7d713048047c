use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff settings for requeued work items
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// First per-item retry delay; doubles on every consecutive failure
    pub base_delay: Duration,
    /// Ceiling for the per-item delay
    pub max_delay: Duration,
    /// Sustained overall retry rate (items per second); 0 disables the bucket
    pub qps: f64,
    /// Retries allowed in a burst before the overall rate applies
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Token bucket that hands out reservations, going into debt when empty
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last: Instant::now(),
        }
    }

    /// Take one token and return how long the caller must wait for it
    fn reserve(&mut self) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Per-item exponential backoff combined with an overall token bucket
///
/// The delay for an item is the larger of the two limits.
pub struct RateLimiter<K> {
    config: RateLimiterConfig,
    failures: Mutex<HashMap<K, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: RateLimiterConfig) -> Self {
        let bucket = TokenBucket::new(config.qps, config.burst);
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(bucket),
        }
    }

    /// Record a failure for `item` and return the delay before its next attempt
    pub fn when(&self, item: &K) -> Duration {
        let item_delay = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count += 1;
            self.exponential(exp)
        };
        let bucket_delay = self.bucket.lock().reserve();
        item_delay.max(bucket_delay)
    }

    /// Number of failures recorded for `item` since it was last forgotten
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }

    /// Clear the failure history of `item`
    pub fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn exponential(&self, exp: u32) -> Duration {
        match 2u32
            .checked_pow(exp)
            .and_then(|factor| self.config.base_delay.checked_mul(factor))
        {
            Some(delay) if delay <= self.config.max_delay => delay,
            _ => self.config.max_delay,
        }
    }
}

//! Per-key retry delays.

use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Decides how long a failing key waits before it is queued again.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `key`; records one more failure.
    fn when(&self, key: &K) -> Duration;
    /// Clear the failure history of `key`.
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) }
    }
}

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialBackoff<K> {
    cfg: BackoffConfig,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, failures: Mutex::new(FxHashMap::default()) }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        let factor = 2f64.powi(exp.min(63) as i32);
        let nanos = self.cfg.base.as_nanos() as f64 * factor;
        if nanos >= self.cfg.max.as_nanos() as f64 {
            self.cfg.max
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialBackoff<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let entry = failures.entry(key.clone()).or_insert(0);
        let exp = *entry;
        *entry = entry.saturating_add(1);
        self.delay_for(exp)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

//! relctl retry queue: a deduplicating work queue of keys with per-key
//! processing tracking and rate-limited re-adds.
//!
//! A key is held at most once in the pending FIFO. While a worker holds a key
//! (between [`RetryQueue::get`] and [`RetryQueue::done`]) the key is never
//! handed to another worker; adds that arrive meanwhile are remembered and the
//! key becomes pending again on `done`.

#![forbid(unsafe_code)]

mod limiter;

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use limiter::{BackoffConfig, ExponentialBackoff, RateLimiter};

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: everything in `queue` plus keys re-added
    /// while in `processing`.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Arc<dyn RateLimiter<K>>,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share one queue.
pub struct RetryQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RetryQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> RetryQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(backoff: BackoffConfig) -> Self {
        Self::with_rate_limiter(Arc::new(ExponentialBackoff::new(backoff)))
    }

    pub fn with_rate_limiter(limiter: Arc<dyn RateLimiter<K>>) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            shutting_down: false,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                notify: Notify::new(),
                limiter,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue `key` unless it is already pending. A key currently being
    /// processed is marked and re-queued by [`RetryQueue::done`].
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        st.dirty.insert(key.clone());
        counter!("relctl_queue_adds_total", 1u64);
        if st.processing.contains(&key) {
            return;
        }
        st.queue.push_back(key);
        gauge!("relctl_queue_depth", st.queue.len() as f64);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed. Dropped if the queue shuts down first.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let q = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => q.add(key),
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Re-queue `key` after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        counter!("relctl_queue_retries_total", 1u64);
        self.add_after(key, delay);
    }

    /// Reset the failure history of `key`.
    pub fn forget(&self, key: &K) { self.inner.limiter.forget(key) }

    pub fn num_requeues(&self, key: &K) -> u32 { self.inner.limiter.num_requeues(key) }

    /// Wait for the next key. `None` once the queue is shut down.
    ///
    /// Cancel-safe: a key is only taken from the queue when it is returned.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a shut_down in between still wakes us.
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("relctl_queue_depth", st.queue.len() as f64);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer processing.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            gauge!("relctl_queue_depth", st.queue.len() as f64);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Stop the queue: every waiting and future `get` returns `None`, adds are ignored.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            debug!(pending = st.queue.len(), processing = st.processing.len(), "retry queue shutting down");
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of pending keys (not counting keys in flight).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of keys currently handed out to workers.
    pub fn in_flight(&self) -> usize { self.lock().processing.len() }
}

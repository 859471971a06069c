use std::sync::atomic::{AtomicBool, Ordering};

use relctl_core::{KeyError, Release, ReleaseKey};
use relctl_queue::RetryQueue;
use relctl_store::{DeletedRelease, EventHandler};
use tracing::{debug, error};

/// Maps cache notifications to queue keys. Adds, updates and deletes all take
/// the same path; the worker finds out which it was from the cache.
pub struct EnqueueHandler {
    queue: RetryQueue<ReleaseKey>,
    stopped: AtomicBool,
}

impl EnqueueHandler {
    pub fn new(queue: RetryQueue<ReleaseKey>) -> Self {
        Self { queue, stopped: AtomicBool::new(false) }
    }

    /// Ignore all further notifications.
    pub fn stop(&self) { self.stopped.store(true, Ordering::SeqCst) }

    pub fn is_stopped(&self) -> bool { self.stopped.load(Ordering::SeqCst) }

    fn enqueue(&self, key: Result<ReleaseKey, KeyError>) {
        if self.is_stopped() {
            return;
        }
        match key {
            Ok(key) => {
                debug!(key = %key, "enqueue");
                self.queue.add(key);
            }
            Err(e) => error!(error = %e, "can't get release key"),
        }
    }
}

impl EventHandler for EnqueueHandler {
    fn on_add(&self, obj: &Release) { self.enqueue(ReleaseKey::for_release(obj)) }

    fn on_update(&self, _old: &Release, new: &Release) { self.enqueue(ReleaseKey::for_release(new)) }

    fn on_delete(&self, obj: &DeletedRelease) {
        let key = match obj {
            DeletedRelease::Final(o) => ReleaseKey::for_release(o),
            DeletedRelease::Tombstone { key, .. } => Ok(key.clone()),
        };
        self.enqueue(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relctl_core::ReleaseSpec;
    use relctl_queue::BackoffConfig;
    use std::sync::Arc;

    fn rel(ns: Option<&str>, name: &str) -> Release {
        let mut r = Release::new(name, ReleaseSpec::default());
        r.metadata.namespace = ns.map(str::to_string);
        r
    }

    #[test]
    fn every_notification_kind_enqueues_the_same_key() {
        let q = RetryQueue::new(BackoffConfig::default());
        let h = EnqueueHandler::new(q.clone());
        let r = rel(Some("a"), "r1");
        h.on_add(&r);
        h.on_update(&r, &r);
        h.on_delete(&DeletedRelease::Final(Arc::new(r.clone())));
        h.on_delete(&DeletedRelease::Tombstone { key: ReleaseKey::new("a", "r1"), last_known: Arc::new(r) });
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn tombstone_key_is_used_even_if_object_is_stale() {
        let q = RetryQueue::new(BackoffConfig::default());
        let h = EnqueueHandler::new(q.clone());
        let stale = rel(None, "r1");
        h.on_delete(&DeletedRelease::Tombstone { key: ReleaseKey::new("a", "r1"), last_known: Arc::new(stale) });
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn keyless_objects_are_dropped() {
        let q = RetryQueue::new(BackoffConfig::default());
        let h = EnqueueHandler::new(q.clone());
        h.on_add(&rel(None, "r1"));
        assert!(q.is_empty());
    }

    #[test]
    fn stopped_handler_ignores_notifications() {
        let q = RetryQueue::new(BackoffConfig::default());
        let h = EnqueueHandler::new(q.clone());
        h.stop();
        h.on_add(&rel(Some("a"), "r1"));
        assert!(q.is_empty());
    }
}

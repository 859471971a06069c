//! relctl store: in-RAM release cache fed by watch deltas.
//!
//! The ingest loop applies each delta to the cache, publishes a new snapshot,
//! and only then notifies the registered [`EventHandler`], so a handler that
//! looks an object up always sees at least the state it was notified about.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::gauge;
use relctl_core::{Delta, Release, ReleaseKey};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<ReleaseKey, Arc<Release>>,
}

/// A deletion as seen by handlers.
#[derive(Debug, Clone)]
pub enum DeletedRelease {
    /// Final state observed on the watch.
    Final(Arc<Release>),
    /// Disappeared during a relist; `last_known` may be stale.
    Tombstone { key: ReleaseKey, last_known: Arc<Release> },
}

/// Receives cache change notifications.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: &Release);
    fn on_update(&self, old: &Release, new: &Release);
    fn on_delete(&self, obj: &DeletedRelease);
}

#[derive(Debug, Clone)]
pub enum Notification {
    Add(Arc<Release>),
    Update { old: Arc<Release>, new: Arc<Release> },
    Delete(DeletedRelease),
}

impl Notification {
    pub fn dispatch(&self, handler: &dyn EventHandler) {
        match self {
            Notification::Add(o) => handler.on_add(o),
            Notification::Update { old, new } => handler.on_update(old, new),
            Notification::Delete(d) => handler.on_delete(d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("release cache unavailable: {0}")]
    Unavailable(String),
}

/// Read access to cached releases.
pub trait ReleaseLister: Send + Sync {
    /// `Ok(None)` when the release does not exist.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Release>>, LookupError>;
    fn has_synced(&self) -> bool;
}

/// Applies deltas to the cached item map.
#[derive(Default)]
pub struct CacheBuilder {
    epoch: u64,
    items: FxHashMap<ReleaseKey, Arc<Release>>,
    synced: bool,
}

impl CacheBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn synced(&self) -> bool { self.synced }

    /// Apply one delta and return the notifications it produces.
    pub fn apply(&mut self, delta: Delta) -> Vec<Notification> {
        let mut out = Vec::with_capacity(delta.len());
        match delta {
            Delta::Applied(obj) => self.upsert(obj, &mut out),
            Delta::Deleted(obj) => {
                let obj = Arc::new(obj);
                if let Ok(key) = ReleaseKey::for_release(&obj) {
                    self.items.remove(&key);
                }
                out.push(Notification::Delete(DeletedRelease::Final(obj)));
            }
            Delta::Restarted(list) => {
                let mut previous = std::mem::take(&mut self.items);
                for obj in list {
                    if let Ok(key) = ReleaseKey::for_release(&obj) {
                        if let Some(old) = previous.remove(&key) {
                            self.items.insert(key.clone(), old);
                        }
                    }
                    self.upsert(obj, &mut out);
                }
                let mut gone: Vec<_> = previous.into_iter().collect();
                gone.sort_by(|a, b| a.0.cmp(&b.0));
                for (key, last_known) in gone {
                    out.push(Notification::Delete(DeletedRelease::Tombstone { key, last_known }));
                }
                if !self.synced {
                    info!(items = self.items.len(), "release cache synced");
                }
                self.synced = true;
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        out
    }

    fn upsert(&mut self, obj: Release, out: &mut Vec<Notification>) {
        let new = Arc::new(obj);
        match ReleaseKey::for_release(&new) {
            Ok(key) => match self.items.insert(key, Arc::clone(&new)) {
                Some(old) => out.push(Notification::Update { old, new }),
                None => out.push(Notification::Add(new)),
            },
            Err(e) => {
                warn!(error = %e, "release without a usable key is not cached");
                out.push(Notification::Add(new));
            }
        }
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Handle for readers to access the current snapshot and the sync state.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    synced_rx: watch::Receiver<bool>,
}

impl CacheHandle {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }

    /// Resolves `true` once the initial list is cached, `false` if ingest
    /// stopped before that.
    pub async fn wait_for_sync(&self) -> bool {
        let mut rx = self.synced_rx.clone();
        let synced = rx.wait_for(|synced| *synced).await.is_ok();
        synced
    }
}

impl ReleaseLister for CacheHandle {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Release>>, LookupError> {
        Ok(self.snap.load().items.get(&ReleaseKey::new(namespace, name)).cloned())
    }

    fn has_synced(&self) -> bool { *self.synced_rx.borrow() }
}

/// Spawn the ingest loop. Deltas sent on the returned channel update the cache
/// and are then dispatched to `handler`. The loop ends when all senders drop.
pub fn spawn_ingest(cap: usize, handler: Arc<dyn EventHandler>) -> (mpsc::Sender<Delta>, CacheHandle) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (synced_tx, synced_rx) = watch::channel(false);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut builder = CacheBuilder::new();
        while let Some(delta) = rx.recv().await {
            let notes = builder.apply(delta);
            let next = builder.freeze();
            gauge!("relctl_cache_items", next.items.len() as f64);
            snap_clone.store(next);
            if builder.synced() && !*synced_tx.borrow() {
                synced_tx.send_replace(true);
            }
            for n in &notes {
                n.dispatch(handler.as_ref());
            }
        }
        debug!("delta channel closed; exiting ingest loop");
        info!("ingest loop stopped");
    });

    (tx, CacheHandle { snap, synced_rx })
}

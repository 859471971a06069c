#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use relctl_controller::{BackoffConfig, ControllerConfig, EnqueueHandler, ReleaseController, ReleaseManager, RetryQueue};
use relctl_core::{Release, ReleaseKey, ReleaseSpec};
use relctl_store::{LookupError, ReleaseLister};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run,
    Trigger(String),
    Delete(String, String),
}

#[derive(Default)]
pub struct FakeManager {
    pub calls: Mutex<Vec<Call>>,
    pub fail_triggers: AtomicUsize,
    pub trigger_delay: Mutex<Option<Duration>>,
    pub finished_triggers: AtomicUsize,
}

impl FakeManager {
    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    pub fn fail_next_triggers(&self, n: usize) { self.fail_triggers.store(n, Ordering::SeqCst) }

    pub fn slow_triggers(&self, d: Duration) { *self.trigger_delay.lock().unwrap() = Some(d) }
}

#[async_trait::async_trait]
impl ReleaseManager for FakeManager {
    async fn trigger(&self, release: &Release) -> Result<()> {
        let key = ReleaseKey::for_release(release)?;
        self.calls.lock().unwrap().push(Call::Trigger(key.to_string()));
        let delay = *self.trigger_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.finished_triggers.fetch_add(1, Ordering::SeqCst);
        let left = self.fail_triggers.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_triggers.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("apply rejected"));
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Delete(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Run);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLister {
    pub items: Mutex<HashMap<(String, String), Arc<Release>>>,
    pub synced: AtomicBool,
    pub broken: Mutex<HashSet<(String, String)>>,
}

impl FakeLister {
    pub fn synced() -> Self {
        let l = Self::default();
        l.synced.store(true, Ordering::SeqCst);
        l
    }

    pub fn insert(&self, ns: &str, name: &str) {
        self.items.lock().unwrap().insert((ns.into(), name.into()), Arc::new(release(ns, name)));
    }

    pub fn remove(&self, ns: &str, name: &str) { self.items.lock().unwrap().remove(&(ns.into(), name.into())); }

    pub fn break_lookup(&self, ns: &str, name: &str) { self.broken.lock().unwrap().insert((ns.into(), name.into())); }

    pub fn fix_lookup(&self, ns: &str, name: &str) { self.broken.lock().unwrap().remove(&(ns.into(), name.into())); }
}

impl ReleaseLister for FakeLister {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Release>>, LookupError> {
        let id = (namespace.to_string(), name.to_string());
        if self.broken.lock().unwrap().contains(&id) {
            return Err(LookupError::Unavailable("cache offline".into()));
        }
        Ok(self.items.lock().unwrap().get(&id).cloned())
    }

    fn has_synced(&self) -> bool { self.synced.load(Ordering::SeqCst) }
}

pub fn release(ns: &str, name: &str) -> Release {
    let mut r = Release::new(name, ReleaseSpec::default());
    r.metadata.namespace = Some(ns.to_string());
    r
}

pub struct Harness {
    pub manager: Arc<FakeManager>,
    pub lister: Arc<FakeLister>,
    pub handler: Arc<EnqueueHandler>,
    pub controller: Arc<ReleaseController>,
}

impl Harness {
    pub fn new(lister: FakeLister, cfg: ControllerConfig) -> Self {
        let backoff = BackoffConfig { base: Duration::from_millis(5), max: Duration::from_secs(1) };
        let queue = RetryQueue::new(backoff);
        let handler = Arc::new(EnqueueHandler::new(queue.clone()));
        let manager = Arc::new(FakeManager::default());
        let lister = Arc::new(lister);
        let controller = Arc::new(ReleaseController::new(
            queue,
            handler.clone(),
            manager.clone() as Arc<dyn ReleaseManager>,
            lister.clone() as Arc<dyn ReleaseLister>,
            cfg,
        ));
        Self { manager, lister, handler, controller }
    }

    pub fn queue(&self) -> &RetryQueue<ReleaseKey> { self.controller.queue() }
}

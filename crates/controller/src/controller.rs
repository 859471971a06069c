use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use relctl_core::ReleaseKey;
use relctl_queue::RetryQueue;
use relctl_store::ReleaseLister;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ControllerError, ReconcileError};
use crate::handler::EnqueueHandler;
use crate::manager::ReleaseManager;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers.
    pub workers: usize,
    /// Give up when the cache has not synced after this long. `None` waits
    /// until stopped.
    pub sync_timeout: Option<Duration>,
    /// How often to poll the lister for sync.
    pub sync_poll: Duration,
    /// Re-run the consistency sweep this often while workers are idle.
    pub sweep_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 1, sync_timeout: None, sync_poll: Duration::from_millis(100), sweep_period: None }
    }
}

enum Synced {
    Yes,
    Stopped,
    TimedOut(Duration),
}

enum Drained {
    Idle,
    ShutDown,
}

/// Drives releases from the queue to the [`ReleaseManager`].
pub struct ReleaseController {
    queue: RetryQueue<ReleaseKey>,
    handler: Arc<EnqueueHandler>,
    manager: Arc<dyn ReleaseManager>,
    lister: Arc<dyn ReleaseLister>,
    cfg: ControllerConfig,
    sweep_lock: Mutex<()>,
}

impl ReleaseController {
    /// `handler` must feed `queue`; it is stopped on shutdown.
    pub fn new(
        queue: RetryQueue<ReleaseKey>,
        handler: Arc<EnqueueHandler>,
        manager: Arc<dyn ReleaseManager>,
        lister: Arc<dyn ReleaseLister>,
        cfg: ControllerConfig,
    ) -> Self {
        Self { queue, handler, manager, lister, cfg, sweep_lock: Mutex::new(()) }
    }

    pub fn queue(&self) -> &RetryQueue<ReleaseKey> { &self.queue }

    /// Wait for the cache, sweep once, then reconcile until `stop` fires.
    /// Returns after every worker has finished its current item.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<(), ControllerError> {
        info!(workers = self.cfg.workers, "starting release controller");
        match self.wait_for_cache_sync(&stop).await {
            Synced::Yes => info!("release cache synced"),
            Synced::Stopped => {
                info!("stopped before release cache synced");
                self.shutdown();
                return Ok(());
            }
            Synced::TimedOut(waited) => {
                error!(waited_ms = waited.as_millis() as u64, "release cache did not sync");
                self.shutdown();
                return Err(ControllerError::CacheSync { waited });
            }
        }

        self.sweep().await;

        let workers = self.cfg.workers.max(1);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers);
        for id in 0..workers {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move { this.worker(id).await }));
        }

        stop.cancelled().await;
        info!("shutting down release controller");
        self.shutdown();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "release worker aborted");
            }
        }
        info!("release controller stopped");
        Ok(())
    }

    /// Take one key, reconcile it, and settle its queue state. Returns false
    /// once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        match self.queue.get().await {
            Some(key) => {
                self.process(key).await;
                true
            }
            None => false,
        }
    }

    /// Run the manager's consistency sweep. Never overlaps with itself.
    pub async fn sweep(&self) {
        let _guard = self.sweep_lock.lock().await;
        info!("processing releases");
        if let Err(e) = self.manager.run().await {
            error!(error = %format!("{e:#}"), "release sweep failed");
        }
    }

    fn shutdown(&self) {
        self.handler.stop();
        self.queue.shut_down();
    }

    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> Synced {
        let started = Instant::now();
        let mut tick = tokio::time::interval(self.cfg.sync_poll);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Synced::Stopped,
                _ = tick.tick() => {}
            }
            if self.lister.has_synced() {
                return Synced::Yes;
            }
            if let Some(limit) = self.cfg.sync_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Synced::TimedOut(waited);
                }
            }
        }
    }

    async fn worker(&self, id: usize) {
        debug!(worker = id, "release worker started");
        let mut first = true;
        loop {
            if !first && self.cfg.sweep_period.is_some() {
                self.sweep().await;
            }
            first = false;
            match self.drain().await {
                Drained::Idle => continue,
                Drained::ShutDown => break,
            }
        }
        debug!(worker = id, "release worker stopped");
    }

    /// Process items until the queue shuts down, or until it stays empty for a
    /// full sweep period.
    async fn drain(&self) -> Drained {
        loop {
            let next = match self.cfg.sweep_period {
                Some(period) => match tokio::time::timeout(period, self.queue.get()).await {
                    Ok(next) => next,
                    Err(_) => return Drained::Idle,
                },
                None => self.queue.get().await,
            };
            match next {
                Some(key) => self.process(key).await,
                None => return Drained::ShutDown,
            }
        }
    }

    async fn process(&self, key: ReleaseKey) {
        let started = Instant::now();
        debug!(key = %key, "handle release");
        match self.reconcile(&key).await {
            Ok(action) => {
                self.queue.forget(&key);
                debug!(key = %key, action, "handled release");
                counter!("relctl_reconcile_total", 1u64, "result" => "ok");
            }
            Err(e) if !e.is_retryable() => {
                self.queue.forget(&key);
                error!(key = %key, error = %e, "dropping release key");
                counter!("relctl_reconcile_total", 1u64, "result" => e.label());
            }
            Err(e) => {
                self.queue.add_rate_limited(key.clone());
                warn!(key = %key, requeues = self.queue.num_requeues(&key), error = %e, "requeue release");
                counter!("relctl_reconcile_total", 1u64, "result" => e.label());
            }
        }
        self.queue.done(&key);
        histogram!("relctl_reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    async fn reconcile(&self, key: &ReleaseKey) -> Result<&'static str, ReconcileError> {
        let (namespace, name) = key.split()?;
        match self.lister.get(namespace, name)? {
            None => {
                info!(namespace, name, "release is gone; deleting");
                self.manager
                    .delete(namespace, name)
                    .await
                    .map_err(|source| ReconcileError::Convergence { action: "delete", source })?;
                Ok("delete")
            }
            Some(release) => {
                self.manager
                    .trigger(&release)
                    .await
                    .map_err(|source| ReconcileError::Convergence { action: "trigger", source })?;
                Ok("trigger")
            }
        }
    }
}

//! relctl manager: converges releases onto the cluster.
//!
//! `trigger` renders a release's manifests, applies them with server-side
//! apply, prunes what the previous revision had and the new one drops, and
//! records the result in the ledger. Conditions are written before and after.
//!
//! The resources a release owns are the latest recorded revision plus any
//! pending apply. The pending set is written before the first apply, so
//! `delete` and the orphan sweep also reach resources of a failed or
//! interrupted apply.

#![forbid(unsafe_code)]

mod apply;
mod digest;
mod error;
mod render;
mod status;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kube::Client;
use metrics::{counter, histogram};
use relctl_controller::ReleaseManager;
use relctl_core::{Clock, Condition, ConditionType, Reason, Release, ReleaseKey, ReleaseStatus, SystemClock};
use relctl_persist::{now_ts, Ledger, PendingApply, ResourceRef, Revision};
use relctl_store::ReleaseLister;
use tracing::{debug, info, warn};

pub use apply::{Applier, KubeApplier, DEFAULT_FIELD_MANAGER};
pub use digest::spec_digest;
pub use error::ManagerError;
pub use render::{PassthroughRenderer, RenderedObject, Renderer, MANAGED_BY_LABEL, RELEASE_LABEL};
pub use status::{KubeStatusBackend, StatusBackend};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub field_manager: String,
    pub max_yaml_bytes: usize,
    pub max_yaml_nodes: usize,
    /// Namespace the release cache covers; `None` for all namespaces.
    pub namespace: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let r = PassthroughRenderer::default();
        Self { field_manager: DEFAULT_FIELD_MANAGER.to_string(), max_yaml_bytes: r.max_bytes, max_yaml_nodes: r.max_nodes, namespace: None }
    }
}

pub struct Manager {
    renderer: Arc<dyn Renderer>,
    applier: Arc<dyn Applier>,
    status: Arc<dyn StatusBackend>,
    ledger: Arc<dyn Ledger>,
    lister: Arc<dyn ReleaseLister>,
    clock: Arc<dyn Clock>,
    namespace: Option<String>,
}

/// Resources a release key owns and the uid that owns them.
struct Owned {
    uid: String,
    resources: Vec<ResourceRef>,
}

impl Manager {
    pub fn new(
        applier: Arc<dyn Applier>,
        status: Arc<dyn StatusBackend>,
        ledger: Arc<dyn Ledger>,
        lister: Arc<dyn ReleaseLister>,
    ) -> Self {
        Self {
            renderer: Arc::new(PassthroughRenderer::default()),
            applier,
            status,
            ledger,
            lister,
            clock: Arc::new(SystemClock),
            namespace: None,
        }
    }

    /// Manager wired to a live cluster.
    pub fn for_cluster(client: Client, ledger: Arc<dyn Ledger>, lister: Arc<dyn ReleaseLister>, cfg: &ManagerConfig) -> Self {
        let renderer = PassthroughRenderer { max_bytes: cfg.max_yaml_bytes, max_nodes: cfg.max_yaml_nodes };
        Self::new(
            Arc::new(KubeApplier::new(client.clone(), cfg.field_manager.clone())),
            Arc::new(KubeStatusBackend::new(client)),
            ledger,
            lister,
        )
        .with_renderer(Arc::new(renderer))
        .with_namespace(cfg.namespace.clone())
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Limit the orphan sweep to releases of `namespace`. Ledger keys of other
    /// namespaces are not in the cache and must not be treated as orphans.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    fn owned(&self, key: &ReleaseKey) -> Result<Option<Owned>> {
        let latest = self.ledger.latest(key.as_str())?;
        let pending = self.ledger.pending(key.as_str())?;
        let owned = match (latest, pending) {
            (None, None) => None,
            (Some(rev), None) => Some(Owned { uid: rev.uid, resources: rev.resources }),
            (latest, Some(p)) => {
                let mut resources = latest.map(|r| r.resources).unwrap_or_default();
                for r in p.resources {
                    if !resources.contains(&r) {
                        resources.push(r);
                    }
                }
                Some(Owned { uid: p.uid, resources })
            }
        };
        Ok(owned)
    }

    async fn write_condition(&self, ns: &str, name: &str, status: &mut ReleaseStatus, cond: Condition) -> Result<()> {
        status.set_condition(cond);
        self.status.update_status(ns, name, status).await
    }

    /// Apply, prune and record. Returns the new revision number.
    async fn converge(
        &self,
        key: &ReleaseKey,
        release: &Release,
        uid: &str,
        previous: Option<&Revision>,
    ) -> Result<(u32, String)> {
        let manifests = match release.spec.rollback_to {
            Some(n) => {
                let rev = self.ledger.revision(key.as_str(), n)?;
                rev.ok_or_else(|| ManagerError::UnknownRevision { key: key.to_string(), revision: n })?.manifests
            }
            None => release.spec.manifests.clone(),
        };
        let objects = self.renderer.render(release, &manifests)?;
        self.ledger.begin(PendingApply {
            key: key.to_string(),
            uid: uid.to_string(),
            ts: now_ts(),
            resources: objects.iter().map(|o| o.resource.clone()).collect(),
        })?;
        for obj in &objects {
            self.applier.apply(obj).await?;
            debug!(key = %key, resource = %obj.resource, "applied");
        }

        // Earlier failed attempts may have left resources the new set drops.
        let keep: BTreeSet<_> = objects.iter().map(|o| &o.resource).collect();
        let mut stale: Vec<ResourceRef> = previous.map(|p| p.resources.clone()).unwrap_or_default();
        if let Some(p) = self.ledger.pending(key.as_str())? {
            stale.extend(p.resources);
        }
        let stale: BTreeSet<_> = stale.into_iter().filter(|r| !keep.contains(r)).collect();
        for r in &stale {
            let existed = self.applier.delete(r).await?;
            counter!("relctl_manager_prunes_total", 1u64);
            info!(key = %key, resource = %r, existed, "pruned");
        }

        let revision = match previous {
            Some(p) if p.uid == uid => p.revision + 1,
            Some(_) => {
                self.ledger.remove(key.as_str())?;
                1
            }
            None => 1,
        };
        self.ledger.record(Revision {
            key: key.to_string(),
            revision,
            uid: uid.to_string(),
            digest: spec_digest(&manifests, release.spec.config.as_ref()),
            ts: now_ts(),
            resources: objects.iter().map(|o| o.resource.clone()).collect(),
            manifests: manifests.clone(),
        })?;
        Ok((revision, manifests))
    }

    /// Delete every owned resource, newest first, then the ledger rows.
    async fn teardown(&self, key: &ReleaseKey, owned: &Owned) -> Result<()> {
        for r in owned.resources.iter().rev() {
            let existed = self.applier.delete(r).await.with_context(|| format!("tearing down {key}"))?;
            debug!(key = %key, resource = %r, existed, "deleted");
        }
        let rows = self.ledger.remove(key.as_str())?;
        info!(key = %key, resources = owned.resources.len(), rows, "release torn down");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReleaseManager for Manager {
    async fn trigger(&self, release: &Release) -> Result<()> {
        let t0 = Instant::now();
        let key = ReleaseKey::for_release(release)?;
        let (ns, name) = key.split()?;
        let uid = release.metadata.uid.clone().unwrap_or_default();
        let digest = spec_digest(&release.spec.manifests, release.spec.config.as_ref());
        let previous = self.ledger.latest(key.as_str())?;
        let in_progress = self.ledger.pending(key.as_str())?.is_some();
        let same_owner = previous.as_ref().is_some_and(|p| p.uid == uid);

        // A recorded revision is only written after a full apply, so a match
        // means the cluster already has this spec. The cached status may lag
        // behind our own writes; it only decides whether Available is rewritten.
        if let Some(prev) = previous.as_ref().filter(|p| {
            release.spec.rollback_to.is_none() && !in_progress && p.uid == uid && p.digest == digest
        }) {
            counter!("relctl_manager_noop_total", 1u64);
            let status = release.status.clone().unwrap_or_default();
            let available = status.authoritative().map(|c| c.type_) == Some(ConditionType::Available);
            if available && status.last_revision == Some(prev.revision) {
                debug!(key = %key, "release up to date");
                return Ok(());
            }
            let mut status = status;
            status.last_revision = Some(prev.revision);
            self.write_condition(ns, name, &mut status, Condition::available(self.clock.as_ref())).await?;
            debug!(key = %key, revision = prev.revision, "release up to date; status refreshed");
            return Ok(());
        }

        let reason = if release.spec.rollback_to.is_some() {
            Reason::Rollbacking
        } else if same_owner {
            Reason::Updating
        } else {
            Reason::Creating
        };
        info!(key = %key, reason = reason.as_str(), "converging release");
        let mut status = release.status.clone().unwrap_or_default();
        self.write_condition(ns, name, &mut status, Condition::for_reason(reason, "", self.clock.as_ref())).await?;

        let outcome = async {
            let (revision, manifests) = self.converge(&key, release, &uid, previous.as_ref()).await?;
            status.last_revision = Some(revision);
            self.write_condition(ns, name, &mut status, Condition::available(self.clock.as_ref())).await?;
            if release.spec.rollback_to.is_some() {
                self.status.complete_rollback(ns, name, &manifests).await?;
            }
            Ok::<u32, anyhow::Error>(revision)
        }
        .await;

        match outcome {
            Ok(revision) => {
                counter!("relctl_manager_applies_total", 1u64, "reason" => reason.as_str());
                histogram!("relctl_manager_trigger_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(key = %key, revision, "release available");
                Ok(())
            }
            Err(e) => {
                counter!("relctl_manager_failures_total", 1u64);
                let msg = format!("{e:#}");
                if let Err(se) = self.write_condition(ns, name, &mut status, Condition::failure(msg, self.clock.as_ref())).await {
                    warn!(key = %key, error = %se, "failed to record failure condition");
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ReleaseKey::new(namespace, name);
        match self.owned(&key)? {
            Some(owned) => self.teardown(&key, &owned).await,
            None => {
                debug!(key = %key, "nothing recorded for release");
                Ok(())
            }
        }
    }

    async fn run(&self) -> Result<()> {
        let keys = self.ledger.keys()?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut cleaned = 0usize;
        let mut failed = 0usize;
        for raw in keys {
            let key = ReleaseKey::from_raw(raw);
            let (ns, name) = match key.split() {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unrecognised ledger key");
                    continue;
                }
            };
            if self.namespace.as_deref().is_some_and(|scope| scope != ns) {
                debug!(key = %key, "outside the watched namespace");
                continue;
            }
            let Some(owned) = self.owned(&key)? else { continue };
            let orphaned = match self.lister.get(ns, name)? {
                None => true,
                Some(live) => live.metadata.uid.as_deref().unwrap_or_default() != owned.uid,
            };
            if !orphaned {
                continue;
            }
            match self.teardown(&key, &owned).await {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    failed += 1;
                    warn!(key = %key, error = %format!("{e:#}"), "orphan cleanup failed");
                }
            }
        }
        info!(cleaned, failed, "release sweep finished");
        if failed > 0 {
            return Err(anyhow!("{failed} orphaned releases could not be cleaned up"));
        }
        Ok(())
    }
}

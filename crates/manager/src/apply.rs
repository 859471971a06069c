use std::sync::Arc;

use anyhow::{anyhow, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Discovery,
    Client,
};
use metrics::{counter, histogram};
use relctl_kubehub::{find_api_resource, gvk_of, run_discovery};
use relctl_persist::ResourceRef;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ManagerError;
use crate::render::RenderedObject;

pub const DEFAULT_FIELD_MANAGER: &str = "relctl";

/// Creates, updates and deletes the resources of a release.
#[async_trait::async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, object: &RenderedObject) -> Result<()>;

    /// Returns false when the resource was already gone.
    async fn delete(&self, resource: &ResourceRef) -> Result<bool>;
}

/// Server-side apply against the cluster. Discovery is cached and refreshed
/// when a kind is not found.
pub struct KubeApplier {
    client: Client,
    field_manager: String,
    discovery: Mutex<Option<Arc<Discovery>>>,
}

impl KubeApplier {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), discovery: Mutex::new(None) }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let cached = self.discovery.lock().await.clone();
        if let Some(d) = cached {
            if let Ok(found) = find_api_resource(&d, gvk) {
                return Ok(found);
            }
        }
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "refreshing discovery");
        let fresh = Arc::new(run_discovery(self.client.clone()).await?);
        let found = find_api_resource(&fresh, gvk);
        *self.discovery.lock().await = Some(fresh);
        found
    }

    async fn api_for(&self, resource: &ResourceRef) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(&gvk_of(&resource.api_version, &resource.kind)).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match resource.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(ManagerError::NamespaceRequired { kind: resource.kind.clone(), name: resource.name.clone() }.into()),
        }
    }
}

#[async_trait::async_trait]
impl Applier for KubeApplier {
    async fn apply(&self, object: &RenderedObject) -> Result<()> {
        let t0 = std::time::Instant::now();
        let api = self.api_for(&object.resource).await?;
        let pp = PatchParams::apply(&self.field_manager);
        match api.patch(&object.resource.name, &pp, &Patch::Apply(&object.body)).await {
            Ok(_) => {
                histogram!("relctl_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("relctl_apply_ok_total", 1u64);
                Ok(())
            }
            Err(e) => {
                counter!("relctl_apply_err_total", 1u64);
                Err(anyhow!("server-side apply of {} failed: {}", object.resource, e))
            }
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<bool> {
        let api = self.api_for(resource).await?;
        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(anyhow!("deleting {} failed: {}", resource, e)),
        }
    }
}

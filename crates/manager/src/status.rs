use anyhow::{Context, Result};
use kube::{
    api::{Patch, PatchParams},
    Client,
};
use relctl_core::ReleaseStatus;
use relctl_kubehub::release_api;
use serde_json::json;

/// Where release status and rollback results are written.
#[async_trait::async_trait]
pub trait StatusBackend: Send + Sync {
    async fn update_status(&self, namespace: &str, name: &str, status: &ReleaseStatus) -> Result<()>;

    /// Point the release spec at the rolled-back manifests and clear
    /// `rollbackTo`.
    async fn complete_rollback(&self, namespace: &str, name: &str, manifests: &str) -> Result<()>;
}

/// Writes through the `releases` status subresource.
pub struct KubeStatusBackend {
    client: Client,
}

impl KubeStatusBackend {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl StatusBackend for KubeStatusBackend {
    async fn update_status(&self, namespace: &str, name: &str, status: &ReleaseStatus) -> Result<()> {
        let api = release_api(self.client.clone(), Some(namespace));
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("updating status of {namespace}/{name}"))?;
        Ok(())
    }

    async fn complete_rollback(&self, namespace: &str, name: &str, manifests: &str) -> Result<()> {
        let api = release_api(self.client.clone(), Some(namespace));
        let patch = json!({ "spec": { "manifests": manifests, "rollbackTo": null } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("completing rollback of {namespace}/{name}"))?;
        Ok(())
    }
}

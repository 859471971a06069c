use anyhow::Result;
use relctl_core::Release;

/// Performs the actual work for a release. Every method must be safe to call
/// repeatedly with unchanged input.
#[async_trait::async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Converge live resources toward `release`'s spec and record the outcome
    /// as a condition on the release. Errors are retried with backoff.
    async fn trigger(&self, release: &Release) -> Result<()>;

    /// Tear down everything owned by a release that no longer exists.
    /// Nothing to delete is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Repair state left behind by an unclean shutdown. Cheap when there is
    /// nothing to repair.
    async fn run(&self) -> Result<()>;
}

use std::time::Duration;

use relctl_core::KeyError;
use relctl_store::LookupError;
use thiserror::Error;

/// Failures that end a controller run.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("release cache did not sync within {waited:?}")]
    CacheSync { waited: Duration },
}

/// Why a single work item did not converge.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Not retried: a malformed key stays malformed.
    #[error("can't recognize release key: {0}")]
    Key(#[from] KeyError),
    #[error("release lookup failed: {0}")]
    Lookup(#[from] LookupError),
    #[error("{action} failed: {source:#}")]
    Convergence { action: &'static str, source: anyhow::Error },
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool { !matches!(self, ReconcileError::Key(_)) }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            ReconcileError::Key(_) => "malformed_key",
            ReconcileError::Lookup(_) => "lookup_error",
            ReconcileError::Convergence { .. } => "error",
        }
    }
}

//! relctl controller: turns release change notifications into reconcile
//! actions.
//!
//! Flow: watch deltas → [`relctl_store`] cache → [`EnqueueHandler`] →
//! [`RetryQueue`] → [`ReleaseController`] workers → [`ReleaseManager`].
//!
//! Reconciliation is level-triggered: a worker only carries a key, and reads
//! the current object from the cache when it gets to it. A key missing from
//! the cache means the release was deleted.

#![forbid(unsafe_code)]

mod controller;
mod error;
mod handler;
mod manager;

pub use controller::{ControllerConfig, ReleaseController};
pub use error::{ControllerError, ReconcileError};
pub use handler::EnqueueHandler;
pub use manager::ReleaseManager;
pub use relctl_queue::{BackoffConfig, RetryQueue};

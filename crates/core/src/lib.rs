//! relctl core types: the `Release` resource, reconcile keys, status conditions
//! and the change deltas flowing from the watcher into the cache.

#![forbid(unsafe_code)]

pub mod condition;
pub mod key;
pub mod release;

pub use condition::{Clock, Condition, ConditionStatus, ConditionType, FixedClock, Reason, SystemClock};
pub use key::{KeyError, ReleaseKey};
pub use release::{Release, ReleaseSpec, ReleaseStatus};

/// A change observed on the `Release` watch stream.
#[derive(Debug, Clone)]
pub enum Delta {
    /// Object was added or modified.
    Applied(Release),
    /// Object was removed while the watch was connected.
    Deleted(Release),
    /// Full relist (initial list or watch restart). Objects missing from the
    /// list were deleted while the watcher was not observing them.
    Restarted(Vec<Release>),
}

impl Delta {
    pub fn len(&self) -> usize {
        match self {
            Delta::Applied(_) | Delta::Deleted(_) => 1,
            Delta::Restarted(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

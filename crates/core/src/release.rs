//! The `Release` custom resource (`releases.relctl.io/v1alpha1`).

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionType};

/// Desired state of a release.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "relctl.io",
    version = "v1alpha1",
    kind = "Release",
    namespaced,
    status = "ReleaseStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    /// Pre-rendered manifests, one or more YAML documents.
    #[serde(default)]
    pub manifests: String,
    /// Renderer input. Opaque to the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Ledger revision to roll back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_to: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revision: Option<u32>,
}

impl ReleaseStatus {
    /// Record a transition. The condition occupying the same slot is replaced
    /// in place; Available and Failure share one slot.
    pub fn set_condition(&mut self, cond: Condition) {
        let slot = cond.type_.slot();
        match self.conditions.iter_mut().find(|c| c.type_.slot() == slot) {
            Some(existing) => *existing = cond,
            None => self.conditions.push(cond),
        }
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// The condition describing the current lifecycle phase: the most recent
    /// transition, with the outcome slot winning ties.
    pub fn authoritative(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .max_by_key(|c| (c.last_transition_time.0, c.type_.is_outcome()))
    }
}

impl Release {
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    pub fn authoritative_condition(&self) -> Option<&Condition> {
        self.status.as_ref().and_then(ReleaseStatus::authoritative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{FixedClock, Reason};
    use chrono::{TimeZone, Utc};

    fn clock(secs: i64) -> FixedClock {
        FixedClock(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn outcome_slot_is_shared_by_available_and_failure() {
        let mut st = ReleaseStatus::default();
        st.set_condition(Condition::creating(&clock(1)));
        st.set_condition(Condition::failure("boom", &clock(2)));
        st.set_condition(Condition::available(&clock(3)));
        assert_eq!(st.conditions.len(), 2);
        assert!(st.condition(ConditionType::Failure).is_none());
        assert_eq!(st.authoritative().unwrap().reason, Reason::Available);
    }

    #[test]
    fn progressing_is_replaced_not_appended() {
        let mut st = ReleaseStatus::default();
        st.set_condition(Condition::creating(&clock(1)));
        st.set_condition(Condition::updating(&clock(2)));
        assert_eq!(st.conditions.len(), 1);
        assert_eq!(st.conditions[0].reason, Reason::Updating);
    }

    #[test]
    fn outcome_wins_timestamp_ties() {
        let mut st = ReleaseStatus::default();
        st.set_condition(Condition::updating(&clock(5)));
        st.set_condition(Condition::available(&clock(5)));
        assert_eq!(st.authoritative().unwrap().type_, ConditionType::Available);
    }

    #[test]
    fn status_serializes_camel_case() {
        let mut st = ReleaseStatus { last_revision: Some(3), ..Default::default() };
        st.set_condition(Condition::available(&clock(0)));
        let v = serde_json::to_value(&st).unwrap();
        assert_eq!(v["lastRevision"], 3);
        assert_eq!(v["conditions"][0]["type"], "Available");
        assert_eq!(v["conditions"][0]["lastTransitionTime"], "1970-01-01T00:00:00Z");
    }
}

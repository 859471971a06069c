//! Release lifecycle conditions.
//!
//! Every reconcile outcome maps to exactly one [`Reason`], and every reason
//! to a fixed `(type, status)` pair:
//!
//! | reason                         | type        | status |
//! |--------------------------------|-------------|--------|
//! | Creating, Updating, Rollbacking | Progressing | True   |
//! | Available                      | Available   | True   |
//! | Failure                        | Failure     | True   |

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Progressing,
    Available,
    Failure,
}

impl ConditionType {
    /// Available and Failure describe the outcome of the same attempt and
    /// therefore occupy one slot.
    pub fn is_outcome(self) -> bool { !matches!(self, ConditionType::Progressing) }

    pub(crate) fn slot(self) -> u8 { if self.is_outcome() { 1 } else { 0 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    Creating,
    Updating,
    Rollbacking,
    Available,
    Failure,
}

impl Reason {
    pub fn condition_type(self) -> ConditionType {
        match self {
            Reason::Creating | Reason::Updating | Reason::Rollbacking => ConditionType::Progressing,
            Reason::Available => ConditionType::Available,
            Reason::Failure => ConditionType::Failure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Creating => "Creating",
            Reason::Updating => "Updating",
            Reason::Rollbacking => "Rollbacking",
            Reason::Available => "Available",
            Reason::Failure => "Failure",
        }
    }
}

/// Source of `lastTransitionTime`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Clock frozen at a given instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> { self.0 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: Reason,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Time,
}

impl Condition {
    pub fn for_reason(reason: Reason, message: impl Into<String>, clock: &dyn Clock) -> Self {
        Self {
            type_: reason.condition_type(),
            status: ConditionStatus::True,
            reason,
            message: message.into(),
            last_transition_time: Time(clock.now()),
        }
    }

    pub fn creating(clock: &dyn Clock) -> Self { Self::for_reason(Reason::Creating, "", clock) }
    pub fn updating(clock: &dyn Clock) -> Self { Self::for_reason(Reason::Updating, "", clock) }
    pub fn rollbacking(clock: &dyn Clock) -> Self { Self::for_reason(Reason::Rollbacking, "", clock) }
    pub fn available(clock: &dyn Clock) -> Self { Self::for_reason(Reason::Available, "", clock) }

    pub fn failure(message: impl Into<String>, clock: &dyn Clock) -> Self {
        Self::for_reason(Reason::Failure, message, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ALL: [Reason; 5] = [Reason::Creating, Reason::Updating, Reason::Rollbacking, Reason::Available, Reason::Failure];

    #[test]
    fn reason_mapping_is_fixed() {
        let clock = FixedClock(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        for reason in ALL {
            let c = Condition::for_reason(reason, "", &clock);
            assert_eq!(c.status, ConditionStatus::True);
            assert_eq!(c.reason, reason);
            let expected = match reason {
                Reason::Available => ConditionType::Available,
                Reason::Failure => ConditionType::Failure,
                _ => ConditionType::Progressing,
            };
            assert_eq!(c.type_, expected, "{}", reason.as_str());
            assert_eq!(c.last_transition_time.0, clock.0);
        }
    }

    #[test]
    fn constructors_are_deterministic_under_fixed_clock() {
        let clock = FixedClock(Utc.timestamp_opt(42, 0).unwrap());
        assert_eq!(Condition::creating(&clock), Condition::creating(&clock));
        let f = Condition::failure("apply failed", &clock);
        assert_eq!(f.type_, ConditionType::Failure);
        assert_eq!(f.message, "apply failed");
        assert!(Condition::rollbacking(&clock).message.is_empty());
    }

    #[test]
    fn condition_wire_shape() {
        let clock = FixedClock(Utc.timestamp_opt(0, 0).unwrap());
        let v = serde_json::to_value(Condition::updating(&clock)).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "type": "Progressing",
                "status": "True",
                "reason": "Updating",
                "message": "",
                "lastTransitionTime": "1970-01-01T00:00:00Z",
            })
        );
    }
}

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";
pub const PROGRESSING: &str = "Progressing";
pub const CONFLICTED: &str = "Conflicted";
pub const DEGRADED: &str = "Degraded";
pub const VALID: &str = "Valid";
pub const APPLIED: &str = "Applied";

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b { ConditionStatus::True } else { ConditionStatus::False }
    }
}

/// Condition contains details about one aspect of the current state of an object
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Progressing, Conflicted, Degraded, Valid, Applied)
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Status ("True", "False" or "Unknown")
    pub status: ConditionStatus,
    /// Machine readable reason for the last transition
    #[serde(default)]
    pub reason: String,
    /// Human readable message indicating details about the condition
    #[serde(default)]
    pub message: String,
    /// LastTransitionTime is the last time the status changed
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Generation of the object this condition was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    #[must_use]
    pub fn new(condition_type: &str, status: bool, reason: &str, message: &str) -> Condition {
        Condition {
            condition_type: condition_type.to_string(),
            status: status.into(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    #[must_use]
    pub fn with_generation(mut self, generation: Option<i64>) -> Condition {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(Condition::is_true)
}

/// Merge `cond` into `conditions`.
///
/// `lastTransitionTime` only moves when the status flips; a reason or message change
/// alone updates the text in place. Returns whether anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition, now: DateTime<Utc>) -> bool {
    match conditions.iter_mut().find(|c| c.condition_type == cond.condition_type) {
        None => {
            cond.last_transition_time = Some(now);
            conditions.push(cond);
            true
        }
        Some(existing) => {
            if existing.status != cond.status {
                cond.last_transition_time = Some(now);
                *existing = cond;
                true
            } else if existing.reason != cond.reason
                || existing.message != cond.message
                || existing.observed_generation != cond.observed_generation
            {
                existing.reason = cond.reason;
                existing.message = cond.message;
                existing.observed_generation = cond.observed_generation;
                if existing.last_transition_time.is_none() {
                    existing.last_transition_time = Some(now);
                }
                true
            } else {
                false
            }
        }
    }
}

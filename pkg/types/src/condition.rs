use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Observation of one aspect of an object's state, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition<T> {
    #[serde(rename = "type")]
    pub type_: T,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl<T: PartialEq + Clone> Condition<T> {
    pub fn new(type_: T, status: ConditionStatus, reason: &str, message: &str) -> Self {
        Self {
            type_,
            status,
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

pub fn get_condition<'a, T: PartialEq>(
    conditions: &'a [Condition<T>],
    type_: &T,
) -> Option<&'a Condition<T>> {
    conditions.iter().find(|c| &c.type_ == type_)
}

/// Insert or replace the condition of the same type.
///
/// Nothing changes when status and reason are unchanged, so the transition
/// time only moves on a real transition. When the status holds but the
/// reason differs, the original transition time is carried over.
pub fn set_condition<T: PartialEq + Clone>(conditions: &mut Vec<Condition<T>>, new: Condition<T>) {
    let mut new = new;
    if let Some(current) = get_condition(conditions, &new.type_) {
        if current.status == new.status && current.reason == new.reason {
            return;
        }
        if current.status == new.status {
            new.last_transition_time = current.last_transition_time;
        }
    }
    conditions.retain(|c| c.type_ != new.type_);
    conditions.push(new);
}

pub fn remove_condition<T: PartialEq>(conditions: &mut Vec<Condition<T>>, type_: &T) {
    conditions.retain(|c| &c.type_ != type_);
}

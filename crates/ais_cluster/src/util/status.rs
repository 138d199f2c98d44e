use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Sets the condition of the same type as `new_condition`, returning whether
/// the list changed.
///
/// An existing entry of that type is replaced in place, so the list never holds
/// two entries of one type. Its transition time moves to `now` only when the
/// status flips; a new entry is stamped with `now`.
pub fn set_status_condition(
    conditions: &mut Vec<Condition>,
    mut new_condition: Condition,
    now: DateTime<Utc>,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new_condition.type_) {
        Some(existing) => {
            if existing.status != new_condition.status {
                new_condition.last_transition_time = Time(now);
            } else {
                new_condition.last_transition_time = existing.last_transition_time.clone();
            }
            let changed = *existing != new_condition;
            *existing = new_condition;
            changed
        }
        None => {
            new_condition.last_transition_time = Time(now);
            conditions.push(new_condition);
            true
        }
    }
}

/// Finds the condition_type in conditions.
pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.type_ == condition_type)
}

/// Returns the condition with the most recent transition time. Among equal
/// timestamps the first one in the list wins.
pub fn latest_status_condition(conditions: &[Condition]) -> Option<&Condition> {
    let mut latest: Option<&Condition> = None;
    for condition in conditions {
        match latest {
            Some(current) if condition.last_transition_time.0 <= current.last_transition_time.0 => {}
            _ => latest = Some(condition),
        }
    }
    latest
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    is_status_condition_present_and_equal(conditions, condition_type, CONDITION_TRUE)
}

/// Returns true when condition_type is present and equal to status.
pub fn is_status_condition_present_and_equal(
    conditions: &[Condition],
    condition_type: &str,
    status: &str,
) -> bool {
    conditions
        .iter()
        .any(|condition| condition.type_ == condition_type && condition.status == status)
}

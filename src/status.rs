use crate::k8s::{Condition, Time};
use chrono::{DateTime, Utc};

pub const READY: &str = "Ready";

pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_RESOLUTION_FAILED: &str = "ResolutionFailed";

/// Builds the `Ready` condition for a pass that failed to resolve the
/// hostnames described by `failures`.
pub fn ready(
    failures: &[String],
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    let (status, reason, message) = if failures.is_empty() {
        (
            "True",
            REASON_RECONCILED,
            "All hostnames resolved successfully".to_string(),
        )
    } else {
        (
            "False",
            REASON_RESOLUTION_FAILED,
            format!("failed to resolve some hostnames: {}", failures.join("; ")),
        )
    };

    Condition {
        type_: READY.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation,
        last_transition_time: Time(now),
    }
}

/// Replaces the condition with the same type as `condition`, or appends it.
///
/// The existing transition time is kept unless the condition's status
/// changed.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

//! Condition management for RemediationRequest status
//!
//! The request carries two conditions, `Processing` and `Succeeded`. They
//! only ever hold one of three combinations: (True, Unknown) while fencing
//! runs, (False, True) after success, and (False, False) when remediation
//! stopped without fencing the node.

use chrono::Utc;

use crate::crd::Condition;

pub const CONDITION_TYPE_PROCESSING: &str = "Processing";
pub const CONDITION_TYPE_SUCCEEDED: &str = "Succeeded";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Why the `(Processing, Succeeded)` pair is changing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingChangeReason {
    RemediationStarted,
    FinishedSuccessfully,
    TimeoutByNHC,
    SkippedNodeNotFound,
}

impl ProcessingChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingChangeReason::RemediationStarted => "RemediationStarted",
            ProcessingChangeReason::FinishedSuccessfully => "FinishedSuccessfully",
            ProcessingChangeReason::TimeoutByNHC => "TimeoutByNHC",
            ProcessingChangeReason::SkippedNodeNotFound => "SkippedNodeNotFound",
        }
    }

    /// The `(Processing, Succeeded)` statuses this reason implies
    pub fn statuses(&self) -> (&'static str, &'static str) {
        match self {
            ProcessingChangeReason::RemediationStarted => {
                (CONDITION_STATUS_TRUE, CONDITION_STATUS_UNKNOWN)
            }
            ProcessingChangeReason::FinishedSuccessfully => {
                (CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE)
            }
            ProcessingChangeReason::TimeoutByNHC | ProcessingChangeReason::SkippedNodeNotFound => {
                (CONDITION_STATUS_FALSE, CONDITION_STATUS_FALSE)
            }
        }
    }
}

/// Apply the condition pair for the given reason, returning whether
/// anything changed
pub fn update_conditions(conditions: &mut Vec<Condition>, reason: ProcessingChangeReason) -> bool {
    let (processing, succeeded) = reason.statuses();

    if is_condition_present_and_equal(conditions, CONDITION_TYPE_PROCESSING, processing)
        && is_condition_present_and_equal(conditions, CONDITION_TYPE_SUCCEEDED, succeeded)
    {
        return false;
    }

    set_condition(conditions, CONDITION_TYPE_PROCESSING, processing, reason.as_str());
    set_condition(conditions, CONDITION_TYPE_SUCCEEDED, succeeded, reason.as_str());
    true
}

/// Update or add a condition; the transition time changes only when the
/// status changes
fn set_condition(conditions: &mut Vec<Condition>, type_: &str, status: &str, reason: &str) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let status_changed = existing.status != status;
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        if status_changed {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: String::new(),
            observed_generation: None,
        });
    }
}

fn is_condition_present_and_equal(conditions: &[Condition], type_: &str, status: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == status)
}

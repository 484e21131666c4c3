//! Remediation controller
//!
//! Contains the reconciler driving one RemediationRequest through the
//! fencing lifecycle, plus the condition grid, taint definitions, node
//! resource removal, and event plumbing it relies on.

pub mod conditions;
pub mod events;
mod finalizers;
mod reconciler;
mod resources;
pub mod taints;

#[cfg(test)]
mod reconciler_test;

pub use conditions::{update_conditions, ProcessingChangeReason};
pub use finalizers::{has_finalizer, is_being_deleted, FENCING_FINALIZER};
pub use reconciler::{
    is_owned_by_health_detector, out_of_service_taint_supported, run_controller, BackoffTracker,
    ControllerState, OperatorMode,
};
pub use taints::{
    EXCLUDE_FROM_REMEDIATION_LABEL, NHC_TIMED_OUT_ANNOTATION, REBOOT_CAPABLE_ANNOTATION,
};

//! Kubernetes event emission
//!
//! Events are best-effort; a failed publish never fails a reconciliation.

use kube::runtime::events::{Event, EventType, Recorder};
use kube::Resource;
use tracing::debug;

pub const REASON_REMEDIATION_STARTED: &str = "RemediationStarted";
pub const REASON_REMEDIATION_STOPPED: &str = "RemediationStopped";
pub const REASON_REMEDIATION_SKIPPED: &str = "RemediationSkipped";
pub const REASON_REMEDIATION_FINISHED: &str = "RemediationFinished";
pub const REASON_ADD_FINALIZER: &str = "AddFinalizer";
pub const REASON_REMOVE_FINALIZER: &str = "RemoveFinalizer";
pub const REASON_MARK_UNSCHEDULABLE: &str = "MarkUnschedulable";
pub const REASON_MARK_SCHEDULABLE: &str = "MarkNodeSchedulable";
pub const REASON_ADD_NO_EXECUTE: &str = "AddNoExecute";
pub const REASON_REMOVE_NO_EXECUTE: &str = "RemoveNoExecuteTaint";
pub const REASON_ADD_OUT_OF_SERVICE: &str = "AddOutOfService";
pub const REASON_REMOVE_OUT_OF_SERVICE: &str = "RemoveOutOfService";
pub const REASON_UPDATE_TIME_ASSUMED_REBOOTED: &str = "UpdateTimeAssumedRebooted";
pub const REASON_NODE_REBOOT: &str = "NodeReboot";
pub const REASON_DELETE_RESOURCES: &str = "DeleteResources";

/// Publish a Normal event attached to the given object
pub async fn normal_event<K>(recorder: &Recorder, object: &K, reason: &str, note: &str)
where
    K: Resource<DynamicType = ()>,
{
    let event = Event {
        type_: EventType::Normal,
        reason: reason.to_string(),
        note: Some(note.to_string()),
        action: "Remediation".to_string(),
        secondary: None,
    };
    if let Err(err) = recorder.publish(&event, &object.object_ref(&())).await {
        debug!(reason, error = %err, "failed to publish event");
    }
}

//! RemediationRequest Custom Resource Definition
//!
//! One RemediationRequest exists per unhealthy node. The resource is durable
//! in the cluster store and drives the fencing lifecycle: taints, the
//! assumed-reboot deadline, workload removal, and node restoration.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// How workloads are evicted from the node once the reboot is assumed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RemediationStrategy {
    /// Delete all pods scheduled on the node plus the volume attachments
    /// referencing it
    ResourceDeletion,
    /// Apply the `out-of-service` taint and let the cluster evict and detach
    OutOfServiceTaint,
    /// `OutOfServiceTaint` when the cluster supports that taint, otherwise
    /// `ResourceDeletion`; resolved at reconcile time
    #[default]
    Automatic,
}

/// Phase of the fencing lifecycle. Transitions are strictly forward.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum RemediationPhase {
    #[serde(rename = "Fencing-Started")]
    FencingStarted,
    #[serde(rename = "Pre-Reboot-Completed")]
    PreRebootCompleted,
    #[serde(rename = "Reboot-Completed")]
    RebootCompleted,
    #[serde(rename = "Fencing-Completed")]
    FencingCompleted,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fencing.medik8s.io",
    version = "v1alpha1",
    kind = "RemediationRequest",
    namespaced,
    status = "RemediationRequestStatus",
    shortname = "rr",
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.strategy"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequestSpec {
    #[serde(default)]
    pub strategy: RemediationStrategy,
}

/// Status subresource for RemediationRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequestStatus {
    /// Current fencing phase; absent means fencing has not started yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RemediationPhase>,

    /// The wall-clock instant after which peers may treat the node as
    /// rebooted. Set exactly once, during the pre-reboot phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_assumed_rebooted: Option<String>,

    /// `Processing` and `Succeeded` conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Most recent error encountered while driving this remediation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RemediationRequest {
    /// The effective phase, defaulting to `Fencing-Started` before any
    /// status has been written
    pub fn phase(&self) -> RemediationPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(RemediationPhase::FencingStarted)
    }

    /// Parsed `timeAssumedRebooted`, if set and well-formed
    pub fn time_assumed_rebooted(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.time_assumed_rebooted.as_deref())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Mutable status, initializing the default on first write
    pub fn status_mut(&mut self) -> &mut RemediationRequestStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Advance the phase, never backwards
    pub fn set_phase(&mut self, phase: RemediationPhase) {
        let status = self.status_mut();
        match status.phase {
            Some(current) if current > phase => {}
            _ => status.phase = Some(phase),
        }
    }
}

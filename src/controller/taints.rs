//! Taint, annotation, and label definitions
//!
//! Everything the operator stamps onto nodes and requests is spelled here,
//! in one place, so production code and tests agree.

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Added by the node controller when `spec.unschedulable` is set
pub const UNSCHEDULABLE_TAINT_KEY: &str = "node.kubernetes.io/unschedulable";

/// Evicts running workloads from the node being fenced
pub const REMEDIATION_TAINT_KEY: &str = "medik8s.io/remediation";
pub const REMEDIATION_TAINT_VALUE: &str = "self-node-remediation";

/// Additionally authorizes forced detachment of storage
pub const OUT_OF_SERVICE_TAINT_KEY: &str = "node.kubernetes.io/out-of-service";
pub const OUT_OF_SERVICE_TAINT_VALUE: &str = "nodeshutdown";

/// Node annotation recording whether the local agent can guarantee a reboot
pub const REBOOT_CAPABLE_ANNOTATION: &str = "fencing.medik8s.io/is-reboot-capable";

/// Set on a request by the upstream health detector when it gave up waiting
pub const NHC_TIMED_OUT_ANNOTATION: &str = "remediation.medik8s.io/nhc-timed-out";

/// Nodes carrying this label with value "true" are never remediated
pub const EXCLUDE_FROM_REMEDIATION_LABEL: &str = "remediation.medik8s.io/exclude-from-remediation";

/// Label selector matching the per-node fencing agent pods
pub const AGENT_POD_SELECTOR: &str = "app=node-fence-agent";

pub fn unschedulable_taint() -> Taint {
    Taint {
        key: UNSCHEDULABLE_TAINT_KEY.to_string(),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    }
}

pub fn remediation_taint() -> Taint {
    Taint {
        key: REMEDIATION_TAINT_KEY.to_string(),
        value: Some(REMEDIATION_TAINT_VALUE.to_string()),
        effect: "NoExecute".to_string(),
        time_added: Some(Time(chrono::Utc::now())),
    }
}

pub fn out_of_service_taint() -> Taint {
    Taint {
        key: OUT_OF_SERVICE_TAINT_KEY.to_string(),
        value: Some(OUT_OF_SERVICE_TAINT_VALUE.to_string()),
        effect: "NoExecute".to_string(),
        time_added: Some(Time(chrono::Utc::now())),
    }
}

/// Whether a taint with the same key and effect is present
pub fn taint_exists(taints: &[Taint], taint: &Taint) -> bool {
    taints
        .iter()
        .any(|t| t.key == taint.key && t.effect == taint.effect)
}

/// Remove a taint by key and effect, reporting whether anything was removed
pub fn delete_taint(taints: &[Taint], taint: &Taint) -> (Vec<Taint>, bool) {
    let remaining: Vec<Taint> = taints
        .iter()
        .filter(|t| !(t.key == taint.key && t.effect == taint.effect))
        .cloned()
        .collect();
    let deleted = remaining.len() != taints.len();
    (remaining, deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taint_spelling() {
        assert_eq!(remediation_taint().key, "medik8s.io/remediation");
        assert_eq!(
            remediation_taint().value.as_deref(),
            Some("self-node-remediation")
        );
        assert_eq!(remediation_taint().effect, "NoExecute");

        assert_eq!(
            out_of_service_taint().key,
            "node.kubernetes.io/out-of-service"
        );
        assert_eq!(
            out_of_service_taint().value.as_deref(),
            Some("nodeshutdown")
        );

        assert_eq!(unschedulable_taint().effect, "NoSchedule");
    }

    #[test]
    fn test_taint_exists_matches_key_and_effect() {
        let taints = vec![remediation_taint()];
        assert!(taint_exists(&taints, &remediation_taint()));
        assert!(!taint_exists(&taints, &unschedulable_taint()));

        // Same key, different effect must not match
        let mut other = remediation_taint();
        other.effect = "NoSchedule".to_string();
        assert!(!taint_exists(&taints, &other));
    }

    #[test]
    fn test_delete_taint() {
        let taints = vec![remediation_taint(), unschedulable_taint()];
        let (remaining, deleted) = delete_taint(&taints, &remediation_taint());
        assert!(deleted);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, UNSCHEDULABLE_TAINT_KEY);

        let (unchanged, deleted) = delete_taint(&remaining, &out_of_service_taint());
        assert!(!deleted);
        assert_eq!(unchanged.len(), 1);
    }
}

//! Unit tests for the reconciler's decision helpers
//!
//! The reconciler's side effects all hang off a handful of pure decisions:
//! wall-clock reboot arithmetic, same-boot detection, strategy resolution,
//! and the skip predicates. Those are covered here without a cluster.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    use super::super::reconciler::*;
    use crate::controller::taints::{EXCLUDE_FROM_REMEDIATION_LABEL, NHC_TIMED_OUT_ANNOTATION};
    use crate::crd::{RemediationRequest, RemediationRequestSpec, RemediationStrategy};

    fn make_request(
        annotations: BTreeMap<String, String>,
        deleted: bool,
    ) -> RemediationRequest {
        let mut request = RemediationRequest::new(
            "worker-1",
            RemediationRequestSpec {
                strategy: RemediationStrategy::Automatic,
            },
        );
        request.metadata = ObjectMeta {
            name: Some("worker-1".to_string()),
            namespace: Some("fencing".to_string()),
            annotations: Some(annotations),
            deletion_timestamp: deleted.then(|| Time(Utc::now())),
            ..Default::default()
        };
        request
    }

    fn make_node(labels: BTreeMap<String, String>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    // ── wall-clock reboot arithmetic ───────────────────────────────────

    #[test]
    fn test_node_not_yet_assumed_rebooted() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let deadline = now + chrono::Duration::seconds(90);

        let (rebooted, time_left) = was_node_rebooted(Some(deadline), now);
        assert!(!rebooted);
        // remaining time plus the one-second cushion
        assert_eq!(time_left, Duration::from_secs(91));
    }

    #[test]
    fn test_node_assumed_rebooted_after_deadline() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let deadline = now - chrono::Duration::seconds(1);

        let (rebooted, time_left) = was_node_rebooted(Some(deadline), now);
        assert!(rebooted);
        assert_eq!(time_left, Duration::ZERO);
    }

    #[test]
    fn test_missing_deadline_is_never_rebooted() {
        let (rebooted, _) = was_node_rebooted(None, Utc::now());
        assert!(!rebooted);
    }

    // ── same-boot detection ────────────────────────────────────────────

    #[test]
    fn test_short_uptime_means_already_rebooted() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let created_at = now - chrono::Duration::minutes(10);

        // Host has been up two minutes, request is ten minutes old: the
        // host must have rebooted after the request was created.
        assert!(already_rebooted(Duration::from_secs(120), created_at, now));
    }

    #[test]
    fn test_long_uptime_means_no_reboot_happened() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let created_at = now - chrono::Duration::minutes(10);

        assert!(!already_rebooted(
            Duration::from_secs(3600),
            created_at,
            now
        ));
    }

    // ── strategy resolution ────────────────────────────────────────────

    #[test]
    fn test_automatic_resolves_by_cluster_capability() {
        assert_eq!(
            runtime_strategy(RemediationStrategy::Automatic, true),
            RemediationStrategy::OutOfServiceTaint
        );
        assert_eq!(
            runtime_strategy(RemediationStrategy::Automatic, false),
            RemediationStrategy::ResourceDeletion
        );
    }

    #[test]
    fn test_explicit_strategies_are_untouched() {
        assert_eq!(
            runtime_strategy(RemediationStrategy::ResourceDeletion, true),
            RemediationStrategy::ResourceDeletion
        );
        assert_eq!(
            runtime_strategy(RemediationStrategy::OutOfServiceTaint, false),
            RemediationStrategy::OutOfServiceTaint
        );
    }

    #[test]
    fn test_out_of_service_version_gate() {
        assert!(version_supports_out_of_service("1", "26"));
        assert!(version_supports_out_of_service("1", "31+"));
        assert!(!version_supports_out_of_service("1", "25"));
        assert!(version_supports_out_of_service("2", "0"));
        assert!(!version_supports_out_of_service("", "garbage"));
    }

    // ── skip predicates ────────────────────────────────────────────────

    #[test]
    fn test_detector_timeout_stops_remediation() {
        let mut annotations = BTreeMap::new();
        annotations.insert(NHC_TIMED_OUT_ANNOTATION.to_string(), "".to_string());

        assert!(is_stopped_by_detector(&make_request(annotations.clone(), false)));

        // A request already being deleted follows the normal cleanup path
        assert!(!is_stopped_by_detector(&make_request(annotations, true)));
        assert!(!is_stopped_by_detector(&make_request(BTreeMap::new(), false)));
    }

    #[test]
    fn test_excluded_node_is_skipped() {
        let mut labels = BTreeMap::new();
        labels.insert(EXCLUDE_FROM_REMEDIATION_LABEL.to_string(), "true".to_string());
        assert!(node_excluded(&make_node(labels)));

        let mut labels = BTreeMap::new();
        labels.insert(EXCLUDE_FROM_REMEDIATION_LABEL.to_string(), "false".to_string());
        assert!(!node_excluded(&make_node(labels)));
        assert!(!node_excluded(&make_node(BTreeMap::new())));
    }

    #[test]
    fn test_owner_reference_kinds() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut request = make_request(BTreeMap::new(), false);
        request.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "remediation.medik8s.io/v1alpha1".to_string(),
            kind: "NodeHealthCheck".to_string(),
            name: "nhc".to_string(),
            uid: "1234".to_string(),
            ..Default::default()
        }]);
        assert!(is_owned_by_health_detector(&request));

        request.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "machine.openshift.io/v1beta1".to_string(),
            kind: "Machine".to_string(),
            name: "machine-a".to_string(),
            uid: "5678".to_string(),
            ..Default::default()
        }]);
        assert!(!is_owned_by_health_detector(&request));
    }

    // ── exponential back-off ───────────────────────────────────────────

    #[test]
    fn test_backoff_doubles_per_consecutive_failure() {
        let tracker = BackoffTracker::new();
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);

        assert_eq!(tracker.next_delay("uid-1", base, max), Duration::from_secs(1));
        assert_eq!(tracker.next_delay("uid-1", base, max), Duration::from_secs(2));
        assert_eq!(tracker.next_delay("uid-1", base, max), Duration::from_secs(4));
        assert_eq!(tracker.next_delay("uid-1", base, max), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped_and_does_not_overflow() {
        let tracker = BackoffTracker::new();
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(600);

        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = tracker.next_delay("uid-1", base, max);
        }
        assert_eq!(last, max);
    }

    #[test]
    fn test_backoff_counts_are_per_request() {
        let tracker = BackoffTracker::new();
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);

        tracker.next_delay("uid-1", base, max);
        tracker.next_delay("uid-1", base, max);

        // A different request still starts at the base delay
        assert_eq!(tracker.next_delay("uid-2", base, max), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_resets_after_a_clean_pass() {
        let tracker = BackoffTracker::new();
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);

        tracker.next_delay("uid-1", base, max);
        tracker.next_delay("uid-1", base, max);
        tracker.reset("uid-1");

        assert_eq!(tracker.next_delay("uid-1", base, max), Duration::from_secs(1));
    }

    // ── out-of-service grace window ────────────────────────────────────

    #[test]
    fn test_out_of_service_polls_inside_grace() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let assumed = now - chrono::Duration::seconds(120);

        assert!(out_of_service_wait(Some(assumed), now).is_some());
    }

    #[test]
    fn test_out_of_service_expires_after_grace() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let assumed = now - chrono::Duration::seconds(301);

        assert!(out_of_service_wait(Some(assumed), now).is_none());
    }
}

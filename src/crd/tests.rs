//! Serde and lifecycle tests for the CRD types

use kube::api::ObjectMeta;

use super::*;

fn request_with_phase(phase: Option<RemediationPhase>) -> RemediationRequest {
    let mut request = RemediationRequest::new(
        "worker-1",
        RemediationRequestSpec {
            strategy: RemediationStrategy::ResourceDeletion,
        },
    );
    request.metadata = ObjectMeta {
        name: Some("worker-1".to_string()),
        namespace: Some("fencing".to_string()),
        ..Default::default()
    };
    if let Some(phase) = phase {
        request.status_mut().phase = Some(phase);
    }
    request
}

#[test]
fn test_phase_serde_uses_dashed_names() {
    let json = serde_json::to_string(&RemediationPhase::PreRebootCompleted).unwrap();
    assert_eq!(json, "\"Pre-Reboot-Completed\"");

    let parsed: RemediationPhase = serde_json::from_str("\"Fencing-Completed\"").unwrap();
    assert_eq!(parsed, RemediationPhase::FencingCompleted);
}

#[test]
fn test_phase_ordering_is_forward() {
    assert!(RemediationPhase::FencingStarted < RemediationPhase::PreRebootCompleted);
    assert!(RemediationPhase::PreRebootCompleted < RemediationPhase::RebootCompleted);
    assert!(RemediationPhase::RebootCompleted < RemediationPhase::FencingCompleted);
}

#[test]
fn test_missing_status_defaults_to_fencing_started() {
    let request = request_with_phase(None);
    assert_eq!(request.phase(), RemediationPhase::FencingStarted);
}

#[test]
fn test_set_phase_never_moves_backwards() {
    let mut request = request_with_phase(Some(RemediationPhase::RebootCompleted));
    request.set_phase(RemediationPhase::FencingStarted);
    assert_eq!(request.phase(), RemediationPhase::RebootCompleted);

    request.set_phase(RemediationPhase::FencingCompleted);
    assert_eq!(request.phase(), RemediationPhase::FencingCompleted);
}

#[test]
fn test_time_assumed_rebooted_parses_rfc3339() {
    let mut request = request_with_phase(Some(RemediationPhase::PreRebootCompleted));
    request.status_mut().time_assumed_rebooted = Some("2026-03-01T10:30:00+00:00".to_string());
    let parsed = request.time_assumed_rebooted().unwrap();
    assert_eq!(parsed.to_rfc3339(), "2026-03-01T10:30:00+00:00");

    request.status_mut().time_assumed_rebooted = Some("not-a-timestamp".to_string());
    assert!(request.time_assumed_rebooted().is_none());
}

#[test]
fn test_strategy_defaults_to_automatic() {
    let spec: RemediationRequestSpec = serde_json::from_str("{}").unwrap();
    assert_eq!(spec.strategy, RemediationStrategy::Automatic);
}

#[test]
fn test_strategy_serde_round_trip() {
    for (strategy, name) in [
        (RemediationStrategy::ResourceDeletion, "\"ResourceDeletion\""),
        (RemediationStrategy::OutOfServiceTaint, "\"OutOfServiceTaint\""),
        (RemediationStrategy::Automatic, "\"Automatic\""),
    ] {
        assert_eq!(serde_json::to_string(&strategy).unwrap(), name);
    }
}

#[test]
fn test_status_serializes_camel_case() {
    let mut request = request_with_phase(Some(RemediationPhase::PreRebootCompleted));
    request.status_mut().time_assumed_rebooted = Some("2026-03-01T10:30:00Z".to_string());
    request.status_mut().last_error = Some("boom".to_string());

    let value = serde_json::to_value(request.status.as_ref().unwrap()).unwrap();
    assert_eq!(value["phase"], "Pre-Reboot-Completed");
    assert_eq!(value["timeAssumedRebooted"], "2026-03-01T10:30:00Z");
    assert_eq!(value["lastError"], "boom");
}

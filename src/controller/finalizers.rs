//! Finalizer handling for RemediationRequest
//!
//! The finalizer blocks deletion of a request until the node has been
//! restored: taints removed and the node schedulable again. It is present
//! for exactly as long as fencing is in progress.

use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::crd::RemediationRequest;
use crate::error::Result;

pub const FENCING_FINALIZER: &str = "fencing.medik8s.io/fencing-finalizer";

pub fn has_finalizer(request: &RemediationRequest) -> bool {
    request.finalizers().iter().any(|f| f == FENCING_FINALIZER)
}

pub fn is_being_deleted(request: &RemediationRequest) -> bool {
    request.metadata.deletion_timestamp.is_some()
}

pub async fn add_finalizer(api: &Api<RemediationRequest>, request: &RemediationRequest) -> Result<()> {
    let mut finalizers: Vec<String> = request.finalizers().to_vec();
    if finalizers.iter().any(|f| f == FENCING_FINALIZER) {
        return Ok(());
    }
    finalizers.push(FENCING_FINALIZER.to_string());

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &request.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    info!(request = %request.name_any(), "finalizer added");
    Ok(())
}

pub async fn remove_finalizer(
    api: &Api<RemediationRequest>,
    request: &RemediationRequest,
) -> Result<()> {
    if !has_finalizer(request) {
        return Ok(());
    }
    let finalizers: Vec<String> = request
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FENCING_FINALIZER)
        .cloned()
        .collect();

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &request.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    info!(request = %request.name_any(), "finalizer removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RemediationRequestSpec, RemediationStrategy};
    use kube::api::ObjectMeta;

    fn request_with_finalizers(finalizers: Vec<String>) -> RemediationRequest {
        let mut request = RemediationRequest::new(
            "worker-1",
            RemediationRequestSpec {
                strategy: RemediationStrategy::Automatic,
            },
        );
        request.metadata = ObjectMeta {
            name: Some("worker-1".to_string()),
            finalizers: Some(finalizers),
            ..Default::default()
        };
        request
    }

    #[test]
    fn test_has_finalizer() {
        assert!(!has_finalizer(&request_with_finalizers(vec![])));
        assert!(has_finalizer(&request_with_finalizers(vec![
            FENCING_FINALIZER.to_string()
        ])));
        assert!(!has_finalizer(&request_with_finalizers(vec![
            "other.io/finalizer".to_string()
        ])));
    }
}

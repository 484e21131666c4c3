//! RemediationTemplate Custom Resource Definition
//!
//! Carries a `spec.template.spec` identical in shape to a
//! RemediationRequest spec, so upstream health detectors can stamp out
//! requests with a chosen strategy.

use kube::{
    api::{Api, Patch, PatchParams},
    Client, CustomResource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

use super::remediation_request::{RemediationRequestSpec, RemediationStrategy};

pub const RESOURCE_DELETION_TEMPLATE_NAME: &str = "resource-deletion-template";

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct RemediationTemplateResource {
    pub spec: RemediationRequestSpec,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fencing.medik8s.io",
    version = "v1alpha1",
    kind = "RemediationTemplate",
    namespaced,
    shortname = "rt"
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationTemplateSpec {
    pub template: RemediationTemplateResource,
}

/// Install the default template at manager start if it is missing
pub async fn ensure_default_template(client: &Client, namespace: &str) -> Result<()> {
    let templates: Api<RemediationTemplate> = Api::namespaced(client.clone(), namespace);

    let template = RemediationTemplate::new(
        RESOURCE_DELETION_TEMPLATE_NAME,
        RemediationTemplateSpec {
            template: RemediationTemplateResource {
                spec: RemediationRequestSpec {
                    strategy: RemediationStrategy::ResourceDeletion,
                },
            },
        },
    );

    templates
        .patch(
            RESOURCE_DELETION_TEMPLATE_NAME,
            &PatchParams::apply("fencing-operator"),
            &Patch::Apply(&template),
        )
        .await
        .map_err(Error::KubeError)?;

    info!(
        name = RESOURCE_DELETION_TEMPLATE_NAME,
        namespace, "default remediation template ensured"
    );
    Ok(())
}

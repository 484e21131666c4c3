//! Removal of workloads from a fenced node
//!
//! Only invoked after the reboot has been assumed: deleting a pod object
//! releases its run-once guarantees, which is only safe once the node can
//! no longer be running it.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::{
    api::{Api, DeleteParams, ListParams},
    Client, ResourceExt,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Delete every pod scheduled on the node and every volume attachment
/// referencing it
pub async fn delete_node_resources(client: &Client, node_name: &str) -> Result<()> {
    delete_pods_on_node(client, node_name).await?;
    delete_volume_attachments(client, node_name).await?;
    Ok(())
}

async fn delete_pods_on_node(client: &Client, node_name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::all(client.clone());
    let on_node = ListParams::default().fields(&format!("spec.nodeName={node_name}"));

    let list = pods.list(&on_node).await.map_err(Error::KubeError)?;
    for pod in list {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();
        let namespaced: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        match namespaced.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(pod = %name, namespace = %namespace, "deleted pod from fenced node"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
    Ok(())
}

async fn delete_volume_attachments(client: &Client, node_name: &str) -> Result<()> {
    let attachments: Api<VolumeAttachment> = Api::all(client.clone());

    let list = attachments
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    for va in list {
        if va.spec.node_name != node_name {
            continue;
        }
        let name = va.name_any();
        match attachments.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(volume_attachment = %name, "deleted volume attachment"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
    Ok(())
}

/// Whether the out-of-service eviction has finished: no pod on the node is
/// still terminating and no volume attachment references it
pub async fn deletion_completed(client: &Client, node_name: &str) -> Result<bool> {
    let pods: Api<Pod> = Api::all(client.clone());
    let on_node = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
    for pod in pods.list(&on_node).await.map_err(Error::KubeError)? {
        if pod.metadata.deletion_timestamp.is_some() {
            debug!(pod = %pod.name_any(), "waiting for terminating pod");
            return Ok(false);
        }
    }

    let attachments: Api<VolumeAttachment> = Api::all(client.clone());
    for va in attachments
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?
    {
        if va.spec.node_name == node_name {
            debug!(volume_attachment = %va.name_any(), "waiting for volume attachment removal");
            return Ok(false);
        }
    }

    Ok(true)
}

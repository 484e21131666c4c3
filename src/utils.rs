//! Small host and node helpers shared across components

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use serde_json::json;
use tracing::info;

use crate::controller::REBOOT_CAPABLE_ANNOTATION;
use crate::error::{Error, Result};

/// How long the host has been up, from `/proc/uptime`.
///
/// Used to decide whether this process has already completed its self-reboot
/// within the lifetime of the current remediation request.
pub fn linux_uptime() -> Result<Duration> {
    let raw = std::fs::read_to_string("/proc/uptime")
        .map_err(|e| Error::ConfigError(format!("failed to read /proc/uptime: {e}")))?;
    parse_uptime(&raw).ok_or_else(|| Error::ConfigError(format!("malformed /proc/uptime: {raw}")))
}

fn parse_uptime(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.split_whitespace().next()?.parse().ok()?;
    if seconds.is_sign_negative() {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

/// Record on the node whether this agent can guarantee a reboot.
///
/// The manager refuses to remediate nodes that do not carry the annotation
/// with value `"true"`: deleting workloads from a node that cannot reboot
/// could run them twice.
pub async fn set_reboot_capable_annotation(
    client: &Client,
    node_name: &str,
    capable: bool,
) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = json!({
        "metadata": {
            "annotations": {
                REBOOT_CAPABLE_ANNOTATION: capable.to_string(),
            }
        }
    });
    nodes
        .patch(
            node_name,
            &PatchParams::apply("fencing-agent"),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    info!(node = node_name, capable, "reboot-capable annotation updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uptime() {
        let d = parse_uptime("35634.18 123456.78\n").unwrap();
        assert_eq!(d.as_secs(), 35634);
    }

    #[test]
    fn test_parse_uptime_rejects_garbage() {
        assert!(parse_uptime("").is_none());
        assert!(parse_uptime("not-a-number 1.0").is_none());
        assert!(parse_uptime("-5.0 1.0").is_none());
    }
}

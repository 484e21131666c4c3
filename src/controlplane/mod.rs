//! Control-plane node diagnostics
//!
//! Peer consultation alone is not enough for control-plane nodes: when the
//! API is down everywhere, a control-plane node must check its own local
//! services before deciding it is the problem. A control-plane node
//! self-fences only when it cannot reach its peers AND its local
//! diagnostics fail.

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::{api::Api, Client};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::apicheck::{Reason, Response};
use crate::error::{Error, Result};
use crate::peers::{node_role, Role};

const KUBELET_PORT: u16 = 10250;
const ETCD_ENDPOINT: &str = "127.0.0.1:2379";
const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(5);

/// Optional ping target for the endpoint reachability diagnostic
pub const ENDPOINT_HEALTH_CHECK_URL_ENV: &str = "END_POINT_HEALTH_CHECK_URL";

pub struct ControlPlaneManager {
    node_name: String,
    role: Role,
    endpoint_health_check_url: Option<String>,
    was_endpoint_accessible_at_start: bool,
    http: reqwest::Client,
}

impl ControlPlaneManager {
    /// Determine this node's role and capture the endpoint-reachability
    /// baseline. Must run while the API is still reachable.
    pub async fn new(client: &Client, node_name: &str) -> Result<Self> {
        let nodes: Api<Node> = Api::all(client.clone());
        let node = nodes.get(node_name).await.map_err(Error::KubeError)?;
        let role = node_role(&node).unwrap_or(Role::Worker);

        // The kubelet serves its API with a self-signed certificate
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(DIAGNOSTIC_TIMEOUT)
            .build()
            .map_err(|e| Error::ConfigError(format!("failed to build diagnostics client: {e}")))?;

        let endpoint_health_check_url = std::env::var(ENDPOINT_HEALTH_CHECK_URL_ENV).ok();

        let mut manager = Self {
            node_name: node_name.to_string(),
            role,
            endpoint_health_check_url,
            was_endpoint_accessible_at_start: false,
            http,
        };
        manager.was_endpoint_accessible_at_start = manager.is_endpoint_accessible().await;

        info!(
            node = node_name,
            ?role,
            endpoint_baseline = manager.was_endpoint_accessible_at_start,
            "control-plane manager initialized"
        );
        Ok(manager)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_control_plane(&self) -> bool {
        self.role == Role::ControlPlane
    }

    /// Decide whether this control-plane node is healthy, combining the
    /// worker-peer verdict with local diagnostics
    pub async fn is_control_plane_healthy(
        &self,
        peer_response: &Response,
        can_other_control_planes_be_reached: bool,
    ) -> bool {
        match peer_response.reason {
            Reason::UnhealthyBecausePeersResponse => false,
            Reason::UnhealthyBecauseNodeIsIsolated => can_other_control_planes_be_reached,
            Reason::HealthyBecauseErrorsThresholdNotReached
            | Reason::HealthyBecauseCrNotFound
            | Reason::HealthyBecausePeersResponse => true,
            Reason::HealthyBecauseMostPeersCantAccessApiServer => self.diagnostics_passed().await,
            Reason::HealthyBecauseNoPeersWereFound => {
                self.diagnostics_passed().await && can_other_control_planes_be_reached
            }
        }
    }

    /// All local diagnostics must pass: endpoint still reachable (if it was
    /// at start), kubelet answering, etcd up
    pub async fn diagnostics_passed(&self) -> bool {
        if self.is_endpoint_access_lost().await {
            error!(node = %self.node_name, "diagnostic failed: health endpoint no longer reachable");
            return false;
        }
        if !self.is_kubelet_running().await {
            error!(node = %self.node_name, "diagnostic failed: kubelet not answering");
            return false;
        }
        if !self.is_etcd_running().await {
            error!(node = %self.node_name, "diagnostic failed: etcd not reachable");
            return false;
        }
        true
    }

    /// Lost access counts only if the endpoint was reachable at start;
    /// otherwise the check is inconclusive and passes
    async fn is_endpoint_access_lost(&self) -> bool {
        if !self.was_endpoint_accessible_at_start {
            return false;
        }
        !self.is_endpoint_accessible().await
    }

    async fn is_endpoint_accessible(&self) -> bool {
        let Some(url) = &self.endpoint_health_check_url else {
            return true;
        };
        match self.http.get(url).send().await {
            Ok(_) => true,
            Err(err) => {
                warn!(%url, %err, "health endpoint not reachable");
                false
            }
        }
    }

    async fn is_kubelet_running(&self) -> bool {
        let url = format!("https://{}:{}/pods", self.node_name, KUBELET_PORT);
        match self.http.get(&url).send().await {
            Ok(_) => true,
            Err(err) => {
                warn!(node = %self.node_name, %err, "kubelet not answering");
                false
            }
        }
    }

    async fn is_etcd_running(&self) -> bool {
        match timeout(DIAGNOSTIC_TIMEOUT, TcpStream::connect(ETCD_ENDPOINT)).await {
            Ok(Ok(_)) => true,
            _ => {
                warn!(endpoint = ETCD_ENDPOINT, "etcd not reachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(role: Role) -> ControlPlaneManager {
        ControlPlaneManager {
            node_name: "cp-1".to_string(),
            role,
            endpoint_health_check_url: None,
            was_endpoint_accessible_at_start: false,
            http: reqwest::Client::new(),
        }
    }

    // With no endpoint URL and no baseline, diagnostics reduce to kubelet
    // and etcd probes; the decision table itself is what these tests pin.

    #[tokio::test]
    async fn test_unhealthy_peer_verdict_is_final() {
        let m = manager(Role::ControlPlane);
        assert!(
            !m.is_control_plane_healthy(
                &Response::unhealthy(Reason::UnhealthyBecausePeersResponse),
                true
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_isolation_defers_to_control_plane_reachability() {
        let m = manager(Role::ControlPlane);
        let isolated = Response::unhealthy(Reason::UnhealthyBecauseNodeIsIsolated);
        assert!(m.is_control_plane_healthy(&isolated, true).await);
        assert!(!m.is_control_plane_healthy(&isolated, false).await);
    }

    #[tokio::test]
    async fn test_healthy_peer_verdicts_short_circuit_diagnostics() {
        let m = manager(Role::ControlPlane);
        for reason in [
            Reason::HealthyBecauseErrorsThresholdNotReached,
            Reason::HealthyBecauseCrNotFound,
            Reason::HealthyBecausePeersResponse,
        ] {
            assert!(
                m.is_control_plane_healthy(&Response::healthy(reason), false)
                    .await,
                "reason {reason:?} must not require diagnostics"
            );
        }
    }

    #[tokio::test]
    async fn test_endpoint_loss_requires_baseline() {
        let mut m = manager(Role::ControlPlane);
        m.endpoint_health_check_url = Some("http://192.0.2.1:9/healthz".to_string());

        // Endpoint was never reachable: loss is inconclusive
        m.was_endpoint_accessible_at_start = false;
        assert!(!m.is_endpoint_access_lost().await);
    }
}

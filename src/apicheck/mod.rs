//! API connectivity checker
//!
//! Every node probes the control-plane API on a fixed interval. After
//! enough consecutive failures the node consults a random batch of peers;
//! if peers declare it unhealthy, or nobody is reachable at all, the node
//! self-fences through the reboot engine.

use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::{api::Api, Client, ResourceExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::controlplane::ControlPlaneManager;
use crate::crd::{RemediationRequest, Settings};
use crate::peerhealth::{HealthRequest, HealthStatus, PeerHealthClient};
use crate::peers::{PeerRegistry, Role};
use crate::reboot::Rebooter;

/// Why the node currently considers itself healthy or unhealthy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// The API error counter has not reached the threshold yet
    HealthyBecauseErrorsThresholdNotReached,
    /// The detector authored no request for this node at all: peers see
    /// none, and none was observed while the API was still reachable
    HealthyBecauseCrNotFound,
    /// All reachable peers reported this node healthy
    HealthyBecausePeersResponse,
    /// Peers answered but none of them could reach the API either;
    /// probably an API outage, not this node
    HealthyBecauseMostPeersCantAccessApiServer,
    /// Single-node deployment, nobody to ask
    HealthyBecauseNoPeersWereFound,
    /// A peer reported a remediation request naming this node
    UnhealthyBecausePeersResponse,
    /// No peer was reachable although the registry has peers: this node is
    /// network-partitioned
    UnhealthyBecauseNodeIsIsolated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub is_healthy: bool,
    pub reason: Reason,
}

impl Response {
    pub fn healthy(reason: Reason) -> Self {
        Self {
            is_healthy: true,
            reason,
        }
    }

    pub fn unhealthy(reason: Reason) -> Self {
        Self {
            is_healthy: false,
            reason,
        }
    }
}

/// Size of one consultation round: enough peers to form a quorum of the
/// registry, so an all-`ApiError` round is meaningful
pub(crate) fn batch_size(registry_size: usize) -> usize {
    quorum(registry_size).min(registry_size).max(1)
}

pub(crate) fn quorum(registry_size: usize) -> usize {
    registry_size / 2 + 1
}

/// Aggregate one round of peer answers.
///
/// `outcomes` holds one entry per queried peer, `None` for unreachable
/// peers. The registry size provides the quorum context.
pub fn classify_peer_outcomes(
    outcomes: &[Option<HealthStatus>],
    registry_size: usize,
) -> Response {
    if registry_size == 0 {
        return Response::healthy(Reason::HealthyBecauseNoPeersWereFound);
    }

    let reachable: Vec<HealthStatus> = outcomes.iter().flatten().copied().collect();

    if reachable.is_empty() {
        return Response::unhealthy(Reason::UnhealthyBecauseNodeIsIsolated);
    }
    if reachable.contains(&HealthStatus::Unhealthy) {
        return Response::unhealthy(Reason::UnhealthyBecausePeersResponse);
    }
    if reachable.contains(&HealthStatus::Healthy) {
        return Response::healthy(Reason::HealthyBecausePeersResponse);
    }

    // Every reachable peer failed to consult the API itself. The batch
    // covers a registry quorum, so this reads as an API outage rather than
    // a problem with this node.
    Response::healthy(Reason::HealthyBecauseMostPeersCantAccessApiServer)
}

/// Refine a peer verdict with this node's last coherent view of the
/// cluster store.
///
/// A peer answers `Healthy` whenever it finds no request naming this node,
/// which covers two distinct situations: the detector never authored one,
/// or one existed and has been resolved since. Only the node itself knows
/// which, from what it observed before losing API access.
pub fn refine_with_local_view(response: Response, request_was_observed: bool) -> Response {
    match response.reason {
        Reason::HealthyBecausePeersResponse if !request_was_observed => {
            Response::healthy(Reason::HealthyBecauseCrNotFound)
        }
        _ => response,
    }
}

pub struct ApiConnectivityCheck {
    client: Client,
    settings: Arc<Settings>,
    my_node_name: String,
    my_machine_name: String,
    peers: Arc<PeerRegistry>,
    peer_client: PeerHealthClient,
    control_plane: Arc<ControlPlaneManager>,
    rebooter: Option<Arc<dyn Rebooter>>,
    error_count: u32,
    /// Whether a request naming this node existed in the last view of the
    /// cluster store this node managed to read
    request_observed: bool,
}

impl ApiConnectivityCheck {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        settings: Arc<Settings>,
        my_node_name: &str,
        my_machine_name: &str,
        peers: Arc<PeerRegistry>,
        peer_client: PeerHealthClient,
        control_plane: Arc<ControlPlaneManager>,
        rebooter: Option<Arc<dyn Rebooter>>,
    ) -> Self {
        Self {
            client,
            settings,
            my_node_name: my_node_name.to_string(),
            my_machine_name: my_machine_name.to_string(),
            peers,
            peer_client,
            control_plane,
            rebooter,
            error_count: 0,
            request_observed: false,
        }
    }

    /// Probe the API forever; never returns
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.api_check_interval);
        loop {
            ticker.tick().await;

            if self.probe_api().await {
                if self.error_count > 0 {
                    info!("control-plane access restored");
                }
                self.error_count = 0;
                continue;
            }

            self.error_count += 1;
            if self.error_count < self.settings.max_api_error_threshold {
                let state = Response::healthy(Reason::HealthyBecauseErrorsThresholdNotReached);
                debug!(
                    errors = self.error_count,
                    threshold = self.settings.max_api_error_threshold,
                    reason = ?state.reason,
                    "control-plane probe failed"
                );
                continue;
            }

            warn!(
                errors = self.error_count,
                "control-plane unreachable beyond threshold, consulting peers"
            );
            let response = self.is_considered_healthy().await;
            if response.is_healthy {
                info!(reason = ?response.reason, "peers consider this node healthy");
                if matches!(
                    response.reason,
                    Reason::HealthyBecausePeersResponse | Reason::HealthyBecauseCrNotFound
                ) {
                    self.error_count = 0;
                }
            } else {
                error!(reason = ?response.reason, "this node is deemed unhealthy, self-fencing");
                self.trigger_reboot();
            }
        }
    }

    async fn probe_api(&mut self) -> bool {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let reachable = matches!(
            timeout(self.settings.api_server_timeout, nodes.get(&self.my_node_name)).await,
            Ok(Ok(_))
        );
        if reachable {
            self.record_request_observation().await;
        }
        reachable
    }

    /// While the API answers, keep track of whether a remediation request
    /// naming this node (or its machine) exists. Once access is lost this
    /// is the node's only way to tell "no request was ever authored" apart
    /// from "the request we saw has been resolved".
    async fn record_request_observation(&mut self) {
        let requests: Api<RemediationRequest> = Api::all(self.client.clone());
        if let Ok(Ok(list)) =
            timeout(self.settings.api_server_timeout, requests.list(&Default::default())).await
        {
            self.request_observed = list.iter().any(|request| {
                let name = request.name_any();
                name == self.my_node_name
                    || (!self.my_machine_name.is_empty() && name == self.my_machine_name)
            });
        }
    }

    async fn is_considered_healthy(&self) -> Response {
        let my_role = self.control_plane.role();
        let peer_response = self.consult_peers(my_role).await;

        match my_role {
            Role::Worker => peer_response,
            Role::ControlPlane => {
                let can_reach_others = self.can_reach_any_peer(Role::ControlPlane).await;
                let healthy = self
                    .control_plane
                    .is_control_plane_healthy(&peer_response, can_reach_others)
                    .await;
                Response {
                    is_healthy: healthy,
                    reason: peer_response.reason,
                }
            }
        }
    }

    /// One consultation round against peers of the opposite role, falling
    /// back to same-role peers in mixed deployments without any
    async fn consult_peers(&self, my_role: Role) -> Response {
        let mut role = my_role.opposite();
        if self.peers.size(role).await == 0 && self.peers.size(my_role).await > 0 {
            role = my_role;
        }

        let registry_size = self.peers.size(role).await;
        if registry_size == 0 {
            return Response::healthy(Reason::HealthyBecauseNoPeersWereFound);
        }

        let batch = self.peers.random_batch(role, batch_size(registry_size)).await;
        let request = HealthRequest {
            node_name: self.my_node_name.clone(),
            machine_name: self.my_machine_name.clone(),
        };

        let mut outcomes: Vec<Option<HealthStatus>> = join_all(
            batch
                .iter()
                .map(|peer| self.query_peer(peer, &request)),
        )
        .await;

        // Unreachable peers get one more chance within the round
        for (i, outcome) in outcomes.iter_mut().enumerate() {
            if outcome.is_none() {
                *outcome = self.query_peer(&batch[i], &request).await;
            }
        }

        refine_with_local_view(
            classify_peer_outcomes(&outcomes, registry_size),
            self.request_observed,
        )
    }

    async fn query_peer(
        &self,
        peer: &crate::peers::Peer,
        request: &HealthRequest,
    ) -> Option<HealthStatus> {
        match self.peer_client.is_healthy(peer, request).await {
            Ok(status) => Some(status),
            Err(err) => {
                debug!(peer = %peer.node_name, %err, "peer unreachable");
                None
            }
        }
    }

    /// Whether any peer of the given role answers at all. Vacuously true
    /// when the registry has none: absence of peers is not evidence of
    /// isolation.
    async fn can_reach_any_peer(&self, role: Role) -> bool {
        let size = self.peers.size(role).await;
        if size == 0 {
            return true;
        }
        let batch = self.peers.random_batch(role, batch_size(size)).await;
        let request = HealthRequest {
            node_name: self.my_node_name.clone(),
            machine_name: self.my_machine_name.clone(),
        };
        for peer in &batch {
            if self.query_peer(peer, &request).await.is_some() {
                return true;
            }
        }
        false
    }

    fn trigger_reboot(&self) {
        match &self.rebooter {
            Some(rebooter) => {
                if let Err(err) = rebooter.reboot() {
                    error!(%err, "self-fencing reboot failed");
                }
            }
            None => error!("no reboot mechanism available, cannot self-fence"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthStatus::{ApiError, Healthy, Unhealthy};

    #[test]
    fn test_any_unhealthy_peer_wins() {
        let outcomes = vec![Some(Healthy), Some(Unhealthy), None, Some(ApiError)];
        let response = classify_peer_outcomes(&outcomes, 5);
        assert!(!response.is_healthy);
        assert_eq!(response.reason, Reason::UnhealthyBecausePeersResponse);
    }

    #[test]
    fn test_all_reachable_healthy() {
        let outcomes = vec![Some(Healthy), Some(Healthy), None];
        let response = classify_peer_outcomes(&outcomes, 5);
        assert!(response.is_healthy);
        assert_eq!(response.reason, Reason::HealthyBecausePeersResponse);
    }

    #[test]
    fn test_quorum_of_api_errors_reads_as_api_outage() {
        // Registry of 5, quorum is 3: three peers answered, all ApiError
        let outcomes = vec![Some(ApiError), Some(ApiError), Some(ApiError)];
        let response = classify_peer_outcomes(&outcomes, 5);
        assert!(response.is_healthy, "an API outage must not trigger a reboot");
        assert_eq!(
            response.reason,
            Reason::HealthyBecauseMostPeersCantAccessApiServer
        );
    }

    #[test]
    fn test_zero_reachable_peers_means_isolation() {
        let outcomes = vec![None, None, None];
        let response = classify_peer_outcomes(&outcomes, 3);
        assert!(!response.is_healthy);
        assert_eq!(response.reason, Reason::UnhealthyBecauseNodeIsIsolated);
    }

    #[test]
    fn test_empty_registry_is_single_node() {
        let response = classify_peer_outcomes(&[], 0);
        assert!(response.is_healthy);
        assert_eq!(response.reason, Reason::HealthyBecauseNoPeersWereFound);
    }

    #[test]
    fn test_mixed_healthy_and_api_error_stays_healthy() {
        let outcomes = vec![Some(Healthy), Some(ApiError)];
        let response = classify_peer_outcomes(&outcomes, 4);
        assert!(response.is_healthy);
        assert_eq!(response.reason, Reason::HealthyBecausePeersResponse);
    }

    #[test]
    fn test_absent_request_refines_to_cr_not_found() {
        let peers_healthy = Response::healthy(Reason::HealthyBecausePeersResponse);

        // No request was ever observed: the detector authored none at all
        let refined = refine_with_local_view(peers_healthy, false);
        assert!(refined.is_healthy);
        assert_eq!(refined.reason, Reason::HealthyBecauseCrNotFound);

        // A request was seen before the API went away; peers no longer
        // finding one means it was resolved, not that it never existed
        assert_eq!(
            refine_with_local_view(peers_healthy, true).reason,
            Reason::HealthyBecausePeersResponse
        );
    }

    #[test]
    fn test_local_view_leaves_other_verdicts_alone() {
        for response in [
            Response::unhealthy(Reason::UnhealthyBecausePeersResponse),
            Response::unhealthy(Reason::UnhealthyBecauseNodeIsIsolated),
            Response::healthy(Reason::HealthyBecauseMostPeersCantAccessApiServer),
            Response::healthy(Reason::HealthyBecauseNoPeersWereFound),
        ] {
            assert_eq!(refine_with_local_view(response, false), response);
            assert_eq!(refine_with_local_view(response, true), response);
        }
    }

    #[test]
    fn test_batch_covers_quorum() {
        assert_eq!(quorum(5), 3);
        assert_eq!(quorum(1), 1);
        assert_eq!(batch_size(5), 3);
        assert_eq!(batch_size(1), 1);
        // Batch never exceeds the registry
        assert!(batch_size(2) <= 2);
    }

    // Property over every outcome mix: a reboot verdict requires either a
    // positive unhealthy answer or full unreachability
    #[test]
    fn test_reboot_requires_positive_evidence() {
        let statuses = [None, Some(Healthy), Some(Unhealthy), Some(ApiError)];
        for a in statuses {
            for b in statuses {
                for c in statuses {
                    let outcomes = vec![a, b, c];
                    let response = classify_peer_outcomes(&outcomes, 3);
                    if !response.is_healthy {
                        let any_unhealthy = outcomes.iter().flatten().any(|s| *s == Unhealthy);
                        let none_reachable = outcomes.iter().all(Option::is_none);
                        assert!(
                            any_unhealthy || none_reachable,
                            "unexpected reboot verdict for {outcomes:?}"
                        );
                    }
                }
            }
        }
    }
}
